use crate::backends::redis::IrohaLedgerRedisStoreBuilder;
use crate::engine::IrohaLedgerSettlementEngine;
use crate::iroha::IrohaClient;

use gumdrop::Options;
use ilp_settlement_core::create_settlement_engine_filter;
use redis_crate::IntoConnectionInfo;
use std::net::SocketAddr;
use std::time::Duration;
use url::Url;

#[derive(Debug, Options)]
pub struct EngineOpts {
    #[options(help = "print this help message")]
    pub help: bool,

    #[options(help = "The Iroha Torii URL", default = "http://localhost:50051")]
    pub torii_url: Url,

    #[options(help = "The connector's URL", default = "http://localhost:7771")]
    pub connector_url: Url,

    #[options(help = "This engine's Iroha account id (name@domain)")]
    pub iroha_account_id: String,

    #[options(
        help = "Path prefix of the hex-encoded key files (<prefix>.priv and <prefix>.pub)"
    )]
    pub keypair_name: String,

    #[options(help = "The asset to settle with (code#domain)")]
    pub asset_id: String,

    #[options(help = "The number of decimals the asset amounts use", default = "2")]
    pub asset_scale: u8,

    #[options(help = "The store's URL", default = "redis://127.0.0.1:6379")]
    pub redis_url: String,

    #[options(help = "The api's address", default = "127.0.0.1:3000")]
    pub settlement_api_bind_address: SocketAddr,

    #[options(
        help = "How frequently to poll Iroha for incoming transfers (in ms)",
        default = "1000"
    )]
    pub poll_frequency: u64,
}

pub async fn run_iroha_engine<C>(opts: &EngineOpts, iroha_client: C) -> anyhow::Result<()>
where
    C: IrohaClient + Send + Sync + 'static,
{
    let store = IrohaLedgerRedisStoreBuilder::new(opts.redis_url.as_str().into_connection_info()?)
        .connect()
        .await
        .expect("could not connect to store");

    let engine = IrohaLedgerSettlementEngine::new(
        store,
        iroha_client,
        opts.asset_id.clone(),
        opts.asset_scale,
        opts.connector_url.clone(),
    );
    engine.spawn(Duration::from_millis(opts.poll_frequency));

    let api = create_settlement_engine_filter(engine);
    tokio::spawn(warp::serve(api).bind(opts.settlement_api_bind_address));
    Ok(())
}
