use gumdrop::Options;
use log::{error, info};

use ilp_settlement_iroha::{
    iroha::{load_keypair, IrohaClient, ToriiClient},
    run::{run_iroha_engine, EngineOpts},
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();

    let opts = EngineOpts::parse_args_default_or_exit();
    if opts.iroha_account_id.is_empty() || opts.asset_id.is_empty() || opts.keypair_name.is_empty()
    {
        error!("--iroha-account-id, --asset-id and --keypair-name are required");
        std::process::exit(1);
    }
    if opts.asset_scale > 18 {
        error!("--asset-scale must be between 0 and 18");
        std::process::exit(1);
    }

    let keypair = match load_keypair(&opts.keypair_name) {
        Ok(keypair) => keypair,
        Err(err) => {
            error!("Could not read key pair: {}", err);
            std::process::exit(1);
        }
    };

    let iroha_client = ToriiClient::new(
        opts.torii_url.clone(),
        opts.iroha_account_id.clone(),
        keypair,
    );

    // Make sure the provided Iroha account is correct by performing a simple query
    if let Err(err) = iroha_client.get_account(&opts.iroha_account_id).await {
        error!("Error querying Iroha: {}", err);
        std::process::exit(1);
    }

    let addr = opts.settlement_api_bind_address;
    run_iroha_engine(&opts, iroha_client)
        .await
        .expect("could not start the settlement engine");

    info!("Iroha settlement engine listening on: {}", addr);

    futures::future::pending().await
}
