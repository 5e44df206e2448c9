pub const ALICE: &str = "alice@test";
pub const BOB: &str = "bob@test";
pub const ASSET: &str = "coin0#test";
