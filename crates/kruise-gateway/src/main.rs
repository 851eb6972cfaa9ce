use anyhow::Result;

use kruise_gateway::telemetry;

#[tokio::main]
async fn main() -> Result<()> {
    let _telemetry = telemetry::init("kruise-gateway")?;
    kruise_gateway::server::run().await
}
