use anyhow::Context;

use api_gateway::{ApiGatewayConfig, ApiGatewayServer};
use nimbus_shared::logging::init_logging;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let config = ApiGatewayConfig::from_env().context("configuration error")?;
    init_logging(&config.logging).context("failed to initialize logging")?;

    let server = ApiGatewayServer::new(config)
        .await
        .context("failed to initialize gateway")?;
    server.run().await.context("gateway exited with error")?;

    Ok(())
}
