use sqlgate_daemon::{server, telemetry};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    telemetry::init_from_env();
    server::run().await
}
