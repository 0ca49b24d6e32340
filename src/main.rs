use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = issuelock::config::Config::from_env()?;
    issuelock::serve(config, async {
        let _ = tokio::signal::ctrl_c().await;
        info!("ctrl-c received, draining connections");
    })
    .await
}
