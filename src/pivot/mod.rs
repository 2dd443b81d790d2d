pub mod admin;
pub mod app;
pub mod client;
pub mod config;
pub mod control;
pub mod logging;
pub mod net;
pub mod server;
pub mod swap;
pub mod telemetry;

pub async fn run(config_path: Option<std::path::PathBuf>) -> anyhow::Result<()> {
    app::run(config_path).await
}
