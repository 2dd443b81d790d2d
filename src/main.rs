mod pivot;

use clap::Parser;

#[derive(Debug, Parser)]
#[command(
    name = "pivot",
    version,
    about = "Pivot - reverse-tunnel relay for services behind NAT"
)]
struct Cli {
    /// Path to Pivot config file (.toml/.yaml/.yml). If omitted, uses PIVOT_CONFIG; then auto-detects pivot.toml > pivot.yaml > pivot.yml from CWD; then falls back to the OS default path (Linux: /etc/pivot/pivot.toml; others: user config dir).
    #[arg(long, env = "PIVOT_CONFIG")]
    config: Option<std::path::PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    pivot::run(cli.config).await
}
