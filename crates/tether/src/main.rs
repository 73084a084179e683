mod tether;

use clap::Parser;

#[derive(Debug, Parser)]
#[command(
    name = "tether",
    version,
    about = "Tether - reverse tunnel server and client"
)]
struct Cli {
    /// Path to the config file (.toml/.yaml/.yml). If omitted, uses TETHER_CONFIG; then auto-detects tether.toml > tether.yaml > tether.yml from CWD; then falls back to the OS default path (Linux: /etc/tether/tether.toml; others: user config dir).
    #[arg(long, env = "TETHER_CONFIG")]
    config: Option<std::path::PathBuf>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    tether::run(cli.config).await
}
