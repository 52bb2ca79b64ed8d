use cbs_csi::config::Cli;
use clap::Parser;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    cbs_csi::init_tracing(cli.log_format);
    cbs_csi::run(cli).await
}
