use structopt::StructOpt;
use tracing::info;

use notary_server::{init_tracing, run_server, CliFields, NotaryServerProperties};

#[tokio::main]
async fn main() {
    let cli_fields = CliFields::from_args();
    let config = NotaryServerProperties::new(&cli_fields);

    if let Err(e) = init_tracing() {
        eprintln!("failed to set up tracing: {e}");
        std::process::exit(1);
    }
    info!("noSandbox {}", config.no_sandbox);

    if let Err(e) = run_server(&config).await {
        tracing::error!("{e}");
        std::process::exit(1);
    }
}
