use clap::Parser;
use dotenvy::dotenv;
use tracing::debug;

use external_db_operator::{logging, server, Cli};

#[tokio::main]
async fn main() -> eyre::Result<()> {
    dotenv().ok();
    let args = Cli::parse();

    logging::init()?;
    debug!(?args);

    server::launch(args).await
}
