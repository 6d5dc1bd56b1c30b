mod error;
mod logger;
mod opt;

use advisor_core::Engine;
use error::CliError;
use mongodb_client::ConnectionSummary;
use opt::AdvisorOpt;
use structopt::StructOpt;

#[tokio::main]
async fn main() {
    let opt = AdvisorOpt::from_args();
    logger::init(&opt);

    if let Err(err) = run(&opt).await {
        tracing::error!("{err}");
        std::process::exit(err.exit_code());
    }
}

async fn run(opt: &AdvisorOpt) -> Result<(), CliError> {
    let summary: ConnectionSummary = opt.url.parse()?;
    tracing::info!(
        hosts = ?summary.host_strings(),
        database = summary.database.as_str(),
        "connecting"
    );

    let client = mongodb_client::create(&opt.url).await?;
    let database = client.database(&summary.database);

    Engine::new(database, opt.options()).run().await?;

    Ok(())
}
