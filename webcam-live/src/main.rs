mod capture;
mod config;
mod error;
mod http;
mod service;
mod signal;
mod state;
mod workspace;

use std::process::ExitCode;

use clap::Parser;

use config::{Args, Config};
use error::Error;
use service::Service;
use signal::Shutdown;

#[tokio::main]
async fn main() -> ExitCode {
    init_logger();

    match run(Args::parse()).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!("{}", err);
            ExitCode::FAILURE
        }
    }
}

async fn run(args: Args) -> Result<(), Error> {
    let config = Config::resolve(args)?;

    let shutdown = Shutdown::new();
    signal::init(shutdown.clone()).map_err(Error::Signal)?;

    let service = Service::start(config).await?;
    service.run(shutdown).await
}

fn init_logger() {
    let mut builder = pretty_env_logger::formatted_builder();
    builder.filter_level(log::LevelFilter::Info);

    if let Ok(filters) = std::env::var("RUST_LOG") {
        builder.parse_filters(&filters);
    }

    builder.init();
}
