use std::process;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use jrl::{app, Config, Options};

fn main() {
    let options = Options::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let config = Config::from(options);
    if let Err(err) = app::run(&config) {
        eprintln!("{err:#}");
        process::exit(1);
    }
}
