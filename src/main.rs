use clap::Parser;
use mnist_logreg::cli::{run, Cli};

fn main() -> anyhow::Result<()> {
    env_logger::Builder::new()
        .filter_level(log::LevelFilter::Info)
        .parse_default_env()
        .init();

    run(Cli::parse())
}
