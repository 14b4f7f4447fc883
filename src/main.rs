use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

mod cli;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Train a class-conditional diffusion model on a labelled image folder
    Train {
        #[clap(flatten)]
        args: cli::train::TrainArgs,
    },
    /// Generate a grid of images from a trained checkpoint
    Sample {
        #[clap(flatten)]
        args: cli::sample::SampleArgs,
    },
}

fn main() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cli = Cli::parse();

    match &cli.command {
        Commands::Train { args } => {
            cli::train::handle_train(args)?;
        }
        Commands::Sample { args } => {
            cli::sample::handle_sample(args)?;
        }
    }

    Ok(())
}
