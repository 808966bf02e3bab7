use std::path::PathBuf;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};

use mvit_train::config::RunConfig;
use mvit_train::launcher;
use mvit_train::logging::{self, LogFormat};

#[derive(Parser)]
#[command(
    name = "mvit-train",
    about = "Self-supervised Vision Transformer training with a momentum teacher"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Train a backbone and evaluate it with KNN
    Train(RunArgs),
    /// Print the resolved configuration and exit
    ShowConfig(RunArgs),
}

#[derive(Args)]
struct RunArgs {
    /// TOML or JSON config file; CLI flags override its values
    #[arg(long)]
    config: Option<PathBuf>,

    /// Log level used when RUST_LOG is unset
    #[arg(long, default_value = "info")]
    log_level: String,

    #[command(flatten)]
    overrides: RunConfig,
}

impl RunArgs {
    /// Config file (explicit or default) merged with the CLI flags.
    fn run_config(&self) -> anyhow::Result<RunConfig> {
        let mut run = match &self.config {
            Some(path) => RunConfig::load_from(path)
                .with_context(|| format!("failed to load {}", path.display()))?,
            None => RunConfig::load_default()?,
        };
        run.merge(&self.overrides);
        Ok(run)
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::Train(args) => {
            logging::init(&args.log_level, LogFormat::from_env())?;
            let run = args.run_config()?;
            let resolved = run.resolve()?;
            tracing::info!(
                method = %resolved.trainer.method,
                arch = %resolved.trainer.arch,
                dataset = %resolved.dataset,
                world_size = resolved.trainer.world_size,
                name = %resolved.name,
                "starting run"
            );
            let history = launcher::launch(&resolved, &run)?;
            if let Some(last) = history.last() {
                println!(
                    "epoch {}: top1 {:.2}% top5 {:.2}%",
                    last.epoch, last.top1, last.top5
                );
            }
        }
        Command::ShowConfig(args) => {
            let run = args.run_config()?;
            let resolved = run.resolve()?;
            println!("{}", serde_json::to_string_pretty(&resolved.trainer)?);
            println!(
                "dataset = {} ({}), events = {}",
                resolved.dataset,
                resolved.data_path.display(),
                resolved.board_path.join(&resolved.name).display()
            );
        }
    }

    Ok(())
}
