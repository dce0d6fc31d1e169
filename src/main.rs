use std::path::PathBuf;

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use tracing::info;

use fallwatch::config::{InferConfig, TrainConfig};
use fallwatch::{infer, train};

#[derive(Parser)]
#[command(
    name = "fallwatch",
    about = "Spatiotemporal fall classification over recorded pose streams",
    version
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Train the window classifier from per-class pose/object recordings
    Train {
        /// JSON config; unset fields keep their defaults
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Classify sliding windows of a recorded stream
    Infer {
        /// JSON config; unset fields keep their defaults
        #[arg(long)]
        config: Option<PathBuf>,
        /// Checkpoint record, e.g. outputs/models/best
        #[arg(long)]
        model: Option<PathBuf>,
        /// Pose stream (JSON or JSONL file, or a directory of them)
        #[arg(long)]
        pose: Option<PathBuf>,
        /// Object detection stream aligned with the pose stream
        #[arg(long)]
        objects: Option<PathBuf>,
        /// Class list file, for checkpoints without metadata
        #[arg(long)]
        classes: Option<PathBuf>,
        /// Write per-window predictions to this CSV
        #[arg(long)]
        out: Option<PathBuf>,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    match cli.command {
        Command::Train { config } => {
            let cfg = match config {
                Some(path) => TrainConfig::load(&path)?,
                None => TrainConfig::default(),
            };
            train::train(&cfg)
        }
        Command::Infer { config, model, pose, objects, classes, out } => {
            let mut cfg = match config {
                Some(path) => InferConfig::load(&path)?,
                None => InferConfig::default(),
            };
            if let Some(model) = model {
                cfg.model_path = model;
            }
            if let Some(pose) = pose {
                cfg.pose_json = pose;
            }
            if let Some(objects) = objects {
                cfg.object_json = Some(objects);
            }
            if let Some(classes) = classes {
                cfg.classes_path = Some(classes);
            }
            if let Some(out) = out {
                cfg.out_csv = Some(out);
            }
            if cfg.pose_json.as_os_str().is_empty() {
                bail!("no pose stream given; pass --pose or set pose_json in the config");
            }
            let predictions = infer::run(&cfg)?;
            info!(windows = predictions.len(), "inference finished");
            Ok(())
        }
    }
}
