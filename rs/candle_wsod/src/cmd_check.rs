//! check-config subcommand: parse, validate and echo a configuration.

use std::path::{Path, PathBuf};

use candle_wsod::config::{
    load_json, GapConfig, GapExperiment, Nod5Config, Nod5Experiment, Validate,
};
use clap::{Args, ValueEnum};
use serde::de::DeserializeOwned;
use serde::Serialize;

/// Which configuration schema a file follows
#[derive(Clone, Copy, ValueEnum, Debug)]
pub enum ConfigKind {
    Nod5,
    Gap,
    Nod5Experiment,
    GapExperiment,
}

/// Arguments for the check-config subcommand
#[derive(Args, Debug)]
pub struct CheckConfigArgs {
    /// Configuration file (JSON).
    pub path: PathBuf,

    /// Schema of the file.
    #[arg(long, value_enum, default_value_t = ConfigKind::Nod5Experiment)]
    pub kind: ConfigKind,
}

/// Loads `path` as `T` and prints it with every default filled in.
fn check<T: DeserializeOwned + Validate + Serialize>(path: &Path) -> anyhow::Result<()> {
    let config: T = load_json(path)?;
    println!("{}", serde_json::to_string_pretty(&config)?);
    Ok(())
}

pub fn run(args: CheckConfigArgs) -> anyhow::Result<()> {
    match args.kind {
        ConfigKind::Nod5 => check::<Nod5Config>(&args.path)?,
        ConfigKind::Gap => check::<GapConfig>(&args.path)?,
        ConfigKind::Nod5Experiment => check::<Nod5Experiment>(&args.path)?,
        ConfigKind::GapExperiment => check::<GapExperiment>(&args.path)?,
    }
    tracing::info!("{} is a valid {:?} configuration", args.path.display(), args.kind);
    Ok(())
}
