//! Command line front end for the NOD5 detector and the GAP grounding model.

#[cfg(feature = "mkl")]
extern crate intel_mkl_src;

#[cfg(feature = "accelerate")]
extern crate accelerate_src;

mod cmd_check;
mod cmd_fit;
mod cmd_label;

use candle_core::{Device, Result};
use clap::{Parser, Subcommand};

use crate::cmd_check::CheckConfigArgs;
use crate::cmd_fit::FitArgs;
use crate::cmd_label::LabelArgs;

/// Select the compute device
pub fn device(cpu: bool) -> Result<Device> {
    if cpu {
        Ok(Device::Cpu)
    } else if candle_core::utils::cuda_is_available() {
        Ok(Device::new_cuda(0)?)
    } else if candle_core::utils::metal_is_available() {
        Ok(Device::new_metal(0)?)
    } else {
        #[cfg(all(target_os = "macos", target_arch = "aarch64"))]
        {
            tracing::info!("Running on CPU, to run on GPU(metal), build with `--features metal`");
        }
        #[cfg(not(all(target_os = "macos", target_arch = "aarch64")))]
        {
            tracing::info!("Running on CPU, to run on GPU, build with `--features cuda`");
        }
        Ok(Device::Cpu)
    }
}

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Run on CPU rather than on GPU.
    #[arg(long, global = true)]
    cpu: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Parse and validate a configuration file.
    CheckConfig(CheckConfigArgs),
    /// Extract image-level labels from captions.
    Label(LabelArgs),
    /// Train a model on synthetic batches.
    Fit(FitArgs),
}

pub fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::CheckConfig(args) => cmd_check::run(args),
        Command::Label(args) => {
            let device = device(cli.cpu)?;
            cmd_label::run(args, &device)
        }
        Command::Fit(args) => {
            let device = device(cli.cpu)?;
            tracing::info!("Using device: {:?}", device);
            cmd_fit::run(args, &device)
        }
    }
}
