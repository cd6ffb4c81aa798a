//! label subcommand: image-level labels extracted from captions.

use std::path::PathBuf;

use candle_core::Device;
use candle_wsod::config::{load_json, Nod5Config};
use candle_wsod::labels::POSITIVE_LABEL_THRESHOLD;
use candle_wsod::model::nod5::{Nod5Model, Nod5Resources};
use candle_wsod::params::ParamStore;
use candle_wsod::vocab::tokenize;
use clap::Args;
use rand::rngs::StdRng;
use rand::SeedableRng;

/// Arguments for the label subcommand
#[derive(Args, Debug)]
pub struct LabelArgs {
    /// Detector configuration (JSON) naming the class and open vocabulary files.
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Captions to label.
    #[arg(required = true)]
    pub captions: Vec<String>,

    /// Seed for out-of-vocabulary embeddings and classifier weights.
    #[arg(long, default_value_t = 0)]
    pub seed: u64,
}

pub fn run(args: LabelArgs, device: &Device) -> anyhow::Result<()> {
    let config: Nod5Config = match &args.config {
        Some(path) => load_json(path)?,
        None => Nod5Config::default(),
    };
    let mut rng = StdRng::seed_from_u64(args.seed);
    let resources = Nod5Resources::load(&config, &mut rng, device)?;
    tracing::info!(
        "Labelling {} captions with {} classes ({})",
        args.captions.len(),
        resources.classes.len(),
        config.label_strategem
    );

    // Only the caption classifier has weights, and those are untrained here.
    let store = ParamStore::seeded(device, args.seed);
    let model = Nod5Model::new(&config, resources, 1, &store)?;

    let captions: Vec<Vec<String>> = args.captions.iter().map(|c| tokenize(c)).collect();
    let labels: Vec<Vec<f32>> = model.text_labels(&captions, device)?.to_vec2()?;

    for (caption, row) in args.captions.iter().zip(labels) {
        let positives: Vec<String> = row
            .iter()
            .enumerate()
            .filter(|(_, &p)| p as f64 > POSITIVE_LABEL_THRESHOLD)
            .map(|(c, p)| format!("{} ({p:.2})", model.class_names()[c]))
            .collect();
        if positives.is_empty() {
            println!("{caption}: -");
        } else {
            println!("{caption}: {}", positives.join(", "));
        }
    }
    Ok(())
}
