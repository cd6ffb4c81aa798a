//! fit subcommand: trains NOD5 or GAP on synthetic captioned batches.
//!
//! Every synthetic image shows one class: its first region carries a feature
//! bump at the class index and every caption names the class. A working
//! model learns to put that class on that region.

use std::path::PathBuf;

use candle_core::{Device, Tensor};
use candle_wsod::config::{load_json, GapExperiment, LabelStrategem, Nod5Experiment, TrainConfig};
use candle_wsod::model::gap::{GapInputs, GapModel};
use candle_wsod::model::nod5::{Nod5Inputs, Nod5Model, Nod5Resources};
use candle_wsod::optim::TrainOptimizer;
use candle_wsod::params::{AssignmentMap, GlobalStep, ParamStore};
use candle_wsod::summary::Summaries;
use candle_wsod::vocab::tokenize;
use clap::{Args, ValueEnum};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Model family to train
#[derive(Clone, Copy, ValueEnum, Debug)]
pub enum FitModel {
    Nod5,
    Gap,
}

/// Arguments for the fit subcommand
#[derive(Args, Debug)]
pub struct FitArgs {
    /// Model family to train.
    #[arg(long, value_enum, default_value_t = FitModel::Nod5)]
    pub model: FitModel,

    /// Experiment configuration (JSON), defaults are used when omitted.
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Comma separated class names, replacing the configured vocabulary files.
    #[arg(long, value_delimiter = ',')]
    pub classes: Vec<String>,

    /// Regions per synthetic image.
    #[arg(long, default_value_t = 8)]
    pub num_regions: usize,

    /// Width of the synthetic region features.
    #[arg(long, default_value_t = 16)]
    pub feature_dims: usize,

    /// Number of training steps, overrides the configuration.
    #[arg(long)]
    pub steps: Option<u64>,

    /// Initialise variables from a safetensors checkpoint.
    #[arg(long)]
    pub init_from: Option<PathBuf>,

    /// Write the trained variables to a safetensors file.
    #[arg(long)]
    pub save: Option<PathBuf>,
}

struct SyntheticData {
    classes: Vec<String>,
    num_regions: usize,
    feature_dims: usize,
}

impl SyntheticData {
    /// `[B]` proposal counts, `[B, R, 4]` boxes (`[ymin, xmin, ymax, xmax]`),
    /// `[B, R, F]` features and the class shown by each image.
    fn regions(
        &self,
        batch: usize,
        rng: &mut StdRng,
        device: &Device,
    ) -> candle_wsod::Result<(Tensor, Tensor, Tensor, Vec<usize>)> {
        let (r, f) = (self.num_regions, self.feature_dims);
        let mut counts = Vec::with_capacity(batch);
        let mut boxes = Vec::with_capacity(batch * r * 4);
        let mut features = Vec::with_capacity(batch * r * f);
        let mut shown = Vec::with_capacity(batch);
        for _ in 0..batch {
            let class = rng.random_range(0..self.classes.len());
            counts.push(rng.random_range((r / 2).max(1)..=r) as u32);
            for region in 0..r {
                let ymin = rng.random::<f32>() * 0.5;
                let xmin = rng.random::<f32>() * 0.5;
                let ymax = (ymin + 0.1 + rng.random::<f32>() * 0.5).min(1.0);
                let xmax = (xmin + 0.1 + rng.random::<f32>() * 0.5).min(1.0);
                boxes.extend([ymin, xmin, ymax, xmax]);
                for dim in 0..f {
                    let bump = if region == 0 && dim == class % f { 1.0 } else { 0.0 };
                    features.push(bump + 0.1 * rng.random::<f32>());
                }
            }
            shown.push(class);
        }
        Ok((
            Tensor::from_vec(counts, batch, device)?,
            Tensor::from_vec(boxes, (batch, r, 4), device)?,
            Tensor::from_vec(features, (batch, r, f), device)?,
            shown,
        ))
    }

    fn caption(&self, class: usize) -> Vec<String> {
        tokenize(&format!("a photo of a {}", self.classes[class]))
    }

    fn nod5_batch(
        &self,
        batch: usize,
        rng: &mut StdRng,
        device: &Device,
    ) -> candle_wsod::Result<Nod5Inputs> {
        let (num_proposals, proposals, proposal_features, shown) = self.regions(batch, rng, device)?;
        Ok(Nod5Inputs {
            num_proposals,
            proposals,
            proposal_features,
            captions: shown.iter().map(|&c| self.caption(c)).collect(),
            object_texts: Some(shown.iter().map(|&c| vec![self.classes[c].clone()]).collect()),
        })
    }

    fn gap_batch(
        &self,
        batch: usize,
        first_id: i64,
        rng: &mut StdRng,
        device: &Device,
    ) -> candle_wsod::Result<GapInputs> {
        let (_, _, image_features, shown) = self.regions(batch, rng, device)?;
        let captions = shown
            .iter()
            .map(|&c| {
                let count = rng.random_range(1..=2);
                vec![self.caption(c); count]
            })
            .collect();
        Ok(GapInputs {
            image_ids: (first_id..first_id + batch as i64).collect(),
            image_features,
            captions,
        })
    }

    /// Every word the synthetic captions use.
    fn vocabulary(&self) -> Vec<String> {
        let mut words = tokenize("a photo of");
        for class in &self.classes {
            for token in tokenize(class) {
                if !words.contains(&token) {
                    words.push(token);
                }
            }
        }
        words
    }
}

/// Runs `train.num_steps` optimizer steps on the loss returned by `step_loss`.
fn train_loop<F>(
    train: &TrainConfig,
    store: &ParamStore,
    rng: &mut StdRng,
    mut step_loss: F,
) -> anyhow::Result<()>
where
    F: FnMut(u64, &mut StdRng) -> candle_wsod::Result<(Tensor, Summaries)>,
{
    let mut optimizer =
        TrainOptimizer::new(&train.optimizer, store.trainable_vars(), train.learning_rate)?;
    tracing::info!(
        "Training {} parameters for {} steps",
        store.num_parameters(),
        train.num_steps
    );

    let global_step = GlobalStep::new(0);
    let log_every = train.log_every_n_steps.max(1);
    while global_step.get() < train.num_steps {
        let (loss, mut summaries) = step_loss(global_step.get(), rng)?;
        summaries.scalar("loss/total_loss", &loss)?;
        optimizer.backward_step(&loss)?;

        let step = global_step.increment();
        if step % log_every == 0 || step == train.num_steps {
            summaries.emit(step);
            tracing::info!(
                step,
                loss = summaries.get_scalar("loss/total_loss").unwrap_or(f32::NAN),
                lr = optimizer.learning_rate(),
                "train"
            );
        }
    }
    Ok(())
}

fn restore(store: &ParamStore, args: &FitArgs) -> anyhow::Result<()> {
    if let Some(path) = &args.init_from {
        let names = store.names()?;
        store.init_from_checkpoint(path, &AssignmentMap::identity(&names))?;
    }
    Ok(())
}

fn save(store: &ParamStore, args: &FitArgs) -> anyhow::Result<()> {
    if let Some(path) = &args.save {
        store.save(path)?;
        tracing::info!("Saved {} variables to {}", store.names()?.len(), path.display());
    }
    Ok(())
}

fn fit_nod5(args: &FitArgs, device: &Device) -> anyhow::Result<()> {
    let experiment: Nod5Experiment = match &args.config {
        Some(path) => load_json(path)?,
        None => Nod5Experiment::default(),
    };
    let config = &experiment.model;
    let mut train = experiment.train.clone();
    train.num_steps = args.steps.unwrap_or(train.num_steps);
    let mut rng = StdRng::seed_from_u64(train.seed);

    let resources = if args.classes.is_empty() {
        Nod5Resources::load(config, &mut rng, device)?
    } else {
        if config.label_strategem != LabelStrategem::ExactMatch {
            anyhow::bail!(
                "--classes needs label_strategem exact_match, the configuration uses {}",
                config.label_strategem
            );
        }
        Nod5Resources {
            classes: args.classes.clone(),
            open_vocabulary: None,
        }
    };
    let data = SyntheticData {
        classes: resources.classes.clone(),
        num_regions: args.num_regions,
        feature_dims: args.feature_dims,
    };

    let store = ParamStore::seeded(device, train.seed);
    let model = Nod5Model::new(config, resources, args.feature_dims, &store)?;
    restore(&store, args)?;

    train_loop(&train, &store, &mut rng, |step, rng| {
        let inputs = data.nod5_batch(train.batch_size, rng, device)?;
        let predictions = model.predict(&inputs)?;
        let losses = model
            .loss(&inputs, &predictions, step)?
            .with_regularization(&store)?;
        Ok((losses.total()?, losses.summaries))
    })?;

    let inputs = data.nod5_batch(train.batch_size, &mut rng, device)?;
    let detections = model.detections(&model.predict(&inputs)?)?;
    for (stage, images) in detections.iter().enumerate() {
        let count: usize = images.iter().map(|d| d.num_detections).sum();
        tracing::info!(stage, detections = count, "evaluation batch");
    }
    save(&store, args)
}

fn fit_gap(args: &FitArgs, device: &Device) -> anyhow::Result<()> {
    let experiment: GapExperiment = match &args.config {
        Some(path) => load_json(path)?,
        None => GapExperiment::default(),
    };
    let config = &experiment.model;
    let mut train = experiment.train.clone();
    train.num_steps = args.steps.unwrap_or(train.num_steps);
    let mut rng = StdRng::seed_from_u64(train.seed);

    let store = ParamStore::seeded(device, train.seed);
    let (model, classes) = if args.classes.is_empty() {
        let model = GapModel::load(config, args.feature_dims, &mut rng, &store)?;
        let classes = candle_wsod::vocab::read_vocabulary(&config.vocabulary_file)?;
        (model, classes)
    } else {
        let data = SyntheticData {
            classes: args.classes.clone(),
            num_regions: args.num_regions,
            feature_dims: args.feature_dims,
        };
        let model = GapModel::new(
            config,
            &data.vocabulary(),
            None,
            args.feature_dims,
            &mut rng,
            &store,
        )?;
        (model, args.classes.clone())
    };
    let data = SyntheticData {
        classes,
        num_regions: args.num_regions,
        feature_dims: args.feature_dims,
    };
    restore(&store, args)?;

    let batch_size = train.batch_size;
    train_loop(&train, &store, &mut rng, |step, rng| {
        let first_id = (step as i64) * batch_size as i64;
        let inputs = data.gap_batch(batch_size, first_id, rng, device)?;
        let predictions = model.predict(&inputs, true)?;
        let losses = model.loss(&predictions)?.with_regularization(&store)?;
        let mut summaries = losses.summaries.clone();
        let accuracy = model.retrieval_accuracy(&predictions)?;
        summaries.scalar("metrics/retrieval_accuracy", &Tensor::new(accuracy, device)?)?;
        Ok((losses.total()?, summaries))
    })?;

    let inputs = data.gap_batch(batch_size, -(batch_size as i64), &mut rng, device)?;
    let accuracy = model.retrieval_accuracy(&model.predict(&inputs, false)?)?;
    tracing::info!(accuracy, "evaluation batch");
    save(&store, args)
}

pub fn run(args: FitArgs, device: &Device) -> anyhow::Result<()> {
    match args.model {
        FitModel::Nod5 => fit_nod5(&args, device),
        FitModel::Gap => fit_gap(&args, device),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_synthetic_boxes_are_min_max_ordered() {
        let data = SyntheticData {
            classes: vec!["dog".to_string(), "cat".to_string()],
            num_regions: 6,
            feature_dims: 4,
        };
        let mut rng = StdRng::seed_from_u64(3);
        let (counts, boxes, features, shown) = data.regions(5, &mut rng, &Device::Cpu).unwrap();
        assert_eq!(counts.dims(), &[5]);
        assert_eq!(features.dims(), &[5, 6, 4]);
        assert_eq!(shown.len(), 5);

        let boxes: Vec<Vec<Vec<f32>>> = boxes.to_vec3().unwrap();
        for [ymin, xmin, ymax, xmax] in boxes.iter().flatten().map(|b| [b[0], b[1], b[2], b[3]]) {
            assert!((0.0..0.5).contains(&ymin) && (0.0..0.5).contains(&xmin));
            assert!(ymax > ymin && ymax <= 1.0);
            assert!(xmax > xmin && xmax <= 1.0);
        }
    }
}
