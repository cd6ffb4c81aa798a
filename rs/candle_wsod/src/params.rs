//! Parameter store
//!
//! Every layer receives an explicit [`ParamStore`] and creates its weights
//! through [`ParamStore::get_or_init`]; nothing is registered globally.
//! Pretrained weights are copied in with [`ParamStore::init_from_checkpoint`],
//! driven by an [`AssignmentMap`] of exact checkpoint-to-store names.
//!
//! Fresh variables are sampled from the store's own seeded generator, so two
//! stores built with the same seed hold identical initial weights.

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};

use candle_core::{DType, Device, Tensor, Var};
use candle_nn::{Init, VarMap};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;

use crate::config::RegularizerConfig;
use crate::error::{Result, WsodError};

fn lock<T>(mutex: &Mutex<T>) -> Result<MutexGuard<'_, T>> {
    mutex
        .lock()
        .map_err(|_| candle_core::Error::Msg("parameter store lock poisoned".to_string()).into())
}

/// Named trainable parameters plus the regularizers attached to them.
pub struct ParamStore {
    varmap: VarMap,
    dtype: DType,
    device: Device,
    regularizers: Mutex<Vec<(String, RegularizerConfig)>>,
    rng: Mutex<StdRng>,
}

impl ParamStore {
    /// Store seeded with 0.
    pub fn new(device: &Device) -> Self {
        Self::seeded(device, 0)
    }

    pub fn seeded(device: &Device, seed: u64) -> Self {
        Self {
            varmap: VarMap::new(),
            dtype: DType::F32,
            device: device.clone(),
            regularizers: Mutex::new(Vec::new()),
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn varmap(&self) -> &VarMap {
        &self.varmap
    }

    /// Registers `value` as a new trainable variable and returns its tensor.
    pub fn insert(&self, name: &str, value: Tensor) -> Result<Tensor> {
        let mut vars = lock(self.varmap.data())?;
        if vars.contains_key(name) {
            return Err(WsodError::shape(
                "ParamStore::insert",
                format!("variable '{name}' already exists"),
            ));
        }
        let var = Var::from_tensor(&value.to_dtype(self.dtype)?)?;
        let tensor = var.as_tensor().clone();
        vars.insert(name.to_string(), var);
        Ok(tensor)
    }

    /// Returns variable `name`, sampling it from `init` when absent.
    ///
    /// An existing variable must already have `shape`.
    pub fn get_or_init(&self, name: &str, shape: &[usize], init: Init) -> Result<Tensor> {
        if let Some(existing) = self.get(name)? {
            if existing.dims() != shape {
                return Err(WsodError::shape(
                    "ParamStore::get_or_init",
                    format!("'{name}' is {:?}, requested {shape:?}", existing.dims()),
                ));
            }
            return Ok(existing);
        }

        let n: usize = shape.iter().product();
        let data: Vec<f32> = {
            let mut rng = lock(&self.rng)?;
            match init {
                Init::Const(value) => vec![value as f32; n],
                Init::Randn { mean, stdev } => (0..n)
                    .map(|_| (mean + stdev * rng.sample::<f64, _>(StandardNormal)) as f32)
                    .collect(),
                Init::Uniform { lo, up } => (0..n)
                    .map(|_| (lo + (up - lo) * rng.random::<f64>()) as f32)
                    .collect(),
                other => {
                    return Err(candle_core::Error::Msg(format!(
                        "unsupported initializer {other:?} for '{name}'"
                    ))
                    .into())
                }
            }
        };
        self.insert(name, Tensor::from_vec(data, shape, &self.device)?)
    }

    pub fn get(&self, name: &str) -> Result<Option<Tensor>> {
        let vars = lock(self.varmap.data())?;
        Ok(vars.get(name).map(|var| var.as_tensor().clone()))
    }

    /// Sorted variable names.
    pub fn names(&self) -> Result<Vec<String>> {
        let vars = lock(self.varmap.data())?;
        let mut names: Vec<String> = vars.keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    pub fn trainable_vars(&self) -> Vec<Var> {
        self.varmap.all_vars()
    }

    pub fn num_parameters(&self) -> usize {
        self.varmap
            .all_vars()
            .iter()
            .map(|var| var.as_tensor().elem_count())
            .sum()
    }

    /// Attaches a penalty to `name`; registering the same pair twice is a no-op.
    pub fn add_regularizer(&self, name: &str, regularizer: RegularizerConfig) -> Result<()> {
        let mut regularizers = lock(&self.regularizers)?;
        if !regularizers
            .iter()
            .any(|(n, r)| n == name && *r == regularizer)
        {
            regularizers.push((name.to_string(), regularizer));
        }
        Ok(())
    }

    /// Sum of all registered weight penalties, `None` when nothing is regularized.
    pub fn regularization_loss(&self) -> Result<Option<Tensor>> {
        let regularizers = lock(&self.regularizers)?.clone();
        let mut total: Option<Tensor> = None;
        for (name, regularizer) in regularizers {
            let weight = self.get(&name)?.ok_or_else(|| {
                WsodError::shape("regularization_loss", format!("no variable '{name}'"))
            })?;
            let penalty = match regularizer {
                RegularizerConfig::L1 { weight: scale } => (weight.abs()?.sum_all()? * scale)?,
                RegularizerConfig::L2 { weight: scale } => {
                    (weight.sqr()?.sum_all()? * (0.5 * scale))?
                }
            };
            total = Some(match total {
                Some(sum) => (sum + penalty)?,
                None => penalty,
            });
        }
        Ok(total)
    }

    /// Copies checkpoint tensors into existing variables.
    ///
    /// Every pair of `mapping` must resolve: a missing checkpoint tensor or
    /// store variable is an error, as is a shape mismatch. Returns the number
    /// of variables assigned.
    pub fn init_from_checkpoint(&self, path: &Path, mapping: &AssignmentMap) -> Result<usize> {
        let checkpoint_error = |message: String| WsodError::Checkpoint {
            path: path.display().to_string(),
            message,
        };
        let tensors = candle_core::safetensors::load(path, &self.device)?;
        let vars = lock(self.varmap.data())?;

        for (source, target) in mapping.iter() {
            let value = tensors
                .get(source)
                .ok_or_else(|| checkpoint_error(format!("tensor '{source}' not found")))?;
            let var = vars
                .get(target)
                .ok_or_else(|| checkpoint_error(format!("no variable '{target}' in store")))?;
            if value.dims() != var.dims() {
                return Err(WsodError::shape(
                    "init_from_checkpoint",
                    format!(
                        "'{source}' has shape {:?}, '{target}' expects {:?}",
                        value.dims(),
                        var.dims()
                    ),
                ));
            }
            var.set(&value.to_dtype(var.dtype())?)?;
            tracing::debug!(from = source, to = target, "assigned from checkpoint");
        }
        tracing::info!(
            "Initialized {} variables from {}",
            mapping.len(),
            path.display()
        );
        Ok(mapping.len())
    }

    /// Writes all variables to a safetensors file.
    pub fn save(&self, path: &Path) -> Result<()> {
        let vars = lock(self.varmap.data())?;
        let tensors: HashMap<String, Tensor> = vars
            .iter()
            .map(|(name, var)| (name.clone(), var.as_tensor().clone()))
            .collect();
        candle_core::safetensors::save(&tensors, path)?;
        Ok(())
    }
}

/// Explicit checkpoint-name to store-name table.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AssignmentMap {
    pairs: Vec<(String, String)>,
}

impl AssignmentMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn assign(mut self, source: impl Into<String>, target: impl Into<String>) -> Self {
        self.pairs.push((source.into(), target.into()));
        self
    }

    /// Maps every name onto itself.
    pub fn identity<S: AsRef<str>>(names: &[S]) -> Self {
        names
            .iter()
            .map(|name| (name.as_ref().to_string(), name.as_ref().to_string()))
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.pairs.iter().map(|(s, t)| (s.as_str(), t.as_str()))
    }

    pub fn len(&self) -> usize {
        self.pairs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }
}

impl FromIterator<(String, String)> for AssignmentMap {
    fn from_iter<I: IntoIterator<Item = (String, String)>>(iter: I) -> Self {
        Self {
            pairs: iter.into_iter().collect(),
        }
    }
}

/// Training step counter owned by the training loop.
#[derive(Debug, Default)]
pub struct GlobalStep(AtomicU64);

impl GlobalStep {
    pub fn new(start: u64) -> Self {
        Self(AtomicU64::new(start))
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::SeqCst)
    }

    /// Advances the counter, returning the new value.
    pub fn increment(&self) -> u64 {
        self.0.fetch_add(1, Ordering::SeqCst) + 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insert_and_regularization() {
        let store = ParamStore::new(&Device::Cpu);
        let w = Tensor::new(&[[1f32, -2.0], [0.5, 0.0]], &Device::Cpu).unwrap();
        store.insert("fc/weight", w.clone()).unwrap();
        assert!(store.insert("fc/weight", w).is_err());
        assert_eq!(store.names().unwrap(), vec!["fc/weight".to_string()]);
        assert_eq!(store.num_parameters(), 4);

        assert!(store.regularization_loss().unwrap().is_none());
        store
            .add_regularizer("fc/weight", RegularizerConfig::L1 { weight: 0.1 })
            .unwrap();
        store
            .add_regularizer("fc/weight", RegularizerConfig::L2 { weight: 1.0 })
            .unwrap();
        let loss: f32 = store
            .regularization_loss()
            .unwrap()
            .unwrap()
            .to_scalar()
            .unwrap();
        // l1: 0.1 * 3.5, l2: 0.5 * 5.25
        assert!((loss - (0.35 + 2.625)).abs() < 1e-5);
    }

    #[test]
    fn test_seeded_initialization() {
        let init = Init::Randn {
            mean: 0.0,
            stdev: 1.0,
        };
        let sample = |seed: u64| -> Vec<f32> {
            let store = ParamStore::seeded(&Device::Cpu, seed);
            store
                .get_or_init("w", &[2, 3], init)
                .unwrap()
                .flatten_all()
                .unwrap()
                .to_vec1()
                .unwrap()
        };
        assert_eq!(sample(3), sample(3));
        assert_ne!(sample(3), sample(4));

        let store = ParamStore::new(&Device::Cpu);
        let bias: Vec<f32> = store
            .get_or_init("b", &[3], Init::Const(0.5))
            .unwrap()
            .to_vec1()
            .unwrap();
        assert_eq!(bias, vec![0.5; 3]);
        let again: Vec<f32> = store
            .get_or_init("b", &[3], Init::Const(9.0))
            .unwrap()
            .to_vec1()
            .unwrap();
        assert_eq!(again, bias);
        assert!(matches!(
            store.get_or_init("b", &[4], Init::Const(0.0)),
            Err(WsodError::Shape { .. })
        ));

        let uniform: Vec<f32> = store
            .get_or_init("u", &[50], Init::Uniform { lo: -0.1, up: 0.1 })
            .unwrap()
            .to_vec1()
            .unwrap();
        assert!(uniform.iter().all(|x| (-0.1..=0.1).contains(x)));
    }

    #[test]
    fn test_duplicate_regularizer_counts_once() {
        let store = ParamStore::new(&Device::Cpu);
        store
            .insert("w", Tensor::new(&[2f32], &Device::Cpu).unwrap())
            .unwrap();
        for _ in 0..2 {
            store
                .add_regularizer("w", RegularizerConfig::L2 { weight: 1.0 })
                .unwrap();
        }
        let loss: f32 = store
            .regularization_loss()
            .unwrap()
            .unwrap()
            .to_scalar()
            .unwrap();
        assert!((loss - 2.0).abs() < 1e-6);
    }

    #[test]
    fn test_init_from_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ckpt.safetensors");
        let mut tensors = HashMap::new();
        tensors.insert(
            "backbone/fc/weight".to_string(),
            Tensor::new(&[[7f32, 8.0]], &Device::Cpu).unwrap(),
        );
        tensors.insert(
            "backbone/other".to_string(),
            Tensor::new(&[1f32, 2.0, 3.0], &Device::Cpu).unwrap(),
        );
        candle_core::safetensors::save(&tensors, &path).unwrap();

        let store = ParamStore::new(&Device::Cpu);
        store
            .insert("midn/fc/weight", Tensor::zeros((1, 2), DType::F32, &Device::Cpu).unwrap())
            .unwrap();

        let mapping = AssignmentMap::new().assign("backbone/fc/weight", "midn/fc/weight");
        assert_eq!(store.init_from_checkpoint(&path, &mapping).unwrap(), 1);
        let value: Vec<Vec<f32>> = store
            .get("midn/fc/weight")
            .unwrap()
            .unwrap()
            .to_vec2()
            .unwrap();
        assert_eq!(value, vec![vec![7.0, 8.0]]);

        let missing = AssignmentMap::new().assign("backbone/absent", "midn/fc/weight");
        assert!(matches!(
            store.init_from_checkpoint(&path, &missing),
            Err(WsodError::Checkpoint { .. })
        ));

        let mismatched = AssignmentMap::new().assign("backbone/other", "midn/fc/weight");
        assert!(matches!(
            store.init_from_checkpoint(&path, &mismatched),
            Err(WsodError::Shape { .. })
        ));
    }

    #[test]
    fn test_save_roundtrip_through_checkpoint() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store.safetensors");
        let store = ParamStore::new(&Device::Cpu);
        store
            .insert("a", Tensor::new(&[1f32, 2.0], &Device::Cpu).unwrap())
            .unwrap();
        store.save(&path).unwrap();

        let restored = ParamStore::new(&Device::Cpu);
        restored
            .insert("a", Tensor::zeros(2, DType::F32, &Device::Cpu).unwrap())
            .unwrap();
        let names = restored.names().unwrap();
        restored
            .init_from_checkpoint(&path, &AssignmentMap::identity(&names))
            .unwrap();
        let a: Vec<f32> = restored.get("a").unwrap().unwrap().to_vec1().unwrap();
        assert_eq!(a, vec![1.0, 2.0]);
    }

    #[test]
    fn test_global_step() {
        let step = GlobalStep::new(5);
        assert_eq!(step.get(), 5);
        assert_eq!(step.increment(), 6);
        assert_eq!(step.get(), 6);
    }
}
