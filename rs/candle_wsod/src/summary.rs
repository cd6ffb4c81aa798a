//! Named scalar and histogram summaries.
//!
//! Models record into a [`Summaries`] value that travels with their outputs;
//! the training loop decides when to [`Summaries::emit`] them to the log.

use std::collections::BTreeMap;

use candle_core::{DType, Result, Tensor};

/// Statistics of a tensor, used as a compact histogram.
#[derive(Debug, Clone, PartialEq)]
pub struct TensorStats {
    pub shape: Vec<usize>,
    pub min: f32,
    pub max: f32,
    pub mean: f32,
    pub sum: f32,
}

impl TensorStats {
    pub fn from_tensor(tensor: &Tensor) -> Result<Self> {
        let shape = tensor.dims().to_vec();
        let data: Vec<f32> = tensor.flatten_all()?.to_dtype(DType::F32)?.to_vec1()?;

        let min = data.iter().cloned().fold(f32::INFINITY, f32::min);
        let max = data.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
        let sum: f32 = data.iter().sum();
        let mean = if data.is_empty() {
            0.0
        } else {
            sum / data.len() as f32
        };

        Ok(Self {
            shape,
            min,
            max,
            mean,
            sum,
        })
    }
}

#[derive(Debug, Clone, Default)]
pub struct Summaries {
    scalars: BTreeMap<String, f32>,
    histograms: BTreeMap<String, TensorStats>,
}

impl Summaries {
    /// Records a scalar; tensors with more than one element are averaged.
    pub fn scalar(&mut self, name: impl Into<String>, value: &Tensor) -> Result<()> {
        let value = value.to_dtype(DType::F32)?.mean_all()?.to_scalar::<f32>()?;
        self.scalars.insert(name.into(), value);
        Ok(())
    }

    pub fn histogram(&mut self, name: impl Into<String>, value: &Tensor) -> Result<()> {
        self.histograms
            .insert(name.into(), TensorStats::from_tensor(value)?);
        Ok(())
    }

    pub fn get_scalar(&self, name: &str) -> Option<f32> {
        self.scalars.get(name).copied()
    }

    pub fn get_histogram(&self, name: &str) -> Option<&TensorStats> {
        self.histograms.get(name)
    }

    pub fn scalars(&self) -> impl Iterator<Item = (&str, f32)> {
        self.scalars.iter().map(|(k, v)| (k.as_str(), *v))
    }

    pub fn merge(&mut self, other: Summaries) {
        self.scalars.extend(other.scalars);
        self.histograms.extend(other.histograms);
    }

    pub fn emit(&self, step: u64) {
        for (name, value) in &self.scalars {
            tracing::debug!(step, summary = name.as_str(), value = *value, "scalar");
        }
        for (name, stats) in &self.histograms {
            tracing::debug!(
                step,
                summary = name.as_str(),
                min = stats.min,
                max = stats.max,
                mean = stats.mean,
                "histogram"
            );
        }
    }
}
