//! Fully connected layers built from [`HyperparamsConfig`].

use candle_core::{Module, Tensor};
use candle_nn::{Init, Linear};

use crate::config::{Activation, HyperparamsConfig, InitializerConfig, VarianceScalingMode};
use crate::error::Result;
use crate::params::ParamStore;

impl Activation {
    pub fn apply(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
        match self {
            Activation::None => Ok(xs.clone()),
            Activation::Relu => xs.relu(),
            Activation::Relu6 => xs.clamp(0f32, 6f32),
            Activation::Tanh => xs.tanh(),
        }
    }
}

/// Initializer for a `[fan_out, fan_in]` weight matrix.
pub fn weight_init(initializer: &InitializerConfig, fan_in: usize, fan_out: usize) -> Init {
    let (fan_in, fan_out) = (fan_in as f64, fan_out as f64);
    match *initializer {
        // candle has no truncated normal, the plain normal keeps mean and scale
        InitializerConfig::TruncatedNormal { mean, stddev }
        | InitializerConfig::RandomNormal { mean, stddev } => Init::Randn {
            mean,
            stdev: stddev,
        },
        InitializerConfig::VarianceScaling {
            factor,
            mode,
            uniform,
        } => {
            let n = match mode {
                VarianceScalingMode::FanIn => fan_in,
                VarianceScalingMode::FanOut => fan_out,
                VarianceScalingMode::FanAvg => (fan_in + fan_out) / 2.0,
            };
            if uniform {
                let limit = (3.0 * factor / n).sqrt();
                Init::Uniform {
                    lo: -limit,
                    up: limit,
                }
            } else {
                Init::Randn {
                    mean: 0.0,
                    stdev: (1.3 * factor / n).sqrt(),
                }
            }
        }
        InitializerConfig::GlorotNormal => Init::Randn {
            mean: 0.0,
            stdev: (2.0 / (fan_in + fan_out)).sqrt(),
        },
        InitializerConfig::GlorotUniform => {
            let limit = (6.0 / (fan_in + fan_out)).sqrt();
            Init::Uniform {
                lo: -limit,
                up: limit,
            }
        }
    }
}

/// Linear layer followed by an activation.
///
/// Weights live in the [`ParamStore`] under `{scope}.weight` / `{scope}.bias`;
/// variables already present under those names are reused, new ones are drawn
/// from the store's seeded generator.
#[derive(Debug, Clone)]
pub struct FullyConnected {
    linear: Linear,
    activation: Activation,
}

impl FullyConnected {
    /// `activation` overrides the one in `hyperparams` when given.
    pub fn new(
        in_dim: usize,
        out_dim: usize,
        hyperparams: &HyperparamsConfig,
        activation: Option<Activation>,
        store: &ParamStore,
        scope: &str,
    ) -> Result<Self> {
        let weight = store.get_or_init(
            &format!("{scope}.weight"),
            &[out_dim, in_dim],
            weight_init(&hyperparams.initializer, in_dim, out_dim),
        )?;
        let bias = store.get_or_init(&format!("{scope}.bias"), &[out_dim], Init::Const(0.0))?;
        if let Some(regularizer) = hyperparams.regularizer {
            store.add_regularizer(&format!("{scope}.weight"), regularizer)?;
        }
        Ok(Self {
            linear: Linear::new(weight, Some(bias)),
            activation: activation.unwrap_or(hyperparams.activation),
        })
    }

    pub fn weight(&self) -> &Tensor {
        self.linear.weight()
    }
}

impl Module for FullyConnected {
    fn forward(&self, xs: &Tensor) -> candle_core::Result<Tensor> {
        self.activation.apply(&self.linear.forward(xs)?)
    }
}
