//! Multiple instance detection network.
//!
//! Two projections of the region features score every `(region, class)`
//! pair. The selection branch is normalised over the valid regions of each
//! image (`proba_r_given_c`), the classification branch is pooled with those
//! weights into image-level class logits.

use candle_core::{Device, Module, Tensor};

use crate::config::{Activation, AttentionType, HyperparamsConfig, Nod5Config};
use crate::error::{Result, WsodError};
use crate::hyperparams::FullyConnected;
use crate::masked::{masked_softmax, masked_sum, sequence_mask};
use crate::params::ParamStore;

/// Outputs of one MIDN forward pass.
#[derive(Debug, Clone)]
pub struct MidnOutput {
    /// `[B, C]`
    pub class_logits: Tensor,
    /// `[B, R, C]`, `sigmoid(class_logits) * proba_r_given_c`
    pub proposal_scores: Tensor,
    /// `[B, R, C]`, sums to one over valid regions, zero on padding
    pub proba_r_given_c: Tensor,
    /// `[H, C]`, latent attention only
    pub proba_h_given_c: Option<Tensor>,
}

#[derive(Debug, Clone)]
enum SelectionBranch {
    PerClass(FullyConnected),
    PerClassTanh {
        hidden: FullyConnected,
        output: FullyConnected,
    },
    Latent {
        proba_r_given_h: FullyConnected,
        proba_h_given_c: FullyConnected,
        use_sigmoid: bool,
    },
}

#[derive(Debug, Clone)]
pub struct MidnNetwork {
    selection: SelectionBranch,
    classification: FullyConnected,
    feature_dims: usize,
    num_classes: usize,
}

fn identity(n: usize, device: &Device) -> candle_core::Result<Tensor> {
    let data: Vec<f32> = (0..n * n)
        .map(|i| if i / n == i % n { 1.0 } else { 0.0 })
        .collect();
    Tensor::from_vec(data, (n, n), device)
}

impl MidnNetwork {
    pub fn new(
        config: &Nod5Config,
        feature_dims: usize,
        num_classes: usize,
        store: &ParamStore,
    ) -> Result<Self> {
        let hp = &config.fc_hyperparams;
        let linear = Some(Activation::None);
        let fc = |in_dim, out_dim, activation, scope: &str| {
            FullyConnected::new(in_dim, out_dim, hp, activation, store, scope)
        };

        let selection = match config.attention_type {
            AttentionType::PerClass => {
                SelectionBranch::PerClass(fc(feature_dims, num_classes, linear, "midn/proba_r_given_c")?)
            }
            AttentionType::PerClassTanh => SelectionBranch::PerClassTanh {
                hidden: fc(
                    feature_dims,
                    config.tanh_hiddens,
                    Some(Activation::Tanh),
                    "midn/tanh_output",
                )?,
                output: fc(config.tanh_hiddens, num_classes, linear, "midn/proba_r_given_c")?,
            },
            AttentionType::Latent => SelectionBranch::Latent {
                proba_r_given_h: fc(
                    feature_dims,
                    config.num_latent_factors,
                    linear,
                    "midn/proba_r_given_h",
                )?,
                proba_h_given_c: fc(
                    num_classes,
                    config.num_latent_factors,
                    linear,
                    "midn/proba_h_given_c",
                )?,
                use_sigmoid: config.proba_h_use_sigmoid,
            },
        };
        let classification = fc(feature_dims, num_classes, linear, "midn/proba_c_given_r")?;

        Ok(Self {
            selection,
            classification,
            feature_dims,
            num_classes,
        })
    }

    /// Convenience constructor with default hyperparameters.
    pub fn per_class(feature_dims: usize, num_classes: usize, store: &ParamStore) -> Result<Self> {
        let config = Nod5Config {
            fc_hyperparams: HyperparamsConfig::default(),
            attention_type: AttentionType::PerClass,
            ..Nod5Config::default()
        };
        Self::new(&config, feature_dims, num_classes, store)
    }

    pub fn num_classes(&self) -> usize {
        self.num_classes
    }

    /// `num_proposals [B]`, `features [B, R, D]`.
    pub fn forward(&self, num_proposals: &Tensor, features: &Tensor) -> Result<MidnOutput> {
        let (batch, max_regions, dims) = features.dims3()?;
        if dims != self.feature_dims {
            return Err(WsodError::shape(
                "MidnNetwork::forward",
                format!("features have {dims} dims, layer expects {}", self.feature_dims),
            ));
        }
        if num_proposals.dims() != [batch] {
            return Err(WsodError::shape(
                "MidnNetwork::forward",
                format!("num_proposals {:?} for batch {batch}", num_proposals.dims()),
            ));
        }

        // [B, R, 1]
        let mask = sequence_mask(num_proposals, max_regions)?.unsqueeze(2)?;

        let logits_c_given_r = self.classification.forward(features)?;
        let (logits_r_given_c, proba_h_given_c) = match &self.selection {
            SelectionBranch::PerClass(fc) => (fc.forward(features)?, None),
            SelectionBranch::PerClassTanh { hidden, output } => {
                (output.forward(&hidden.forward(features)?)?, None)
            }
            SelectionBranch::Latent {
                proba_r_given_h,
                proba_h_given_c,
                use_sigmoid,
            } => {
                let eye = identity(self.num_classes, features.device())?;
                // [C, H] -> [H, C]
                let logits_h_given_c = proba_h_given_c.forward(&eye)?.t()?;
                let proba = if *use_sigmoid {
                    candle_nn::ops::sigmoid(&logits_h_given_c)?
                } else {
                    candle_nn::ops::softmax(&logits_h_given_c, 0)?
                };
                let logits_r_given_h = proba_r_given_h.forward(features)?;
                let hiddens = logits_r_given_h.dim(2)?;
                let logits = logits_r_given_h
                    .reshape((batch * max_regions, hiddens))?
                    .matmul(&proba)?
                    .reshape((batch, max_regions, self.num_classes))?;
                (logits, Some(proba))
            }
        };

        let proba_r_given_c = masked_softmax(&logits_r_given_c, &mask, 1)?;
        let class_logits = masked_sum(&logits_c_given_r.mul(&proba_r_given_c)?, &mask, 1)?.squeeze(1)?;
        let proposal_scores = candle_nn::ops::sigmoid(&class_logits)?
            .unsqueeze(1)?
            .broadcast_mul(&proba_r_given_c)?;

        Ok(MidnOutput {
            class_logits,
            proposal_scores,
            proba_r_given_c,
            proba_h_given_c,
        })
    }
}
