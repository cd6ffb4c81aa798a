//! Model and training configuration
//!
//! Configurations are plain serde structs read from JSON. Enumerated options
//! are closed enums: an unknown string is rejected with
//! [`ConfigError::InvalidOption`] naming the option, never mapped to a
//! default. Run [`Nod5Config::validate`] / [`GapConfig::validate`] after
//! loading; [`load_json`] does it for you.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use boxtools::NmsOptions;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, Result};

macro_rules! config_enum {
    (
        $(#[$meta:meta])*
        $name:ident, $option:literal {
            $($(#[$vmeta:meta])* $variant:ident => $text:literal),+ $(,)?
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
        #[serde(try_from = "String", into = "String")]
        pub enum $name {
            $($(#[$vmeta])* $variant),+
        }

        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl FromStr for $name {
            type Err = ConfigError;

            fn from_str(s: &str) -> std::result::Result<Self, ConfigError> {
                match s {
                    $($text => Ok($name::$variant),)+
                    other => Err(ConfigError::InvalidOption {
                        option: $option,
                        value: other.to_string(),
                    }),
                }
            }
        }

        impl TryFrom<String> for $name {
            type Error = ConfigError;

            fn try_from(s: String) -> std::result::Result<Self, ConfigError> {
                s.parse()
            }
        }

        impl From<$name> for String {
            fn from(value: $name) -> String {
                value.as_str().to_string()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

config_enum! {
    /// How the MIDN selection branch scores regions per class.
    AttentionType, "attention_type" {
        /// One linear projection per class
        PerClass => "per_class",
        /// A tanh hidden layer before the per-class projection
        PerClassTanh => "per_class_tanh",
        /// Region-to-latent-factor scores mixed by a learned factor-to-class table
        Latent => "latent",
    }
}

config_enum! {
    /// Where image-level class labels come from.
    LabelStrategem, "label_strategem" {
        /// Caption tokens equal to a class name
        ExactMatch => "exact_match",
        /// Exact match, falling back to the nearest class in embedding space
        SynonymMatch => "synonym_match",
        /// A caption classifier trained against exact-match labels
        PredictWithCaption => "predict_with_caption",
        /// A caption classifier trained against ground-truth object names
        PredictWithGroundTruth => "predict_with_ground_truth",
    }
}

config_enum! {
    /// Negative mining applied to the MIDN classification loss.
    NegativeMining, "midn_loss_negative_mining" {
        None => "none",
        Hardest => "hardest",
    }
}

config_enum! {
    /// Pooling used to turn caption token embeddings into one vector.
    TextEncoding, "text_encoding" {
        AvgPool => "avg_pool",
        MaxPool => "max_pool",
    }
}

config_enum! {
    /// Activation applied after a fully connected layer.
    Activation, "activation" {
        None => "none",
        Relu => "relu",
        Relu6 => "relu_6",
        Tanh => "tanh",
    }
}

config_enum! {
    /// Fan used by the variance scaling initializer.
    VarianceScalingMode, "mode" {
        FanIn => "fan_in",
        FanOut => "fan_out",
        FanAvg => "fan_avg",
    }
}

/// Weight initializer for fully connected layers.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InitializerConfig {
    TruncatedNormal {
        mean: f64,
        stddev: f64,
    },
    RandomNormal {
        mean: f64,
        stddev: f64,
    },
    VarianceScaling {
        factor: f64,
        mode: VarianceScalingMode,
        #[serde(default)]
        uniform: bool,
    },
    GlorotNormal,
    GlorotUniform,
}

impl Default for InitializerConfig {
    fn default() -> Self {
        InitializerConfig::TruncatedNormal {
            mean: 0.0,
            stddev: 0.01,
        }
    }
}

/// Weight regularizer for fully connected layers.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RegularizerConfig {
    L1 { weight: f64 },
    L2 { weight: f64 },
}

/// Hyperparameters shared by a family of fully connected layers.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HyperparamsConfig {
    pub activation: Activation,
    pub initializer: InitializerConfig,
    pub regularizer: Option<RegularizerConfig>,
}

impl Default for Activation {
    fn default() -> Self {
        Activation::None
    }
}

/// Optimizer selection, one variant per supported update rule.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OptimizerConfig {
    Sgd,
    Momentum {
        momentum: f64,
        #[serde(default)]
        use_nesterov: bool,
    },
    Adagrad {
        initial_accumulator_value: f64,
    },
    Adam {
        beta1: f64,
        beta2: f64,
        epsilon: f64,
    },
    Rmsprop {
        decay: f64,
        momentum: f64,
        epsilon: f64,
        #[serde(default)]
        centered: bool,
    },
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        OptimizerConfig::Adam {
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-8,
        }
    }
}

/// Configuration for the NOD5 (MIDN + OICR) detector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Nod5Config {
    // Vocabularies
    /// Class names, one per line
    pub vocabulary_file: PathBuf,
    /// Open vocabulary used for caption embeddings, one word per line
    pub open_vocabulary_file: PathBuf,
    /// Pretrained `[V, E]` embedding matrix for the open vocabulary (`.npy`)
    pub open_vocabulary_glove_file: PathBuf,
    /// Width of the open-vocabulary embeddings
    pub embedding_dims: usize,
    /// Whether the caption classifier fine-tunes its word embeddings
    pub train_word_embedding: bool,
    /// Pooling of caption tokens for the caption classifier
    pub text_encoding: TextEncoding,

    // MIDN
    pub attention_type: AttentionType,
    /// Hidden units of the `per_class_tanh` selection branch
    pub tanh_hiddens: usize,
    /// Latent factors of the `latent` selection branch
    pub num_latent_factors: usize,
    /// Use sigmoid instead of softmax over latent factors
    pub proba_h_use_sigmoid: bool,
    pub fc_hyperparams: HyperparamsConfig,

    // Labels and losses
    pub label_strategem: LabelStrategem,
    /// Only examples with at least one positive label contribute to the MIDN loss
    pub caption_as_label: bool,
    pub midn_loss_weight: f64,
    pub midn_loss_negative_mining: NegativeMining,
    pub classification_loss_use_sum: bool,
    pub min_entropy_loss_weight: f64,
    /// Allows loss branches that are not part of the default recipe
    pub enable_experimental_losses: bool,

    // OICR
    pub oicr_iterations: usize,
    /// Regions whose IoU with a top region is at least this value inherit its class
    pub oicr_iou_threshold: f32,
    /// OICR losses are zero until the global step exceeds this value
    pub oicr_start_step: u64,
    pub oicr_loss_weight: f64,
    /// Seed the first refinement stage with `proba_r_given_c` instead of proposal scores
    pub oicr_use_proba_r_given_c: bool,

    // Post-processing
    pub midn_post_process: NmsOptions,
    pub oicr_post_process: NmsOptions,
}

impl Default for Nod5Config {
    fn default() -> Self {
        Self {
            vocabulary_file: PathBuf::from("data/coco_vocab.txt"),
            open_vocabulary_file: PathBuf::from("data/open_vocab.txt"),
            open_vocabulary_glove_file: PathBuf::from("data/open_vocab_glove.npy"),
            embedding_dims: 50,
            train_word_embedding: false,
            text_encoding: TextEncoding::AvgPool,
            attention_type: AttentionType::PerClass,
            tanh_hiddens: 50,
            num_latent_factors: 20,
            proba_h_use_sigmoid: false,
            fc_hyperparams: HyperparamsConfig::default(),
            label_strategem: LabelStrategem::ExactMatch,
            caption_as_label: true,
            midn_loss_weight: 1.0,
            midn_loss_negative_mining: NegativeMining::None,
            classification_loss_use_sum: false,
            min_entropy_loss_weight: 0.0,
            enable_experimental_losses: false,
            oicr_iterations: 3,
            oicr_iou_threshold: 0.5,
            oicr_start_step: 0,
            oicr_loss_weight: 1.0,
            oicr_use_proba_r_given_c: false,
            midn_post_process: NmsOptions::default(),
            oicr_post_process: NmsOptions::default(),
        }
    }
}

fn check_nms(option: &'static str, nms: &NmsOptions) -> std::result::Result<(), ConfigError> {
    if !(0.0..=1.0).contains(&nms.iou_threshold) {
        return Err(ConfigError::OutOfRange {
            option,
            message: format!("iou_threshold {} not in [0, 1]", nms.iou_threshold),
        });
    }
    Ok(())
}

fn check_positive(option: &'static str, value: usize) -> std::result::Result<(), ConfigError> {
    if value == 0 {
        return Err(ConfigError::OutOfRange {
            option,
            message: "must be positive".to_string(),
        });
    }
    Ok(())
}

impl Nod5Config {
    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        check_positive("embedding_dims", self.embedding_dims)?;
        if self.attention_type == AttentionType::PerClassTanh {
            check_positive("tanh_hiddens", self.tanh_hiddens)?;
        }
        if self.attention_type == AttentionType::Latent {
            check_positive("num_latent_factors", self.num_latent_factors)?;
        }
        if !(0.0..=1.0).contains(&self.oicr_iou_threshold) {
            return Err(ConfigError::OutOfRange {
                option: "oicr_iou_threshold",
                message: format!("{} not in [0, 1]", self.oicr_iou_threshold),
            });
        }
        if !self.enable_experimental_losses {
            if self.midn_loss_negative_mining == NegativeMining::Hardest {
                return Err(ConfigError::Disabled {
                    option: "midn_loss_negative_mining",
                    reason: "hardest negative mining requires enable_experimental_losses",
                });
            }
            if self.classification_loss_use_sum {
                return Err(ConfigError::Disabled {
                    option: "classification_loss_use_sum",
                    reason: "summed classification loss requires enable_experimental_losses",
                });
            }
        }
        check_nms("midn_post_process", &self.midn_post_process)?;
        check_nms("oicr_post_process", &self.oicr_post_process)?;
        Ok(())
    }
}

/// Configuration for the GAP image-caption grounding model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GapConfig {
    /// Task vocabulary, one word per line
    pub vocabulary_file: PathBuf,
    /// Optional pretrained `[V, D]` embedding matrix (`.npy`)
    pub vocabulary_weights_file: Option<PathBuf>,
    /// Width of the joint image-text space
    pub common_dimensions: usize,
    pub word_embedding_trainable: bool,
    pub image_proj_hyperparams: HyperparamsConfig,

    // Saliency
    pub use_saliency_score: bool,
    pub l2_norm_for_word_saliency: bool,
    pub image_saliency_hyperparams: HyperparamsConfig,
    pub word_saliency_hyperparams: HyperparamsConfig,
    pub image_regularizer_weight: f64,
    pub text_regularizer_weight: f64,

    // Triplet loss
    pub triplet_loss_margin: f32,
    pub triplet_loss_use_semihard: bool,
    /// Keep probability of dropout on region-token products, 1.0 disables it
    pub dropout_keep_prob: f32,
}

impl Default for GapConfig {
    fn default() -> Self {
        Self {
            vocabulary_file: PathBuf::from("data/coco_open_vocab.txt"),
            vocabulary_weights_file: None,
            common_dimensions: 300,
            word_embedding_trainable: true,
            image_proj_hyperparams: HyperparamsConfig::default(),
            use_saliency_score: true,
            l2_norm_for_word_saliency: false,
            image_saliency_hyperparams: HyperparamsConfig::default(),
            word_saliency_hyperparams: HyperparamsConfig::default(),
            image_regularizer_weight: 0.0,
            text_regularizer_weight: 0.0,
            triplet_loss_margin: 0.1,
            triplet_loss_use_semihard: false,
            dropout_keep_prob: 1.0,
        }
    }
}

impl GapConfig {
    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        check_positive("common_dimensions", self.common_dimensions)?;
        if self.triplet_loss_margin < 0.0 {
            return Err(ConfigError::OutOfRange {
                option: "triplet_loss_margin",
                message: format!("{} is negative", self.triplet_loss_margin),
            });
        }
        if !(self.dropout_keep_prob > 0.0 && self.dropout_keep_prob <= 1.0) {
            return Err(ConfigError::OutOfRange {
                option: "dropout_keep_prob",
                message: format!("{} not in (0, 1]", self.dropout_keep_prob),
            });
        }
        Ok(())
    }
}

/// Settings of the training loop.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainConfig {
    pub optimizer: OptimizerConfig,
    pub learning_rate: f64,
    pub num_steps: u64,
    pub batch_size: usize,
    /// Seed for embedding initialisation and synthetic batches
    pub seed: u64,
    pub log_every_n_steps: u64,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            optimizer: OptimizerConfig::default(),
            learning_rate: 0.01,
            num_steps: 100,
            batch_size: 2,
            seed: 0,
            log_every_n_steps: 10,
        }
    }
}

impl TrainConfig {
    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        check_positive("batch_size", self.batch_size)?;
        if !(self.learning_rate > 0.0) {
            return Err(ConfigError::OutOfRange {
                option: "learning_rate",
                message: format!("{} is not positive", self.learning_rate),
            });
        }
        Ok(())
    }
}

/// A detector configuration paired with its training loop.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Nod5Experiment {
    pub model: Nod5Config,
    pub train: TrainConfig,
}

/// A grounding model configuration paired with its training loop.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GapExperiment {
    pub model: GapConfig,
    pub train: TrainConfig,
}

/// Anything that can be checked after deserialisation.
pub trait Validate {
    fn validate_config(&self) -> std::result::Result<(), ConfigError>;
}

impl Validate for Nod5Config {
    fn validate_config(&self) -> std::result::Result<(), ConfigError> {
        self.validate()
    }
}

impl Validate for GapConfig {
    fn validate_config(&self) -> std::result::Result<(), ConfigError> {
        self.validate()
    }
}

impl Validate for Nod5Experiment {
    fn validate_config(&self) -> std::result::Result<(), ConfigError> {
        self.model.validate()?;
        self.train.validate()
    }
}

impl Validate for GapExperiment {
    fn validate_config(&self) -> std::result::Result<(), ConfigError> {
        self.model.validate()?;
        self.train.validate()
    }
}

/// Parses and validates a configuration from a JSON string.
pub fn parse_json<T: DeserializeOwned + Validate>(text: &str) -> Result<T> {
    let config: T = serde_json::from_str(text)?;
    config.validate_config()?;
    Ok(config)
}

/// Reads, parses and validates a JSON configuration file.
pub fn load_json<T: DeserializeOwned + Validate>(path: &Path) -> Result<T> {
    let text = std::fs::read_to_string(path)?;
    parse_json(&text)
}
