//! Weakly supervised grounding and detection with candle.
//!
//! Two model families trained from image captions only:
//!
//! * NOD5 ([`model::nod5`]): a multiple instance detection network over region
//!   proposals followed by online instance classifier refinement stages.
//! * GAP ([`model::gap`]): image-caption grounding that pools region-token
//!   similarities with learned saliency.

pub mod box_ops;
pub mod config;
pub mod error;
pub mod hyperparams;
pub mod labels;
pub mod masked;
pub mod model;
pub mod optim;
pub mod params;
pub mod summary;
pub mod vocab;

pub use error::{ConfigError, Result, WsodError};
