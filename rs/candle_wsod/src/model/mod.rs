//! Region-level models
//!
//! * [`midn`]: the two-branch multiple instance detection network
//! * [`oicr`]: online instance classifier refinement stages
//! * [`text`]: caption classifier predicting image-level object labels
//! * [`nod5`]: MIDN + OICR detector assembled from the above
//! * [`gap`]: image-caption grounding with attention pooling

pub mod gap;
pub mod midn;
pub mod nod5;
pub mod oicr;
pub mod text;

use candle_core::{Result, Tensor};

/// Element-wise `max(x, 0) - x * z + log(1 + exp(-|x|))`.
pub fn sigmoid_cross_entropy_with_logits(labels: &Tensor, logits: &Tensor) -> Result<Tensor> {
    let softplus = (logits.abs()?.neg()?.exp()? + 1.0)?.log()?;
    logits.relu()?.sub(&logits.mul(labels)?)?.add(&softplus)
}
