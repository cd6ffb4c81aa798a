//! Masked reductions
//!
//! Every aggregate over a padded axis (regions, caption tokens, batch rows)
//! goes through [`masked_reduce`]. Masks are float tensors holding 0/1 (or
//! soft weights for the sum/average reductions) that broadcast against the
//! data. All reductions keep the reduced axis with size 1, except
//! [`Reduction::ArgMax`] which drops it.
//!
//! Entries whose mask is zero never reach the result, and every reduction is
//! defined when the whole slice is masked:
//! max returns the slice minimum, min returns the slice maximum, sum and
//! average return 0, argmax returns index 0 and softmax returns zeros.

use candle_core::{DType, Result, Tensor};

/// Floor used by every masked denominator.
pub const EPSILON: f64 = 1e-8;

/// Reduction applied by [`masked_reduce`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reduction {
    Max,
    Min,
    Sum,
    Avg,
    ArgMax,
}

/// Builds a `[B, maxlen]` float mask from `lengths` of shape `[B]`.
pub fn sequence_mask(lengths: &Tensor, maxlen: usize) -> Result<Tensor> {
    let range = Tensor::arange(0u32, maxlen as u32, lengths.device())?.unsqueeze(0)?;
    let lengths = lengths.to_dtype(DType::U32)?.unsqueeze(1)?;
    range.broadcast_lt(&lengths)?.to_dtype(DType::F32)
}

/// Replaces masked entries with `fill` computed over the whole slice.
fn fill_masked(data: &Tensor, mask: &Tensor, dim: usize, reduction: Reduction) -> Result<Tensor> {
    let keep = mask.broadcast_as(data.shape())?.ne(0f32)?;
    let fill = match reduction {
        Reduction::Min => data.max_keepdim(dim)?,
        Reduction::ArgMax => (data.min_keepdim(dim)? - 1.0)?,
        _ => data.min_keepdim(dim)?,
    };
    let fill = fill.detach().broadcast_as(data.shape())?;
    keep.where_cond(data, &fill)
}

/// Reduces `data` along `dim`, ignoring entries where `mask` is zero.
pub fn masked_reduce(
    data: &Tensor,
    mask: &Tensor,
    dim: usize,
    reduction: Reduction,
) -> Result<Tensor> {
    match reduction {
        Reduction::Max => fill_masked(data, mask, dim, reduction)?.max_keepdim(dim),
        Reduction::Min => fill_masked(data, mask, dim, reduction)?.min_keepdim(dim),
        Reduction::ArgMax => fill_masked(data, mask, dim, reduction)?
            .argmax_keepdim(dim)?
            .squeeze(dim),
        Reduction::Sum => data.broadcast_mul(mask)?.sum_keepdim(dim),
        Reduction::Avg => {
            let total = data.broadcast_mul(mask)?.sum_keepdim(dim)?;
            let count = mask
                .broadcast_as(data.shape())?
                .sum_keepdim(dim)?
                .maximum(EPSILON)?;
            total.broadcast_div(&count)
        }
    }
}

pub fn masked_maximum(data: &Tensor, mask: &Tensor, dim: usize) -> Result<Tensor> {
    masked_reduce(data, mask, dim, Reduction::Max)
}

pub fn masked_minimum(data: &Tensor, mask: &Tensor, dim: usize) -> Result<Tensor> {
    masked_reduce(data, mask, dim, Reduction::Min)
}

pub fn masked_sum(data: &Tensor, mask: &Tensor, dim: usize) -> Result<Tensor> {
    masked_reduce(data, mask, dim, Reduction::Sum)
}

pub fn masked_avg(data: &Tensor, mask: &Tensor, dim: usize) -> Result<Tensor> {
    masked_reduce(data, mask, dim, Reduction::Avg)
}

/// Index of the largest unmasked entry, as `u32` with `dim` removed.
pub fn masked_argmax(data: &Tensor, mask: &Tensor, dim: usize) -> Result<Tensor> {
    masked_reduce(data, mask, dim, Reduction::ArgMax)
}

/// Softmax over `dim` restricted to unmasked entries; masked entries get 0.
pub fn masked_softmax(data: &Tensor, mask: &Tensor, dim: usize) -> Result<Tensor> {
    let mask = mask.broadcast_as(data.shape())?;
    let shift = masked_maximum(data, &mask, dim)?.detach();
    let shifted = data.broadcast_sub(&shift)?.mul(&mask)?;
    let exp = shifted.exp()?.mul(&mask)?;
    let denom = exp.sum_keepdim(dim)?.maximum(EPSILON)?;
    exp.broadcast_div(&denom)
}

/// Scales `data` to unit L2 norm along `dim`.
pub fn l2_normalize(data: &Tensor, dim: usize) -> Result<Tensor> {
    let norm = data.sqr()?.sum_keepdim(dim)?.maximum(1e-12)?.sqrt()?;
    data.broadcast_div(&norm)
}
