//! Tensor box helpers used by the refinement chain.
//!
//! Boxes are `[..., 4]` tensors in `[ymin, xmin, ymax, xmax]` order.

use candle_core::{Result, Tensor};

fn coord(boxes: &Tensor, i: usize) -> Result<Tensor> {
    boxes.narrow(2, i, 1)
}

fn areas(boxes: &Tensor) -> Result<Tensor> {
    let h = (coord(boxes, 2)? - coord(boxes, 0)?)?.relu()?;
    let w = (coord(boxes, 3)? - coord(boxes, 1)?)?.relu()?;
    h * w
}

/// Overlap of `[B, N, 1]` against `[B, 1, M]` along one axis.
fn overlap(boxes1: &Tensor, boxes2: &Tensor, lo: usize, hi: usize) -> Result<Tensor> {
    let upper = coord(boxes1, hi)?.broadcast_minimum(&coord(boxes2, hi)?.transpose(1, 2)?)?;
    let lower = coord(boxes1, lo)?.broadcast_maximum(&coord(boxes2, lo)?.transpose(1, 2)?)?;
    upper.sub(&lower)?.relu()
}

/// IoU between every pair of boxes: `[B, N, 4] x [B, M, 4] -> [B, N, M]`.
pub fn pairwise_iou(boxes1: &Tensor, boxes2: &Tensor) -> Result<Tensor> {
    let inter_h = overlap(boxes1, boxes2, 0, 2)?;
    let inter_w = overlap(boxes1, boxes2, 1, 3)?;
    let intersection = (inter_h * inter_w)?;

    let union = areas(boxes1)?
        .broadcast_add(&areas(boxes2)?.transpose(1, 2)?)?
        .sub(&intersection)?;
    intersection.div(&union.maximum(1e-8)?)
}

/// Picks one box per `(example, index)`: `[B, R, 4]` with `[B, K]` indices.
pub fn gather_boxes(boxes: &Tensor, indices: &Tensor) -> Result<Tensor> {
    let (b, k) = indices.dims2()?;
    let indices = indices.unsqueeze(2)?.broadcast_as((b, k, 4))?.contiguous()?;
    boxes.contiguous()?.gather(&indices, 1)
}
