//! Online instance classifier refinement.
//!
//! Stage `k + 1` is a fresh `1 + C` way region classifier trained against
//! labels mined from the (detached) stage `k` scores: for every positive
//! class the best-scoring valid region is found, and each valid region takes
//! the class of the top region it overlaps with IoU `>= iou_threshold`.
//! Regions overlapping no top region are background (label 0).

use candle_core::{DType, Module, Tensor};

use crate::box_ops::{gather_boxes, pairwise_iou};
use crate::config::{Activation, HyperparamsConfig};
use crate::error::{Result, WsodError};
use crate::hyperparams::FullyConnected;
use crate::labels::positive_labels;
use crate::masked::{masked_argmax, masked_avg, sequence_mask};
use crate::params::ParamStore;

/// One `D -> 1 + C` classifier per refinement stage.
#[derive(Debug, Clone)]
pub struct OicrHeads {
    heads: Vec<FullyConnected>,
}

impl OicrHeads {
    pub fn new(
        iterations: usize,
        feature_dims: usize,
        num_classes: usize,
        hyperparams: &HyperparamsConfig,
        store: &ParamStore,
    ) -> Result<Self> {
        let heads = (1..=iterations)
            .map(|k| {
                FullyConnected::new(
                    feature_dims,
                    1 + num_classes,
                    hyperparams,
                    Some(Activation::None),
                    store,
                    &format!("oicr/iter{k}"),
                )
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { heads })
    }

    pub fn len(&self) -> usize {
        self.heads.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heads.is_empty()
    }

    /// `[B, R, 1 + C]` logits of stages `1..=K`, in order.
    pub fn forward(&self, features: &Tensor) -> Result<Vec<Tensor>> {
        self.heads
            .iter()
            .map(|head| Ok(head.forward(features)?))
            .collect()
    }
}

/// Prepends a zero background column: `[B, R, C] -> [B, R, 1 + C]`.
pub fn with_background(scores: &Tensor) -> Result<Tensor> {
    let (b, r, _) = scores.dims3()?;
    let background = Tensor::zeros((b, r, 1), scores.dtype(), scores.device())?;
    Ok(Tensor::cat(&[&background, scores], 2)?)
}

/// Mines `[B, R]` region labels (`u32`, 0 = background, `c + 1` = class `c`).
///
/// * `labels` - `[B, C]` image-level labels, see [`positive_labels`]
/// * `num_proposals` - `[B]`
/// * `proposals` - `[B, R, 4]`
/// * `scores` - `[B, R, 1 + C]` probabilities of the previous stage
pub fn oicr_pseudo_labels(
    labels: &Tensor,
    num_proposals: &Tensor,
    proposals: &Tensor,
    scores: &Tensor,
    iou_threshold: f32,
) -> Result<Tensor> {
    let (batch, max_regions, columns) = scores.dims3()?;
    let num_classes = labels.dim(1)?;
    if columns != num_classes + 1 {
        return Err(WsodError::shape(
            "oicr_pseudo_labels",
            format!("scores have {columns} columns for {num_classes} classes"),
        ));
    }
    if proposals.dims() != [batch, max_regions, 4] {
        return Err(WsodError::shape(
            "oicr_pseudo_labels",
            format!("proposals {:?} for scores {:?}", proposals.dims(), scores.dims()),
        ));
    }

    let foreground = scores.detach().narrow(2, 1, num_classes)?;
    // [B, R, 1]
    let region_mask = sequence_mask(num_proposals, max_regions)?.unsqueeze(2)?;

    // Best region of every class, then its overlap with every region.
    let top = masked_argmax(&foreground, &region_mask, 1)?;
    let top_boxes = gather_boxes(proposals, &top)?;
    let iou = pairwise_iou(proposals, &top_boxes)?;

    let positive = positive_labels(labels)?.unsqueeze(1)?;
    let qualifies = iou
        .ge(iou_threshold as f64)?
        .to_dtype(DType::F32)?
        .broadcast_mul(&positive)?
        .broadcast_mul(&region_mask)?;

    // Competing classes are ranked by the region's own probability.
    let rejected = Tensor::full(-1f32, foreground.shape(), foreground.device())?;
    let candidates = qualifies.ne(0f32)?.where_cond(&foreground, &rejected)?;
    let best = candidates.argmax(2)?.to_dtype(DType::F32)?;
    let any = qualifies.max(2)?;
    Ok(((best + 1.0)? * any)?.to_dtype(DType::U32)?)
}

/// Softmax cross entropy of `logits [B, R, 1 + C]` against mined labels,
/// averaged over valid regions and then over the batch.
pub fn oicr_loss(
    labels: &Tensor,
    num_proposals: &Tensor,
    proposals: &Tensor,
    scores: &Tensor,
    logits: &Tensor,
    iou_threshold: f32,
) -> Result<Tensor> {
    if logits.dims() != scores.dims() {
        return Err(WsodError::shape(
            "oicr_loss",
            format!("logits {:?} vs scores {:?}", logits.dims(), scores.dims()),
        ));
    }
    let region_labels =
        oicr_pseudo_labels(labels, num_proposals, proposals, scores, iou_threshold)?;
    let max_regions = logits.dim(1)?;
    let region_mask = sequence_mask(num_proposals, max_regions)?.unsqueeze(2)?;

    let log_proba = candle_nn::ops::log_softmax(logits, 2)?;
    let picked = log_proba.gather(&region_labels.unsqueeze(2)?.contiguous()?, 2)?;
    let losses = masked_avg(&picked.neg()?, &region_mask, 1)?;
    Ok(losses.mean_all()?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn tensor3<const N: usize>(data: &[[[f32; 2]; 2]; N]) -> Tensor {
        Tensor::new(data, &Device::Cpu).unwrap()
    }

    #[test]
    fn test_iou_threshold_is_inclusive() {
        // IoU of the two boxes is exactly 0.5
        let proposals = Tensor::new(&[[[0f32, 0.0, 1.0, 1.0], [0.0, 0.0, 1.0, 0.5]]], &Device::Cpu)
            .unwrap();
        let scores = tensor3(&[[[0.0, 0.9], [0.0, 0.1]]]);
        let labels = Tensor::new(&[[1f32]], &Device::Cpu).unwrap();
        let num_proposals = Tensor::new(&[2u32], &Device::Cpu).unwrap();

        let at: Vec<Vec<u32>> = oicr_pseudo_labels(&labels, &num_proposals, &proposals, &scores, 0.5)
            .unwrap()
            .to_vec2()
            .unwrap();
        assert_eq!(at, vec![vec![1, 1]]);

        let above: Vec<Vec<u32>> =
            oicr_pseudo_labels(&labels, &num_proposals, &proposals, &scores, 0.51)
                .unwrap()
                .to_vec2()
                .unwrap();
        assert_eq!(above, vec![vec![1, 0]]);
    }

    #[test]
    fn test_negative_classes_and_padding_are_background() {
        let proposals = Tensor::new(
            &[[[0f32, 0.0, 1.0, 1.0], [0.0, 0.0, 1.0, 1.0], [0.0, 0.0, 1.0, 1.0]]],
            &Device::Cpu,
        )
        .unwrap();
        // padded region 2 has the highest score for both classes
        let scores = Tensor::new(
            &[[[0f32, 0.2, 0.7], [0.0, 0.6, 0.1], [0.0, 0.9, 0.9]]],
            &Device::Cpu,
        )
        .unwrap();
        let num_proposals = Tensor::new(&[2u32], &Device::Cpu).unwrap();

        let only_first = Tensor::new(&[[1f32, 0.0]], &Device::Cpu).unwrap();
        let mined: Vec<Vec<u32>> =
            oicr_pseudo_labels(&only_first, &num_proposals, &proposals, &scores, 0.5)
                .unwrap()
                .to_vec2()
                .unwrap();
        assert_eq!(mined, vec![vec![1, 1, 0]]);

        // both positive, identical boxes: each region keeps its more probable class
        let both = Tensor::new(&[[1f32, 1.0]], &Device::Cpu).unwrap();
        let mined: Vec<Vec<u32>> = oicr_pseudo_labels(&both, &num_proposals, &proposals, &scores, 0.5)
            .unwrap()
            .to_vec2()
            .unwrap();
        assert_eq!(mined, vec![vec![2, 1, 0]]);

        let none = Tensor::new(&[[0.4f32, 0.0]], &Device::Cpu).unwrap();
        let mined: Vec<Vec<u32>> = oicr_pseudo_labels(&none, &num_proposals, &proposals, &scores, 0.5)
            .unwrap()
            .to_vec2()
            .unwrap();
        assert_eq!(mined, vec![vec![0, 0, 0]]);
    }

    #[test]
    fn test_region_probability_breaks_ties_between_overlapping_boxes() {
        // IoU of the two boxes is 0.8
        let proposals = Tensor::new(&[[[0f32, 0.0, 1.0, 1.0], [0.0, 0.0, 1.0, 0.8]]], &Device::Cpu)
            .unwrap();
        let scores = Tensor::new(&[[[0f32, 0.4, 0.45], [0.0, 0.1, 0.5]]], &Device::Cpu).unwrap();
        let labels = Tensor::new(&[[1f32, 1.0]], &Device::Cpu).unwrap();
        let num_proposals = Tensor::new(&[2u32], &Device::Cpu).unwrap();

        // region 0 is the top region of class 0 yet prefers class 1
        let mined: Vec<Vec<u32>> =
            oicr_pseudo_labels(&labels, &num_proposals, &proposals, &scores, 0.5)
                .unwrap()
                .to_vec2()
                .unwrap();
        assert_eq!(mined, vec![vec![2, 2]]);
    }

    #[test]
    fn test_soft_labels_at_or_below_half_are_negative() {
        let proposals = Tensor::new(&[[[0f32, 0.0, 1.0, 1.0], [0.0, 0.0, 1.0, 1.0]]], &Device::Cpu)
            .unwrap();
        let scores = Tensor::new(&[[[0f32, 0.2, 0.7], [0.0, 0.6, 0.1]]], &Device::Cpu).unwrap();
        let num_proposals = Tensor::new(&[2u32], &Device::Cpu).unwrap();

        let labels = Tensor::new(&[[0.6f32, 0.33]], &Device::Cpu).unwrap();
        let mined: Vec<Vec<u32>> =
            oicr_pseudo_labels(&labels, &num_proposals, &proposals, &scores, 0.5)
                .unwrap()
                .to_vec2()
                .unwrap();
        assert_eq!(mined, vec![vec![1, 1]]);

        let labels = Tensor::new(&[[0.5f32, 0.51]], &Device::Cpu).unwrap();
        let mined: Vec<Vec<u32>> =
            oicr_pseudo_labels(&labels, &num_proposals, &proposals, &scores, 0.5)
                .unwrap()
                .to_vec2()
                .unwrap();
        assert_eq!(mined, vec![vec![2, 2]]);
    }

    #[test]
    fn test_padded_maximum_changes_neither_labels_nor_loss() {
        let device = Device::Cpu;
        let labels = Tensor::new(&[[1f32, 1.0]], &device).unwrap();
        let num_proposals = Tensor::new(&[2u32], &device).unwrap();
        let short_proposals =
            Tensor::new(&[[[0f32, 0.0, 1.0, 1.0], [0.0, 0.0, 1.0, 0.8]]], &device).unwrap();
        let short_scores = Tensor::new(&[[[0f32, 0.4, 0.45], [0.0, 0.1, 0.5]]], &device).unwrap();
        let short_logits = Tensor::new(&[[[0.1f32, 0.2, 0.3], [0.5, -0.5, 1.0]]], &device).unwrap();

        // padded region 2 holds the highest raw score of both classes
        let proposals = Tensor::new(
            &[[[0f32, 0.0, 1.0, 1.0], [0.0, 0.0, 1.0, 0.8], [0.0, 0.0, 1.0, 1.0]]],
            &device,
        )
        .unwrap();
        let scores = Tensor::new(
            &[[[0f32, 0.4, 0.45], [0.0, 0.1, 0.5], [0.0, 0.99, 0.99]]],
            &device,
        )
        .unwrap();
        let logits = Tensor::new(
            &[[[0.1f32, 0.2, 0.3], [0.5, -0.5, 1.0], [9.0, -9.0, 4.0]]],
            &device,
        )
        .unwrap();

        let mined: Vec<Vec<u32>> =
            oicr_pseudo_labels(&labels, &num_proposals, &proposals, &scores, 0.5)
                .unwrap()
                .to_vec2()
                .unwrap();
        assert_eq!(mined, vec![vec![2, 2, 0]]);

        let short: f32 = oicr_loss(
            &labels,
            &num_proposals,
            &short_proposals,
            &short_scores,
            &short_logits,
            0.5,
        )
        .unwrap()
        .to_scalar()
        .unwrap();
        let padded: f32 = oicr_loss(&labels, &num_proposals, &proposals, &scores, &logits, 0.5)
            .unwrap()
            .to_scalar()
            .unwrap();
        assert!((short - padded).abs() < 1e-6);
    }

    #[test]
    fn test_oicr_loss_uniform_logits() {
        let proposals = Tensor::new(&[[[0f32, 0.0, 1.0, 1.0], [0.5, 0.5, 0.9, 0.9]]], &Device::Cpu)
            .unwrap();
        let scores = tensor3(&[[[0.0, 0.9], [0.0, 0.1]]]);
        let labels = Tensor::new(&[[1f32]], &Device::Cpu).unwrap();
        let num_proposals = Tensor::new(&[2u32], &Device::Cpu).unwrap();
        let logits = Tensor::zeros((1, 2, 2), DType::F32, &Device::Cpu).unwrap();

        let loss: f32 = oicr_loss(&labels, &num_proposals, &proposals, &scores, &logits, 0.5)
            .unwrap()
            .to_scalar()
            .unwrap();
        assert!((loss - 2f32.ln()).abs() < 1e-5);
    }

    #[test]
    fn test_oicr_loss_prefers_mined_labels() {
        let proposals = Tensor::new(&[[[0f32, 0.0, 1.0, 1.0], [0.5, 0.5, 0.9, 0.9]]], &Device::Cpu)
            .unwrap();
        let scores = tensor3(&[[[0.0, 0.9], [0.0, 0.1]]]);
        let labels = Tensor::new(&[[1f32]], &Device::Cpu).unwrap();
        let num_proposals = Tensor::new(&[2u32], &Device::Cpu).unwrap();
        // region 0 -> class 1, region 1 -> background
        let good = tensor3(&[[[-3.0, 3.0], [3.0, -3.0]]]);
        let bad = tensor3(&[[[3.0, -3.0], [-3.0, 3.0]]]);

        let loss = |logits: &Tensor| -> f32 {
            oicr_loss(&labels, &num_proposals, &proposals, &scores, logits, 0.5)
                .unwrap()
                .to_scalar()
                .unwrap()
        };
        assert!(loss(&good) < 0.01);
        assert!(loss(&bad) > 5.0);
    }

    #[test]
    fn test_heads_and_background() {
        let store = ParamStore::new(&Device::Cpu);
        let heads = OicrHeads::new(3, 4, 2, &HyperparamsConfig::default(), &store).unwrap();
        assert_eq!(heads.len(), 3);
        assert!(store.get("oicr/iter3.weight").unwrap().is_some());

        let features = Tensor::ones((2, 5, 4), DType::F32, &Device::Cpu).unwrap();
        let logits = heads.forward(&features).unwrap();
        assert_eq!(logits.len(), 3);
        assert_eq!(logits[0].dims(), &[2, 5, 3]);

        let scores = Tensor::ones((1, 2, 2), DType::F32, &Device::Cpu).unwrap();
        let padded: Vec<Vec<Vec<f32>>> = with_background(&scores).unwrap().to_vec3().unwrap();
        assert_eq!(padded[0][1], vec![0.0, 1.0, 1.0]);
    }
}
