//! NOD5: MIDN + OICR weakly supervised detector trained from captions.
//!
//! Image-level labels come from captions (see [`LabelStrategem`]), the MIDN
//! is trained with a multi-label classification loss against them, and each
//! OICR stage is trained on region labels mined from the previous stage.

use boxtools::{multiclass_non_max_suppression, Detection, NmsOptions};
use candle_core::{DType, Device, Tensor};
use rand::rngs::StdRng;

use crate::config::{LabelStrategem, NegativeMining, Nod5Config};
use crate::error::{Result, WsodError};
use crate::labels::{
    exact_match_labels, merge_labels, one_hot, positive_labels, PseudoLabeler, SynonymTable,
};
use crate::masked::{masked_argmax, masked_avg, masked_maximum, masked_sum, sequence_mask, EPSILON};
use crate::model::midn::{MidnNetwork, MidnOutput};
use crate::model::oicr::{oicr_loss, with_background, OicrHeads};
use crate::model::sigmoid_cross_entropy_with_logits;
use crate::model::text::ObjectPredictor;
use crate::params::ParamStore;
use crate::summary::Summaries;
use crate::vocab::{read_embedding_matrix, read_vocabulary, EmbeddingTable, TokenBatch, INIT_WIDTH};

/// Class vocabulary and optional open-vocabulary embedding.
#[derive(Debug, Clone)]
pub struct Nod5Resources {
    pub classes: Vec<String>,
    pub open_vocabulary: Option<EmbeddingTable>,
}

impl Nod5Resources {
    /// Reads the files named by `config`; the open vocabulary is only read
    /// when the label strategy needs it.
    pub fn load(config: &Nod5Config, rng: &mut StdRng, device: &Device) -> Result<Self> {
        let classes = read_vocabulary(&config.vocabulary_file)?;
        let open_vocabulary = if config.label_strategem == LabelStrategem::ExactMatch {
            None
        } else {
            let words = read_vocabulary(&config.open_vocabulary_file)?;
            let matrix = read_embedding_matrix(&config.open_vocabulary_glove_file)?;
            Some(EmbeddingTable::new(
                &words,
                Some(&matrix),
                config.embedding_dims,
                INIT_WIDTH,
                rng,
                device,
            )?)
        };
        Ok(Self {
            classes,
            open_vocabulary,
        })
    }
}

/// One training or evaluation batch.
#[derive(Debug, Clone)]
pub struct Nod5Inputs {
    /// `[B]` u32
    pub num_proposals: Tensor,
    /// `[B, R, 4]`
    pub proposals: Tensor,
    /// `[B, R, D]`
    pub proposal_features: Tensor,
    /// Caption tokens of each image, all captions concatenated
    pub captions: Vec<Vec<String>>,
    /// Ground-truth object names of each image
    pub object_texts: Option<Vec<Vec<String>>>,
}

#[derive(Debug, Clone)]
pub struct OicrStageOutput {
    /// Stage 0: `[B, R, C]` MIDN proposal scores; stage k: `[B, R, 1 + C]` logits
    pub scores: Tensor,
}

#[derive(Debug, Clone)]
pub struct Nod5Predictions {
    pub num_proposals: Tensor,
    pub proposals: Tensor,
    pub midn: MidnOutput,
    /// Ordered by stage index, `1 + oicr_iterations` entries
    pub stages: Vec<OicrStageOutput>,
    /// `[B, C]`, set by the predicted-label strategies
    pub predicted_logits: Option<Tensor>,
}

/// Detections of one image at one stage.
#[derive(Debug, Clone, PartialEq)]
pub struct StageDetections {
    pub num_detections: usize,
    pub boxes: Vec<[f32; 4]>,
    pub scores: Vec<f32>,
    /// 1-based
    pub classes: Vec<usize>,
}

impl From<Vec<Detection>> for StageDetections {
    fn from(detections: Vec<Detection>) -> Self {
        Self {
            num_detections: detections.len(),
            boxes: detections.iter().map(|d| d.bbox).collect(),
            scores: detections.iter().map(|d| d.score).collect(),
            classes: detections.iter().map(|d| d.class_id).collect(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Nod5Losses {
    pub object_prediction: Option<Tensor>,
    pub midn_cross_entropy: Tensor,
    /// Stages `1..=K`
    pub oicr_cross_entropy: Vec<Tensor>,
    pub min_entropy: Tensor,
    /// Weight penalties of the store, see [`Nod5Losses::with_regularization`]
    pub regularization: Option<Tensor>,
    pub summaries: Summaries,
}

impl Nod5Losses {
    pub fn named(&self) -> Vec<(String, Tensor)> {
        let mut named = Vec::new();
        if let Some(loss) = &self.object_prediction {
            named.push(("object_prediction_loss".to_string(), loss.clone()));
        }
        named.push((
            "midn_cross_entropy_loss".to_string(),
            self.midn_cross_entropy.clone(),
        ));
        for (k, loss) in self.oicr_cross_entropy.iter().enumerate() {
            named.push((format!("oicr_cross_entropy_loss_at_{}", k + 1), loss.clone()));
        }
        named.push(("min_entropy_loss".to_string(), self.min_entropy.clone()));
        if let Some(loss) = &self.regularization {
            named.push(("regularization_loss".to_string(), loss.clone()));
        }
        named
    }

    /// Adds the regularization loss of `store`, if any weight is regularized.
    pub fn with_regularization(mut self, store: &ParamStore) -> Result<Self> {
        self.regularization = store.regularization_loss()?;
        if let Some(loss) = &self.regularization {
            self.summaries.scalar("loss/regularization_loss", loss)?;
        }
        Ok(self)
    }

    pub fn total(&self) -> Result<Tensor> {
        let mut total = (&self.midn_cross_entropy + &self.min_entropy)?;
        for loss in self
            .object_prediction
            .iter()
            .chain(&self.oicr_cross_entropy)
            .chain(&self.regularization)
        {
            total = (total + loss)?;
        }
        Ok(total)
    }
}

pub struct Nod5Model {
    config: Nod5Config,
    class_names: Vec<String>,
    synonyms: SynonymTable,
    midn: MidnNetwork,
    oicr: OicrHeads,
    pseudo_labeler: Option<PseudoLabeler>,
    object_predictor: Option<ObjectPredictor>,
}

impl Nod5Model {
    pub fn new(
        config: &Nod5Config,
        resources: Nod5Resources,
        feature_dims: usize,
        store: &ParamStore,
    ) -> Result<Self> {
        config.validate()?;
        let num_classes = resources.classes.len();
        if num_classes == 0 {
            return Err(WsodError::MissingInput("classes"));
        }
        let synonyms = SynonymTable::default();
        let class_names = synonyms.normalize_all(&resources.classes);

        let mut pseudo_labeler = None;
        let mut object_predictor = None;
        match config.label_strategem {
            LabelStrategem::ExactMatch => {}
            LabelStrategem::SynonymMatch => {
                let table = resources
                    .open_vocabulary
                    .ok_or(WsodError::MissingInput("open_vocabulary"))?;
                pseudo_labeler = Some(PseudoLabeler::new(
                    &resources.classes,
                    table,
                    synonyms.clone(),
                )?);
            }
            LabelStrategem::PredictWithCaption | LabelStrategem::PredictWithGroundTruth => {
                let table = resources
                    .open_vocabulary
                    .ok_or(WsodError::MissingInput("open_vocabulary"))?;
                object_predictor = Some(ObjectPredictor::new(config, table, num_classes, store)?);
            }
        }

        let midn = MidnNetwork::new(config, feature_dims, num_classes, store)?;
        let oicr = OicrHeads::new(
            config.oicr_iterations,
            feature_dims,
            num_classes,
            &config.fc_hyperparams,
            store,
        )?;
        tracing::info!(
            "Built NOD5 model: {} classes, {} OICR stages, {} attention, {} labels",
            num_classes,
            config.oicr_iterations,
            config.attention_type,
            config.label_strategem
        );

        Ok(Self {
            config: config.clone(),
            class_names,
            synonyms,
            midn,
            oicr,
            pseudo_labeler,
            object_predictor,
        })
    }

    pub fn config(&self) -> &Nod5Config {
        &self.config
    }

    pub fn num_classes(&self) -> usize {
        self.class_names.len()
    }

    /// Normalised class names, in class-id order.
    pub fn class_names(&self) -> &[String] {
        &self.class_names
    }

    pub fn predict(&self, inputs: &Nod5Inputs) -> Result<Nod5Predictions> {
        let (batch, max_regions, _) = inputs.proposal_features.dims3()?;
        if inputs.proposals.dims() != [batch, max_regions, 4] {
            return Err(WsodError::shape(
                "Nod5Model::predict",
                format!(
                    "proposals {:?} for features {:?}",
                    inputs.proposals.dims(),
                    inputs.proposal_features.dims()
                ),
            ));
        }

        let midn = self
            .midn
            .forward(&inputs.num_proposals, &inputs.proposal_features)?;
        let mut stages = vec![OicrStageOutput {
            scores: midn.proposal_scores.clone(),
        }];
        stages.extend(
            self.oicr
                .forward(&inputs.proposal_features)?
                .into_iter()
                .map(|scores| OicrStageOutput { scores }),
        );

        let predicted_logits = match &self.object_predictor {
            Some(predictor) => {
                if inputs.captions.len() != batch {
                    return Err(WsodError::shape(
                        "Nod5Model::predict",
                        format!("{} captions for batch {batch}", inputs.captions.len()),
                    ));
                }
                Some(predictor.forward(&TokenBatch::new(&inputs.captions))?)
            }
            None => None,
        };

        Ok(Nod5Predictions {
            num_proposals: inputs.num_proposals.clone(),
            proposals: inputs.proposals.clone(),
            midn,
            stages,
            predicted_logits,
        })
    }

    fn caption_labels(&self, captions: &[Vec<String>], device: &Device) -> Result<Tensor> {
        let normalized: Vec<Vec<String>> = captions
            .iter()
            .map(|c| self.synonyms.normalize_tokens(c))
            .collect();
        exact_match_labels(&TokenBatch::new(&normalized), &self.class_names, device)
    }

    /// `[B, C]` labels read from captions alone, without region scores.
    ///
    /// Predicted strategies return the caption classifier's probabilities.
    pub fn text_labels(&self, captions: &[Vec<String>], device: &Device) -> Result<Tensor> {
        let from_captions = self.caption_labels(captions, device)?;
        match (&self.pseudo_labeler, &self.object_predictor) {
            (Some(labeler), _) => merge_labels(&from_captions, &labeler.labels(captions)?),
            (None, Some(predictor)) => {
                let logits = predictor.forward(&TokenBatch::new(captions))?;
                Ok(candle_nn::ops::sigmoid(&logits)?)
            }
            (None, None) => Ok(from_captions),
        }
    }

    /// `[B, C]` image labels and, for predicted labels, the object prediction loss.
    pub fn image_labels(
        &self,
        inputs: &Nod5Inputs,
        predictions: &Nod5Predictions,
    ) -> Result<(Tensor, Option<Tensor>)> {
        let device = inputs.num_proposals.device();
        let from_captions = self.caption_labels(&inputs.captions, device)?;

        let target = match self.config.label_strategem {
            LabelStrategem::ExactMatch => return Ok((from_captions, None)),
            LabelStrategem::SynonymMatch => {
                let labeler = self
                    .pseudo_labeler
                    .as_ref()
                    .ok_or(WsodError::MissingInput("open_vocabulary"))?;
                let pseudo = labeler.labels(&inputs.captions)?;
                return Ok((merge_labels(&from_captions, &pseudo)?, None));
            }
            LabelStrategem::PredictWithCaption => from_captions,
            LabelStrategem::PredictWithGroundTruth => {
                let objects = inputs
                    .object_texts
                    .as_ref()
                    .ok_or(WsodError::MissingInput("object_texts"))?;
                let names: Vec<Vec<String>> = objects
                    .iter()
                    .map(|names| self.synonyms.normalize_all(names))
                    .collect();
                exact_match_labels(&TokenBatch::new(&names), &self.class_names, device)?
            }
        };

        let logits = predictions
            .predicted_logits
            .as_ref()
            .ok_or(WsodError::MissingInput("predicted_logits"))?;
        let loss = sigmoid_cross_entropy_with_logits(&target, logits)?
            .sum(1)?
            .mean_all()?;
        let labels = candle_nn::ops::sigmoid(logits)?.detach();
        Ok((labels, Some(loss)))
    }

    fn midn_loss(&self, labels: &Tensor, class_logits: &Tensor) -> Result<Tensor> {
        let config = &self.config;
        let losses = sigmoid_cross_entropy_with_logits(labels, class_logits)?;

        let loss = match config.midn_loss_negative_mining {
            NegativeMining::Hardest => {
                let negatives = labels.affine(-1.0, 1.0)?;
                let has_negative = negatives.max_keepdim(1)?.gt(0.0)?.to_dtype(DType::F32)?;
                let hardest = masked_argmax(&losses.detach(), &negatives, 1)?;
                let hardest = one_hot(&hardest, labels.dim(1)?)?.broadcast_mul(&has_negative)?;
                let mask = (labels + hardest)?;
                masked_avg(&losses, &mask, 1)?.mean_all()?
            }
            NegativeMining::None if config.classification_loss_use_sum => {
                (losses.sum(1)?.mean_all()? * config.midn_loss_weight)?
            }
            NegativeMining::None if config.caption_as_label => {
                let has_label = positive_labels(labels)?.max(1)?;
                let per_example = losses.mean(1)?;
                (masked_avg(&per_example, &has_label, 0)?.squeeze(0)? * config.midn_loss_weight)?
            }
            NegativeMining::None => (losses.mean_all()? * config.midn_loss_weight)?,
        };
        Ok(loss)
    }

    pub fn loss(
        &self,
        inputs: &Nod5Inputs,
        predictions: &Nod5Predictions,
        global_step: u64,
    ) -> Result<Nod5Losses> {
        let config = &self.config;
        let mut summaries = Summaries::default();
        let (labels, object_prediction) = self.image_labels(inputs, predictions)?;
        let midn = &predictions.midn;

        let midn_cross_entropy = self.midn_loss(&labels, &midn.class_logits)?;

        // Stage-0 labels come from MIDN, with an empty background column.
        let mut scores = with_background(if config.oicr_use_proba_r_given_c {
            &midn.proba_r_given_c
        } else {
            &midn.proposal_scores
        })?;
        let gate = if global_step > config.oicr_start_step {
            1.0
        } else {
            0.0
        };
        let mut oicr_cross_entropy = Vec::with_capacity(config.oicr_iterations);
        for stage in predictions.stages.iter().skip(1) {
            let loss = oicr_loss(
                &labels,
                &predictions.num_proposals,
                &predictions.proposals,
                &scores.detach(),
                &stage.scores,
                config.oicr_iou_threshold,
            )?;
            oicr_cross_entropy.push((loss * (gate * config.oicr_loss_weight))?);
            scores = candle_nn::ops::softmax(&stage.scores, 2)?;
        }

        let max_regions = midn.proba_r_given_c.dim(1)?;
        let mask = sequence_mask(&predictions.num_proposals, max_regions)?.unsqueeze(2)?;
        let log_proba = (&midn.proba_r_given_c + EPSILON)?.log()?;
        let min_entropy = (masked_sum(&log_proba, &mask, 1)?
            .squeeze(1)?
            .mul(&labels)?
            .sum(1)?
            .mean_all()?
            * config.min_entropy_loss_weight)?;
        let max_proba = masked_maximum(&midn.proba_r_given_c, &mask, 1)?.mean_all()?;

        summaries.scalar("loss/max_proba", &max_proba)?;
        summaries.histogram("midn/class_logits", &midn.class_logits)?;
        summaries.histogram("midn/proposal_scores", &midn.proposal_scores)?;
        if let Some(proba_h_given_c) = &midn.proba_h_given_c {
            summaries.histogram("midn/proba_h_given_c", proba_h_given_c)?;
        }

        let mut losses = Nod5Losses {
            object_prediction,
            midn_cross_entropy,
            oicr_cross_entropy,
            min_entropy,
            regularization: None,
            summaries,
        };
        for (name, loss) in losses.named() {
            losses.summaries.scalar(format!("loss/{name}"), &loss)?;
        }
        Ok(losses)
    }

    /// Class-wise NMS of every stage; `result[stage][image]`.
    pub fn detections(&self, predictions: &Nod5Predictions) -> Result<Vec<Vec<StageDetections>>> {
        let num_classes = self.num_classes();
        let num_proposals: Vec<u32> = predictions.num_proposals.to_dtype(DType::U32)?.to_vec1()?;
        let proposals: Vec<Vec<Vec<f32>>> = predictions.proposals.to_vec3()?;

        let mut results = Vec::with_capacity(predictions.stages.len());
        for (k, stage) in predictions.stages.iter().enumerate() {
            let (scores, options) = if k == 0 {
                (stage.scores.detach(), &self.config.midn_post_process)
            } else {
                let proba = candle_nn::ops::softmax(&stage.scores.detach(), 2)?;
                (proba.narrow(2, 1, num_classes)?, &self.config.oicr_post_process)
            };
            results.push(stage_detections(&proposals, &num_proposals, &scores, options)?);
        }
        Ok(results)
    }
}

fn stage_detections(
    proposals: &[Vec<Vec<f32>>],
    num_proposals: &[u32],
    scores: &Tensor,
    options: &NmsOptions,
) -> Result<Vec<StageDetections>> {
    let scores: Vec<Vec<Vec<f32>>> = scores.to_vec3()?;
    let mut per_image = Vec::with_capacity(scores.len());
    for (b, image_scores) in scores.iter().enumerate() {
        let n = (num_proposals[b] as usize).min(image_scores.len());
        let boxes: Vec<[f32; 4]> = proposals[b][..n]
            .iter()
            .map(|p| [p[0], p[1], p[2], p[3]])
            .collect();
        let detections = multiclass_non_max_suppression(&boxes, &image_scores[..n], options);
        per_image.push(StageDetections::from(detections));
    }
    Ok(per_image)
}

/// Averages the stage scores of several predictions of the same images,
/// e.g. one per input resolution. Other fields come from the last run.
pub fn aggregate_predictions(runs: &[Nod5Predictions]) -> Result<Nod5Predictions> {
    let last = runs
        .last()
        .ok_or(WsodError::MissingInput("predictions"))?;
    if runs.len() == 1 {
        return Ok(last.clone());
    }

    let mut stages = Vec::with_capacity(last.stages.len());
    for k in 0..last.stages.len() {
        let scores = runs
            .iter()
            .map(|run| {
                run.stages
                    .get(k)
                    .map(|stage| stage.scores.clone())
                    .ok_or_else(|| {
                        WsodError::shape(
                            "aggregate_predictions",
                            format!("run has {} stages, expected {}", run.stages.len(), last.stages.len()),
                        )
                    })
            })
            .collect::<Result<Vec<_>>>()?;
        let stacked = Tensor::stack(&scores, 3)?;
        stages.push(OicrStageOutput {
            scores: stacked.mean(3)?,
        });
    }

    Ok(Nod5Predictions {
        stages,
        ..last.clone()
    })
}
