//! GAP: image-caption grounding through global attention pooling.
//!
//! Every region of an image is compared with every token of every caption
//! in the batch. The `[B, R, N, L]` similarities are pooled to one
//! image-caption score, either by plain averaging or weighted by learned
//! region and word saliency, and trained with an in-batch triplet loss.

use candle_core::{DType, Device, Module, Tensor};
use ndarray::Array2;
use rand::rngs::StdRng;

use crate::config::{Activation, GapConfig};
use crate::error::{ConfigError, Result, WsodError};
use crate::hyperparams::FullyConnected;
use crate::masked::{l2_normalize, masked_maximum, masked_minimum, masked_softmax, EPSILON};
use crate::params::ParamStore;
use crate::summary::Summaries;
use crate::vocab::{read_embedding_matrix, read_vocabulary, EmbeddingTable, TokenBatch, INIT_WIDTH};

/// Floor applied to attention weights before taking their log.
const LOG_FLOOR: f64 = 1e-4;

/// Dot products of every `(region, token)` pair.
///
/// `image [B, R, D]` x `text [N, L, D]` -> `[B, R, N, L]`. With `drop_p`
/// the element-wise products are passed through dropout before the sum.
pub fn pairwise_similarity(image: &Tensor, text: &Tensor, drop_p: Option<f32>) -> Result<Tensor> {
    let (b, r, d) = image.dims3()?;
    let (n, l, e) = text.dims3()?;
    if d != e {
        return Err(WsodError::shape(
            "pairwise_similarity",
            format!("image dims {d} vs text dims {e}"),
        ));
    }
    let similarity = match drop_p {
        Some(p) if p > 0.0 => {
            let product = image
                .reshape((b, r, 1, 1, d))?
                .broadcast_mul(&text.reshape((1, 1, n, l, d))?)?;
            candle_nn::ops::dropout(&product, p)?.sum(4)?
        }
        _ => image
            .reshape((b * r, d))?
            .matmul(&text.reshape((n * l, d))?.t()?)?
            .reshape((b, r, n, l))?,
    };
    Ok(similarity)
}

/// Flattens the captions of every image into one list.
///
/// Returns the owning image id of each caption alongside the captions.
pub fn gather_in_batch_captions(
    image_ids: &[i64],
    captions: &[Vec<Vec<String>>],
) -> Result<(Vec<i64>, Vec<Vec<String>>)> {
    if image_ids.len() != captions.len() {
        return Err(WsodError::shape(
            "gather_in_batch_captions",
            format!("{} image ids, {} caption lists", image_ids.len(), captions.len()),
        ));
    }
    let mut ids = Vec::new();
    let mut gathered = Vec::new();
    for (id, image_captions) in image_ids.iter().zip(captions) {
        for caption in image_captions {
            ids.push(*id);
            gathered.push(caption.clone());
        }
    }
    Ok((ids, gathered))
}

/// `[B, N]` 1.0 where caption `n` belongs to image `b`.
fn positive_mask(image_ids: &[i64], gathered_ids: &[i64], device: &Device) -> Result<Tensor> {
    let data: Vec<f32> = image_ids
        .iter()
        .flat_map(|a| gathered_ids.iter().map(move |b| if a == b { 1.0 } else { 0.0 }))
        .collect();
    Ok(Tensor::from_vec(
        data,
        (image_ids.len(), gathered_ids.len()),
        device,
    )?)
}

/// In-batch triplet loss over a `[B, N]` image-caption similarity.
///
/// Returns the loss and the number of triplets with a non-zero loss.
pub fn triplet_loss(
    similarity: &Tensor,
    image_ids: &[i64],
    gathered_ids: &[i64],
    margin: f32,
    semihard: bool,
) -> Result<(Tensor, Tensor)> {
    let (b, n) = similarity.dims2()?;
    if b != image_ids.len() || n != gathered_ids.len() {
        return Err(WsodError::shape(
            "triplet_loss",
            format!(
                "similarity {:?} for {} images and {} captions",
                similarity.dims(),
                image_ids.len(),
                gathered_ids.len()
            ),
        ));
    }
    let distance = similarity.affine(-1.0, 1.0)?;
    let positives = positive_mask(image_ids, gathered_ids, similarity.device())?;
    let negatives = positives.affine(-1.0, 1.0)?;

    let distance_ap = masked_maximum(&distance, &positives, 1)?;
    let hardest = masked_minimum(&distance, &negatives, 1)?;
    let distance_an = if semihard {
        let outside = distance
            .broadcast_gt(&distance_ap)?
            .to_dtype(DType::F32)?
            .mul(&negatives)?;
        let closest_outside = masked_minimum(&distance, &outside, 1)?;
        let found = outside.sum_keepdim(1)?.gt(0.0)?;
        found.where_cond(&closest_outside, &hardest)?
    } else {
        hardest
    };

    let losses = ((distance_ap - distance_an)? + margin as f64)?.relu()?;
    let num_loss_examples = losses.gt(0.0)?.to_dtype(DType::F32)?.sum_all()?;
    let loss = losses
        .sum_all()?
        .div(&num_loss_examples.maximum(EPSILON)?)?;
    Ok((loss, num_loss_examples))
}

/// Fraction of images whose best-scoring caption is one of their own.
pub fn retrieval_accuracy(similarity: &Tensor, image_ids: &[i64], gathered_ids: &[i64]) -> Result<f32> {
    let retrieved: Vec<u32> = similarity.argmax(1)?.to_vec1()?;
    if retrieved.is_empty() {
        return Ok(0.0);
    }
    let correct = retrieved
        .iter()
        .zip(image_ids)
        .filter(|(index, id)| gathered_ids.get(**index as usize) == Some(*id))
        .count();
    Ok(correct as f32 / retrieved.len() as f32)
}

/// One batch of images with their captions.
#[derive(Debug, Clone)]
pub struct GapInputs {
    pub image_ids: Vec<i64>,
    /// `[B, R, F]` flattened feature grid of each image
    pub image_features: Tensor,
    /// Tokenised captions of each image
    pub captions: Vec<Vec<Vec<String>>>,
}

#[derive(Debug, Clone)]
pub struct GapPredictions {
    pub image_ids: Vec<i64>,
    pub image_ids_gathered: Vec<i64>,
    /// `[B, N]`
    pub similarity: Tensor,
    /// `[B, R]`
    pub image_attention: Option<Tensor>,
    /// `[N, L]`
    pub caption_attention: Option<Tensor>,
    pub image_attention_log_loss: Option<Tensor>,
    pub caption_attention_log_loss: Option<Tensor>,
    pub summaries: Summaries,
}

#[derive(Debug, Clone)]
pub struct GapLosses {
    pub triplet: Tensor,
    pub image_attention_log: Option<Tensor>,
    pub caption_attention_log: Option<Tensor>,
    /// Weight penalties of the store, see [`GapLosses::with_regularization`]
    pub regularization: Option<Tensor>,
    pub summaries: Summaries,
}

impl GapLosses {
    pub fn named(&self) -> Vec<(String, Tensor)> {
        let mut named = vec![("triplet_loss".to_string(), self.triplet.clone())];
        if let Some(loss) = &self.image_attention_log {
            named.push(("image_attention_log_loss".to_string(), loss.clone()));
        }
        if let Some(loss) = &self.caption_attention_log {
            named.push(("caption_attention_log_loss".to_string(), loss.clone()));
        }
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
        let mut total = self.triplet.clone();
        for loss in self
            .image_attention_log
            .iter()
            .chain(&self.caption_attention_log)
            .chain(&self.regularization)
        {
            total = (total + loss)?;
        }
        Ok(total)
    }
}

/// Category score map of a batch of images.
#[derive(Debug, Clone)]
pub struct ScoreMap {
    /// `[B, R]` raw region saliency
    pub saliency: Tensor,
    /// `[B, R, K]` category similarity weighted by min-max normalised saliency
    pub score_map: Tensor,
}

struct SaliencyHeads {
    image: FullyConnected,
    word: FullyConnected,
}

pub struct GapModel {
    config: GapConfig,
    image_feature_dims: usize,
    vocabulary: EmbeddingTable,
    image_proj: FullyConnected,
    saliency: Option<SaliencyHeads>,
}

impl GapModel {
    pub fn new(
        config: &GapConfig,
        vocabulary: &[String],
        pretrained: Option<&Array2<f32>>,
        image_feature_dims: usize,
        rng: &mut StdRng,
        store: &ParamStore,
    ) -> Result<Self> {
        config.validate()?;
        let dims = config.common_dimensions;
        let table = EmbeddingTable::new(vocabulary, pretrained, dims, INIT_WIDTH, rng, store.device())?
            .with_max_norm(1.0);
        let table = if config.word_embedding_trainable {
            table.trainable(store, "coco_word_embedding")?
        } else {
            table
        };

        let image_proj = FullyConnected::new(
            image_feature_dims,
            dims,
            &config.image_proj_hyperparams,
            Some(Activation::None),
            store,
            "image_proj",
        )?;
        let saliency = if config.use_saliency_score {
            Some(SaliencyHeads {
                image: FullyConnected::new(
                    dims,
                    1,
                    &config.image_saliency_hyperparams,
                    Some(Activation::None),
                    store,
                    "image_saliency",
                )?,
                word: FullyConnected::new(
                    dims,
                    1,
                    &config.word_saliency_hyperparams,
                    Some(Activation::None),
                    store,
                    "word_saliency",
                )?,
            })
        } else {
            None
        };
        tracing::info!(
            "Built GAP model: {} words, {} common dims, saliency {}",
            vocabulary.len(),
            dims,
            config.use_saliency_score
        );

        Ok(Self {
            config: config.clone(),
            image_feature_dims,
            vocabulary: table,
            image_proj,
            saliency,
        })
    }

    /// Reads the vocabulary (and optional embedding matrix) named by `config`.
    pub fn load(
        config: &GapConfig,
        image_feature_dims: usize,
        rng: &mut StdRng,
        store: &ParamStore,
    ) -> Result<Self> {
        let vocabulary = read_vocabulary(&config.vocabulary_file)?;
        let pretrained = config
            .vocabulary_weights_file
            .as_deref()
            .map(read_embedding_matrix)
            .transpose()?;
        Self::new(
            config,
            &vocabulary,
            pretrained.as_ref(),
            image_feature_dims,
            rng,
            store,
        )
    }

    pub fn config(&self) -> &GapConfig {
        &self.config
    }

    fn saliency_heads(&self) -> Result<&SaliencyHeads> {
        self.saliency.as_ref().ok_or_else(|| {
            ConfigError::Disabled {
                option: "use_saliency_score",
                reason: "saliency predictions need the saliency heads",
            }
            .into()
        })
    }

    /// `[B, R, F] -> [B, R, common_dimensions]`
    pub fn project_images(&self, image_features: &Tensor) -> Result<Tensor> {
        let dims = image_features.dim(2)?;
        if dims != self.image_feature_dims {
            return Err(WsodError::shape(
                "GapModel::project_images",
                format!("features have {dims} dims, projection expects {}", self.image_feature_dims),
            ));
        }
        Ok(self.image_proj.forward(image_features)?)
    }

    /// Similarity of every image with every in-batch caption.
    ///
    /// Dropout is only applied when `train` is set.
    pub fn predict(&self, inputs: &GapInputs, train: bool) -> Result<GapPredictions> {
        let config = &self.config;
        let device = inputs.image_features.device();
        let mut summaries = Summaries::default();

        let (image_ids_gathered, captions) =
            gather_in_batch_captions(&inputs.image_ids, &inputs.captions)?;
        let tokens = TokenBatch::new(&captions);
        let (_, caption_feature) = self.vocabulary.embed_batch(&tokens, device)?;
        let image_feature = self.project_images(&inputs.image_features)?;
        let (_, num_regions, _) = image_feature.dims3()?;

        let drop_p = (train && config.dropout_keep_prob < 1.0).then(|| 1.0 - config.dropout_keep_prob);

        // [N, L]
        let word_mask = tokens.mask(device)?;
        let similarity = pairwise_similarity(
            &l2_normalize(&image_feature, 2)?,
            &l2_normalize(&caption_feature, 2)?,
            drop_p,
        )?
        .broadcast_mul(&word_mask.unsqueeze(0)?.unsqueeze(0)?)?;

        let mut predictions = GapPredictions {
            image_ids: inputs.image_ids.clone(),
            image_ids_gathered,
            similarity: similarity.clone(),
            image_attention: None,
            caption_attention: None,
            image_attention_log_loss: None,
            caption_attention_log_loss: None,
            summaries: Summaries::default(),
        };

        match &self.saliency {
            Some(heads) => {
                let image_saliency = heads.image.forward(&image_feature)?.squeeze(2)?;
                let caption_input = if config.l2_norm_for_word_saliency {
                    l2_normalize(&caption_feature, 2)?
                } else {
                    caption_feature
                };
                let caption_saliency = heads.word.forward(&caption_input)?.squeeze(2)?;

                let image_attention = candle_nn::ops::softmax(&image_saliency, 1)?;
                let caption_attention = masked_softmax(&caption_saliency, &word_mask, 1)?;

                summaries.scalar("loss/image_attention_max", &image_attention.max(1)?)?;
                summaries.scalar("loss/image_attention_min", &image_attention.min(1)?)?;
                summaries.scalar(
                    "loss/caption_attention_max",
                    &masked_maximum(&caption_attention, &word_mask, 1)?,
                )?;
                summaries.scalar(
                    "loss/caption_attention_min",
                    &masked_minimum(&caption_attention, &word_mask, 1)?,
                )?;
                summaries.histogram("image_saliency", &image_saliency)?;
                summaries.histogram("text_saliency", &caption_saliency)?;

                if config.image_regularizer_weight > 0.0 {
                    let log_attention = image_attention.maximum(LOG_FLOOR)?.log()?;
                    let loss = (log_attention.sum(1)?.mean_all()? * config.image_regularizer_weight)?;
                    summaries.scalar("loss/image_attention_log_loss", &loss)?;
                    predictions.image_attention_log_loss = Some(loss);
                }
                if config.text_regularizer_weight > 0.0 {
                    let log_attention = caption_attention.maximum(LOG_FLOOR)?.log()?;
                    let loss = (log_attention.mul(&word_mask)?.sum(1)?.mean_all()?
                        * config.text_regularizer_weight)?;
                    summaries.scalar("loss/caption_attention_log_loss", &loss)?;
                    predictions.caption_attention_log_loss = Some(loss);
                }

                let saliency_mask = pairwise_similarity(
                    &image_attention.unsqueeze(2)?,
                    &caption_attention.unsqueeze(2)?,
                    drop_p,
                )?;
                predictions.similarity = similarity.mul(&saliency_mask)?.sum(3)?.sum(1)?;
                predictions.image_attention = Some(image_attention);
                predictions.caption_attention = Some(caption_attention);
            }
            None => {
                let lengths = tokens.lengths_tensor(device)?.to_dtype(DType::F32)?;
                let denominator = ((lengths * num_regions as f64)? + EPSILON)?.unsqueeze(0)?;
                predictions.similarity = similarity.sum(3)?.sum(1)?.broadcast_div(&denominator)?;
            }
        }

        predictions.summaries = summaries;
        Ok(predictions)
    }

    pub fn loss(&self, predictions: &GapPredictions) -> Result<GapLosses> {
        let (triplet, num_loss_examples) = triplet_loss(
            &predictions.similarity,
            &predictions.image_ids,
            &predictions.image_ids_gathered,
            self.config.triplet_loss_margin,
            self.config.triplet_loss_use_semihard,
        )?;
        let mut summaries = predictions.summaries.clone();
        summaries.scalar("loss/num_loss_examples", &num_loss_examples)?;
        summaries.scalar("loss/triplet_loss", &triplet)?;
        Ok(GapLosses {
            triplet,
            image_attention_log: predictions.image_attention_log_loss.clone(),
            caption_attention_log: predictions.caption_attention_log_loss.clone(),
            regularization: None,
            summaries,
        })
    }

    pub fn retrieval_accuracy(&self, predictions: &GapPredictions) -> Result<f32> {
        retrieval_accuracy(
            &predictions.similarity,
            &predictions.image_ids,
            &predictions.image_ids_gathered,
        )
    }

    /// `[B, R]` saliency logits of image regions.
    pub fn image_saliency(&self, image_features: &Tensor) -> Result<Tensor> {
        let heads = self.saliency_heads()?;
        let image_feature = self.project_images(image_features)?;
        Ok(heads.image.forward(&image_feature)?.squeeze(2)?)
    }

    /// `[V]` saliency logit of every vocabulary word (OOV row excluded).
    pub fn word_saliency(&self) -> Result<Tensor> {
        let heads = self.saliency_heads()?;
        let device = self.vocabulary.weights().device();
        let ids = Tensor::arange(0u32, self.vocabulary.vocab_size() as u32, device)?;
        let mut embedding = self.vocabulary.embed(&ids)?;
        if self.config.l2_norm_for_word_saliency {
            embedding = l2_normalize(&embedding, 1)?;
        }
        Ok(heads.word.forward(&embedding)?.squeeze(1)?)
    }

    /// Per-region similarity to each category word, weighted by saliency.
    pub fn image_score_map(&self, image_features: &Tensor, categories: &[String]) -> Result<ScoreMap> {
        let heads = self.saliency_heads()?;
        let image_feature = self.project_images(image_features)?;
        let saliency = heads.image.forward(&image_feature)?.squeeze(2)?;

        let device = image_feature.device();
        let ids = self.vocabulary.ids(categories, &[categories.len()], device)?;
        let category_feature = l2_normalize(&self.vocabulary.embed(&ids)?, 1)?;
        // [B, R, E] x [E, K]
        let similarity = l2_normalize(&image_feature, 2)?.broadcast_matmul(&category_feature.t()?)?;

        let low = saliency.min_keepdim(1)?;
        let high = saliency.max_keepdim(1)?;
        let normalized = saliency
            .broadcast_sub(&low)?
            .broadcast_div(&((high - &low)? + EPSILON)?)?;
        let score_map = similarity.broadcast_mul(&normalized.unsqueeze(2)?)?;
        Ok(ScoreMap { saliency, score_map })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    fn words(list: &[&str]) -> Vec<String> {
        list.iter().map(|w| w.to_string()).collect()
    }

    fn scalar(t: &Tensor) -> f32 {
        t.to_scalar::<f32>().unwrap()
    }

    fn model(config: &GapConfig, store: &ParamStore) -> GapModel {
        store
            .insert(
                "image_proj.weight",
                Tensor::new(&[[1f32, 0.0], [0.0, 1.0]], &Device::Cpu).unwrap(),
            )
            .unwrap();
        let matrix = ndarray::arr2(&[[1f32, 0.0], [0.0, 1.0]]);
        let mut rng = StdRng::seed_from_u64(5);
        GapModel::new(config, &words(&["cat", "dog"]), Some(&matrix), 2, &mut rng, store).unwrap()
    }

    fn config(use_saliency_score: bool) -> GapConfig {
        GapConfig {
            common_dimensions: 2,
            word_embedding_trainable: false,
            use_saliency_score,
            ..GapConfig::default()
        }
    }

    fn inputs() -> GapInputs {
        GapInputs {
            image_ids: vec![7],
            image_features: Tensor::new(&[[[1f32, 0.0], [1.0, 0.0]]], &Device::Cpu).unwrap(),
            captions: vec![vec![words(&["cat"]), words(&["dog", "cat"])]],
        }
    }

    #[test]
    fn test_pairwise_similarity() {
        let image = Tensor::new(&[[[1f32, 0.0], [0.0, 2.0]]], &Device::Cpu).unwrap();
        let text = Tensor::new(&[[[3f32, 1.0]]], &Device::Cpu).unwrap();
        let sim = pairwise_similarity(&image, &text, None).unwrap();
        assert_eq!(sim.dims(), &[1, 2, 1, 1]);
        let values: Vec<f32> = sim.flatten_all().unwrap().to_vec1().unwrap();
        assert_eq!(values, vec![3.0, 2.0]);

        let dropped = pairwise_similarity(&image, &text, Some(0.5)).unwrap();
        assert_eq!(dropped.dims(), &[1, 2, 1, 1]);

        let wide = Tensor::zeros((1, 1, 3), DType::F32, &Device::Cpu).unwrap();
        assert!(matches!(
            pairwise_similarity(&image, &wide, None),
            Err(WsodError::Shape { .. })
        ));
    }

    #[test]
    fn test_gather_in_batch_captions() {
        let captions = vec![
            vec![words(&["a"]), words(&["b", "c"])],
            vec![],
            vec![words(&["d"])],
        ];
        let (ids, gathered) = gather_in_batch_captions(&[1, 2, 3], &captions).unwrap();
        assert_eq!(ids, vec![1, 1, 3]);
        assert_eq!(gathered, vec![words(&["a"]), words(&["b", "c"]), words(&["d"])]);
        assert!(gather_in_batch_captions(&[1], &captions).is_err());
    }

    #[test]
    fn test_triplet_loss_zero_when_separated() {
        let sim = Tensor::new(&[[1f32, 0.0], [0.0, 1.0]], &Device::Cpu).unwrap();
        for semihard in [false, true] {
            let (loss, count) = triplet_loss(&sim, &[1, 2], &[1, 2], 0.1, semihard).unwrap();
            assert_eq!(scalar(&loss), 0.0);
            assert_eq!(scalar(&count), 0.0);
        }
    }

    #[test]
    fn test_triplet_loss_non_negative() {
        let sim = Tensor::new(&[[0.1f32, 0.9, 0.5], [0.8, 0.2, 0.3]], &Device::Cpu).unwrap();
        for semihard in [false, true] {
            let (loss, _) = triplet_loss(&sim, &[1, 2], &[1, 2, 2], 0.2, semihard).unwrap();
            assert!(scalar(&loss) >= 0.0);
        }
    }

    #[test]
    fn test_semihard_picks_outside_negative() {
        // distances: positive 0.5, negatives 0.1 (hardest) and 0.8 (outside)
        let sim = Tensor::new(&[[0.5f32, 0.9, 0.2]], &Device::Cpu).unwrap();
        let (hard, _) = triplet_loss(&sim, &[1], &[1, 2, 3], 0.4, false).unwrap();
        let (semi, _) = triplet_loss(&sim, &[1], &[1, 2, 3], 0.4, true).unwrap();
        assert!((scalar(&hard) - 0.8).abs() < 1e-5);
        assert!((scalar(&semi) - 0.1).abs() < 1e-5);

        // no negative beyond the positive: fall back to the hardest
        let sim = Tensor::new(&[[0.5f32, 0.9]], &Device::Cpu).unwrap();
        let (fallback, _) = triplet_loss(&sim, &[1], &[1, 2], 0.4, true).unwrap();
        assert!((scalar(&fallback) - 0.8).abs() < 1e-5);
    }

    #[test]
    fn test_retrieval_accuracy() {
        let sim = Tensor::new(&[[0.9f32, 0.1, 0.0], [0.7, 0.2, 0.1]], &Device::Cpu).unwrap();
        let accuracy = retrieval_accuracy(&sim, &[1, 2], &[1, 2, 2]).unwrap();
        assert!((accuracy - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_average_pooling() {
        let store = ParamStore::new(&Device::Cpu);
        let gap = model(&config(false), &store);
        let predictions = gap.predict(&inputs(), false).unwrap();
        assert_eq!(predictions.image_ids_gathered, vec![7, 7]);
        let sim: Vec<Vec<f32>> = predictions.similarity.to_vec2().unwrap();
        assert!((sim[0][0] - 1.0).abs() < 1e-5);
        assert!((sim[0][1] - 0.5).abs() < 1e-5);
        assert!(predictions.image_attention.is_none());
        assert!(gap.word_saliency().is_err());
    }

    #[test]
    fn test_uniform_saliency_matches_average() {
        let store = ParamStore::new(&Device::Cpu);
        for scope in ["image_saliency", "word_saliency"] {
            store
                .insert(
                    &format!("{scope}.weight"),
                    Tensor::zeros((1, 2), DType::F32, &Device::Cpu).unwrap(),
                )
                .unwrap();
        }
        let config = GapConfig {
            image_regularizer_weight: 0.5,
            text_regularizer_weight: 1.0,
            ..config(true)
        };
        let gap = model(&config, &store);
        let predictions = gap.predict(&inputs(), false).unwrap();
        let sim: Vec<Vec<f32>> = predictions.similarity.to_vec2().unwrap();
        assert!((sim[0][0] - 1.0).abs() < 1e-5);
        assert!((sim[0][1] - 0.5).abs() < 1e-5);

        // two regions at 1/2 each
        let image_log = scalar(predictions.image_attention_log_loss.as_ref().unwrap());
        assert!((image_log - 0.5 * 2.0 * 0.5f32.ln()).abs() < 1e-5);
        // captions of length 1 and 2: (0 + 2 ln 0.5) / 2
        let caption_log = scalar(predictions.caption_attention_log_loss.as_ref().unwrap());
        assert!((caption_log - 0.5f32.ln()).abs() < 1e-5);

        let losses = gap.loss(&predictions).unwrap();
        assert_eq!(losses.named().len(), 3);
        assert!(losses.summaries.get_scalar("loss/image_attention_max").is_some());
        assert!(scalar(&losses.triplet) >= 0.0);
        let total = scalar(&losses.total().unwrap());
        let sum: f32 = losses.named().iter().map(|(_, l)| scalar(l)).sum();
        assert!((total - sum).abs() < 1e-5);

        assert_eq!(gap.word_saliency().unwrap().dims(), &[2]);
        let map = gap
            .image_score_map(&inputs().image_features, &words(&["cat", "dog"]))
            .unwrap();
        assert_eq!(map.score_map.dims(), &[1, 2, 2]);
        assert_eq!(gap.image_saliency(&inputs().image_features).unwrap().dims(), &[1, 2]);
    }

    #[test]
    fn test_training_dropout_and_shape_checks() {
        let store = ParamStore::new(&Device::Cpu);
        let config = GapConfig {
            dropout_keep_prob: 0.5,
            ..config(true)
        };
        let gap = model(&config, &store);
        let train = gap.predict(&inputs(), true).unwrap();
        assert_eq!(train.similarity.dims(), &[1, 2]);

        let bad = GapInputs {
            image_features: Tensor::zeros((1, 2, 3), DType::F32, &Device::Cpu).unwrap(),
            ..inputs()
        };
        assert!(matches!(gap.predict(&bad, false), Err(WsodError::Shape { .. })));
    }
}
