//! Image-level labels from captions.
//!
//! Class names and caption tokens are first normalised through a fixed
//! [`SynonymTable`] so multi-word class names ("traffic light") meet the
//! single words used by captions and word vectors ("stoplight"). Labels are
//! then produced by exact token matching, or by the nearest class in the
//! open-vocabulary embedding space ([`PseudoLabeler`]).

use std::collections::HashMap;

use candle_core::{DType, Device, Tensor};

use crate::error::{Result, WsodError};
use crate::masked::{l2_normalize, masked_maximum};
use crate::vocab::{EmbeddingTable, TokenBatch};

/// Label value above which a soft label counts as present.
///
/// Predicted labels are sigmoid probabilities and never exactly zero, so
/// every consumer (label merging, MIDN example masking, OICR mining) tests
/// against this value through [`positive_labels`].
pub const POSITIVE_LABEL_THRESHOLD: f64 = 0.5;

/// `[B, C]` f32 mask, 1 where a label counts as present.
pub fn positive_labels(labels: &Tensor) -> Result<Tensor> {
    Ok(labels.gt(POSITIVE_LABEL_THRESHOLD)?.to_dtype(DType::F32)?)
}

const COCO_SYNONYMS: &[(&str, &str)] = &[
    ("traffic light", "stoplight"),
    ("fire hydrant", "hydrant"),
    ("stop sign", "sign"),
    ("parking meter", "meter"),
    ("sports ball", "ball"),
    ("baseball bat", "bat"),
    ("baseball glove", "glove"),
    ("tennis racket", "racket"),
    ("wine glass", "wineglass"),
    ("hot dog", "hotdog"),
    ("potted plant", "plant"),
    ("dining table", "table"),
    ("cell phone", "cellphone"),
    ("teddy bear", "teddy"),
    ("hair drier", "hairdryer"),
];

const PASCAL_SYNONYMS: &[(&str, &str)] = &[
    ("aeroplane", "airplane"),
    ("diningtable", "table"),
    ("pottedplant", "plant"),
    ("tvmonitor", "tv"),
];

/// Fixed class-name normalisation table.
#[derive(Debug, Clone)]
pub struct SynonymTable {
    entries: HashMap<String, String>,
}

impl Default for SynonymTable {
    fn default() -> Self {
        Self::from_pairs(COCO_SYNONYMS.iter().chain(PASCAL_SYNONYMS))
    }
}

impl SynonymTable {
    pub fn from_pairs<'a, I>(pairs: I) -> Self
    where
        I: IntoIterator<Item = &'a (&'a str, &'a str)>,
    {
        Self {
            entries: pairs
                .into_iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }

    pub fn normalize<'a>(&'a self, name: &'a str) -> &'a str {
        self.entries.get(name).map(String::as_str).unwrap_or(name)
    }

    pub fn normalize_all(&self, names: &[String]) -> Vec<String> {
        names.iter().map(|n| self.normalize(n).to_string()).collect()
    }

    /// Normalises a token sequence, collapsing two-token keys into one word.
    ///
    /// The output is padded with empty tokens back to the input length.
    pub fn normalize_tokens(&self, tokens: &[String]) -> Vec<String> {
        let mut out = Vec::with_capacity(tokens.len());
        let mut i = 0;
        while i < tokens.len() {
            if i + 1 < tokens.len() {
                let pair = format!("{} {}", tokens[i], tokens[i + 1]);
                if let Some(word) = self.entries.get(&pair) {
                    out.push(word.clone());
                    i += 2;
                    continue;
                }
            }
            out.push(self.normalize(&tokens[i]).to_string());
            i += 1;
        }
        out.resize(tokens.len(), String::new());
        out
    }
}

/// `[B, C]` labels: 1 where a caption token equals the class name.
pub fn exact_match_labels(batch: &TokenBatch, classes: &[String], device: &Device) -> Result<Tensor> {
    let index: HashMap<&str, usize> = classes
        .iter()
        .enumerate()
        .map(|(i, c)| (c.as_str(), i))
        .collect();
    let num_classes = classes.len();
    let mut labels = vec![0f32; batch.batch * num_classes];
    for b in 0..batch.batch {
        let row = &batch.row(b)[..batch.lengths[b] as usize];
        for token in row {
            if let Some(&c) = index.get(token.as_str()) {
                labels[b * num_classes + c] = 1.0;
            }
        }
    }
    Ok(Tensor::from_vec(labels, (batch.batch, num_classes), device)?)
}

/// Keeps `primary` rows holding any positive label, `fallback` rows otherwise.
pub fn merge_labels(primary: &Tensor, fallback: &Tensor) -> Result<Tensor> {
    if primary.dims() != fallback.dims() {
        return Err(WsodError::shape(
            "merge_labels",
            format!("{:?} vs {:?}", primary.dims(), fallback.dims()),
        ));
    }
    let any = positive_labels(primary)?
        .max_keepdim(1)?
        .ne(0f32)?
        .broadcast_as(primary.shape())?;
    Ok(any.where_cond(primary, fallback)?)
}

/// One-hot `[B, C]` rows from `[B]` class indices.
pub fn one_hot(indices: &Tensor, num_classes: usize) -> Result<Tensor> {
    let classes = Tensor::arange(0u32, num_classes as u32, indices.device())?.unsqueeze(0)?;
    let indices = indices.to_dtype(DType::U32)?.unsqueeze(1)?;
    Ok(classes.broadcast_eq(&indices)?.to_dtype(DType::F32)?)
}

/// Assigns each caption the class closest to any of its in-vocabulary tokens.
#[derive(Debug, Clone)]
pub struct PseudoLabeler {
    synonyms: SynonymTable,
    /// `[C, E]` L2-normalised class embeddings
    class_embeddings: Tensor,
    table: EmbeddingTable,
}

impl PseudoLabeler {
    /// `classes` are raw class names; `table` is the frozen open vocabulary.
    pub fn new(classes: &[String], table: EmbeddingTable, synonyms: SynonymTable) -> Result<Self> {
        let names = synonyms.normalize_all(classes);
        for name in &names {
            if !table.contains(name) {
                tracing::warn!("Unknown class name {name}, using the out-of-vocabulary vector");
            }
        }
        let device = table.weights().device().clone();
        let ids = table.ids(&names, &[names.len()], &device)?;
        let class_embeddings = l2_normalize(&table.embed(&ids)?, 1)?;
        Ok(Self {
            synonyms,
            class_embeddings,
            table,
        })
    }

    pub fn num_classes(&self) -> usize {
        self.class_embeddings.dim(0).unwrap_or(0)
    }

    /// `[B, C]` best token-to-class cosine similarity per caption.
    pub fn similarity(&self, captions: &[Vec<String>]) -> Result<Tensor> {
        let device = self.class_embeddings.device();
        let normalized: Vec<Vec<String>> = captions
            .iter()
            .map(|c| self.synonyms.normalize_tokens(c))
            .collect();
        let batch = TokenBatch::new(&normalized);
        let (ids, text) = self.table.embed_batch(&batch, device)?;
        let text = l2_normalize(&text, 2)?;

        // [B, L, E] x [E, C] -> [B, L, C]
        let similarity = text.broadcast_matmul(&self.class_embeddings.t()?)?;
        let known = ids
            .ne(self.table.oov_id())?
            .to_dtype(DType::F32)?
            .unsqueeze(2)?;
        Ok(masked_maximum(&similarity, &known, 1)?.squeeze(1)?)
    }

    /// One-hot `[B, C]` pseudo labels.
    pub fn labels(&self, captions: &[Vec<String>]) -> Result<Tensor> {
        let best = self.similarity(captions)?.argmax(1)?;
        one_hot(&best, self.num_classes())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vocab::INIT_WIDTH;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn words(list: &[&str]) -> Vec<String> {
        list.iter().map(|w| w.to_string()).collect()
    }

    fn open_vocabulary() -> EmbeddingTable {
        let vocabulary = words(&["stoplight", "signal", "dog", "puppy", "cat"]);
        let matrix = ndarray::arr2(&[
            [1f32, 0.0, 0.0],
            [0.9, 0.1, 0.0],
            [0.0, 1.0, 0.0],
            [0.1, 0.9, 0.1],
            [0.0, 0.0, 1.0],
        ]);
        let mut rng = StdRng::seed_from_u64(3);
        EmbeddingTable::new(&vocabulary, Some(&matrix), 3, INIT_WIDTH, &mut rng, &Device::Cpu)
            .unwrap()
    }

    #[test]
    fn test_synonym_table() {
        let table = SynonymTable::default();
        assert_eq!(table.normalize("traffic light"), "stoplight");
        assert_eq!(table.normalize("aeroplane"), "airplane");
        assert_eq!(table.normalize("person"), "person");
        assert_eq!(
            table.normalize_tokens(&words(&["a", "traffic", "light", "here"])),
            words(&["a", "stoplight", "here", ""])
        );
        assert_eq!(
            table.normalize_tokens(&words(&["tvmonitor"])),
            words(&["tv"])
        );
    }

    #[test]
    fn test_exact_match_labels() {
        let classes = words(&["stoplight", "dog", "cat"]);
        let batch = TokenBatch::new(&[words(&["a", "dog", "and", "cat"]), words(&["nothing"])]);
        let labels: Vec<Vec<f32>> = exact_match_labels(&batch, &classes, &Device::Cpu)
            .unwrap()
            .to_vec2()
            .unwrap();
        assert_eq!(labels, vec![vec![0.0, 1.0, 1.0], vec![0.0, 0.0, 0.0]]);
    }

    #[test]
    fn test_positive_labels() {
        let labels = Tensor::new(&[[0.33f32, 0.5, 0.51, 1.0]], &Device::Cpu).unwrap();
        let positive: Vec<Vec<f32>> = positive_labels(&labels).unwrap().to_vec2().unwrap();
        assert_eq!(positive, vec![vec![0.0, 0.0, 1.0, 1.0]]);
    }

    #[test]
    fn test_merge_labels() {
        let exact = Tensor::new(&[[0f32, 1.0], [0.0, 0.0]], &Device::Cpu).unwrap();
        let pseudo = Tensor::new(&[[1f32, 0.0], [1.0, 0.0]], &Device::Cpu).unwrap();
        let merged: Vec<Vec<f32>> = merge_labels(&exact, &pseudo).unwrap().to_vec2().unwrap();
        assert_eq!(merged, vec![vec![0.0, 1.0], vec![1.0, 0.0]]);
    }

    #[test]
    fn test_pseudo_label_picks_stoplight() {
        let labeler = PseudoLabeler::new(
            &words(&["traffic light", "dog"]),
            open_vocabulary(),
            SynonymTable::default(),
        )
        .unwrap();
        let captions = vec![
            words(&["the", "signal", "is", "red"]),
            words(&["a", "puppy", "runs"]),
            words(&["a", "traffic", "light"]),
        ];
        let labels: Vec<Vec<f32>> = labeler.labels(&captions).unwrap().to_vec2().unwrap();
        assert_eq!(
            labels,
            vec![vec![1.0, 0.0], vec![0.0, 1.0], vec![1.0, 0.0]]
        );

        let similarity: Vec<Vec<f32>> = labeler.similarity(&captions).unwrap().to_vec2().unwrap();
        assert!((similarity[2][0] - 1.0).abs() < 1e-5);
    }

    #[test]
    fn test_unknown_class_uses_oov() {
        let labeler = PseudoLabeler::new(
            &words(&["unicorn", "cat"]),
            open_vocabulary(),
            SynonymTable::default(),
        )
        .unwrap();
        let labels: Vec<Vec<f32>> = labeler
            .labels(&[words(&["a", "cat"])])
            .unwrap()
            .to_vec2()
            .unwrap();
        assert_eq!(labels, vec![vec![0.0, 1.0]]);
    }
}
