//! Vocabularies and word embedding tables.
//!
//! A table over a vocabulary of `V` words holds `V + 1` rows; the last row
//! is shared by every out-of-vocabulary token, including the empty padding
//! token. Rows come from a pretrained `[V, E]` matrix when one is given and
//! are otherwise drawn uniformly from `[-init_width, init_width]` with the
//! caller's seeded generator, so two runs with the same seed agree.

use std::collections::HashMap;
use std::fs::File;
use std::path::Path;

use candle_core::{DType, Device, Tensor};
use ndarray::Array2;
use ndarray_npy::ReadNpyExt;
use rand::rngs::StdRng;
use rand::Rng;

use crate::error::{Result, WsodError};
use crate::masked::sequence_mask;
use crate::params::ParamStore;

/// Half-width of the uniform initialisation of embedding rows.
pub const INIT_WIDTH: f32 = 0.03;

/// Reads one entry per line, skipping blank lines.
pub fn read_vocabulary(path: &Path) -> Result<Vec<String>> {
    let text = std::fs::read_to_string(path)?;
    let vocabulary: Vec<String> = text
        .lines()
        .map(|line| line.trim_end().to_string())
        .filter(|line| !line.is_empty())
        .collect();
    tracing::info!(
        "Read {} entries from {}",
        vocabulary.len(),
        path.display()
    );
    Ok(vocabulary)
}

/// Reads a `[V, E]` float32 `.npy` matrix.
pub fn read_embedding_matrix(path: &Path) -> Result<Array2<f32>> {
    let matrix = Array2::<f32>::read_npy(File::open(path)?)?;
    tracing::info!("Read embedding matrix {:?} from {}", matrix.dim(), path.display());
    Ok(matrix)
}

/// Lower-cases `text` and splits it on anything that is not alphanumeric.
pub fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|token| !token.is_empty())
        .map(|token| token.to_lowercase())
        .collect()
}

/// Ragged token lists padded to a rectangle with empty tokens.
#[derive(Debug, Clone, PartialEq)]
pub struct TokenBatch {
    /// Row-major `[batch, max_len]` tokens
    pub tokens: Vec<String>,
    pub lengths: Vec<u32>,
    pub batch: usize,
    pub max_len: usize,
}

impl TokenBatch {
    pub fn new(texts: &[Vec<String>]) -> Self {
        let max_len = texts.iter().map(|t| t.len()).max().unwrap_or(0);
        let mut tokens = Vec::with_capacity(texts.len() * max_len);
        for text in texts {
            tokens.extend(text.iter().cloned());
            tokens.extend(std::iter::repeat(String::new()).take(max_len - text.len()));
        }
        Self {
            tokens,
            lengths: texts.iter().map(|t| t.len() as u32).collect(),
            batch: texts.len(),
            max_len,
        }
    }

    pub fn row(&self, i: usize) -> &[String] {
        &self.tokens[i * self.max_len..(i + 1) * self.max_len]
    }

    pub fn lengths_tensor(&self, device: &Device) -> Result<Tensor> {
        Ok(Tensor::new(self.lengths.as_slice(), device)?)
    }

    /// `[batch, max_len]` float mask of real tokens.
    pub fn mask(&self, device: &Device) -> Result<Tensor> {
        Ok(sequence_mask(&self.lengths_tensor(device)?, self.max_len)?)
    }
}

#[derive(Debug, Clone)]
pub struct EmbeddingTable {
    index: HashMap<String, u32>,
    vocab_size: usize,
    dims: usize,
    weights: Tensor,
    max_norm: Option<f64>,
}

impl EmbeddingTable {
    /// Builds a frozen table; see [`EmbeddingTable::trainable`].
    pub fn new(
        vocabulary: &[String],
        pretrained: Option<&Array2<f32>>,
        dims: usize,
        init_width: f32,
        rng: &mut StdRng,
        device: &Device,
    ) -> Result<Self> {
        let vocab_size = vocabulary.len();
        let mut uniform = |n: usize| -> Vec<f32> {
            (0..n)
                .map(|_| init_width * (rng.random::<f32>() * 2.0 - 1.0))
                .collect()
        };

        let mut data = match pretrained {
            Some(matrix) => {
                if matrix.dim() != (vocab_size, dims) {
                    return Err(WsodError::shape(
                        "EmbeddingTable::new",
                        format!(
                            "embedding matrix is {:?}, vocabulary needs ({vocab_size}, {dims})",
                            matrix.dim()
                        ),
                    ));
                }
                matrix.iter().copied().collect::<Vec<f32>>()
            }
            None => uniform(vocab_size * dims),
        };
        data.extend(uniform(dims));

        let mut index = HashMap::with_capacity(vocab_size);
        for (i, word) in vocabulary.iter().enumerate() {
            index.entry(word.clone()).or_insert(i as u32);
        }

        Ok(Self {
            index,
            vocab_size,
            dims,
            weights: Tensor::from_vec(data, (vocab_size + 1, dims), device)?,
            max_norm: None,
        })
    }

    /// Moves the weights into `store` as a trainable variable named `name`.
    pub fn trainable(mut self, store: &ParamStore, name: &str) -> Result<Self> {
        self.weights = store.insert(name, self.weights)?;
        Ok(self)
    }

    /// Rescales looked-up rows whose L2 norm exceeds `max_norm`.
    pub fn with_max_norm(mut self, max_norm: f64) -> Self {
        self.max_norm = Some(max_norm);
        self
    }

    pub fn vocab_size(&self) -> usize {
        self.vocab_size
    }

    pub fn dims(&self) -> usize {
        self.dims
    }

    pub fn oov_id(&self) -> u32 {
        self.vocab_size as u32
    }

    pub fn weights(&self) -> &Tensor {
        &self.weights
    }

    pub fn contains(&self, token: &str) -> bool {
        self.index.contains_key(token)
    }

    pub fn token_id(&self, token: &str) -> u32 {
        self.index.get(token).copied().unwrap_or(self.oov_id())
    }

    /// Ids of `tokens` shaped by `shape`.
    pub fn ids<S: AsRef<str>>(
        &self,
        tokens: &[S],
        shape: &[usize],
        device: &Device,
    ) -> Result<Tensor> {
        let ids: Vec<u32> = tokens.iter().map(|t| self.token_id(t.as_ref())).collect();
        Ok(Tensor::from_vec(ids, shape, device)?)
    }

    /// Embeds an id tensor of any shape, appending the embedding axis.
    pub fn embed(&self, ids: &Tensor) -> Result<Tensor> {
        let mut shape = ids.dims().to_vec();
        shape.push(self.dims);
        let flat = ids.flatten_all()?.to_dtype(DType::U32)?;
        let mut rows = self.weights.index_select(&flat, 0)?;
        if let Some(max_norm) = self.max_norm {
            let norm = rows.sqr()?.sum_keepdim(1)?.sqrt()?.maximum(1e-12)?;
            let scale = (norm.recip()? * max_norm)?.minimum(1.0)?;
            rows = rows.broadcast_mul(&scale)?;
        }
        Ok(rows.reshape(shape)?)
    }

    /// `[batch, max_len]` ids and `[batch, max_len, E]` embeddings of a batch.
    pub fn embed_batch(&self, batch: &TokenBatch, device: &Device) -> Result<(Tensor, Tensor)> {
        let ids = self.ids(&batch.tokens, &[batch.batch, batch.max_len], device)?;
        let embeddings = self.embed(&ids)?;
        Ok((ids, embeddings))
    }
}
