//! Caption classifier predicting image-level object labels.

use candle_core::{Module, Tensor};

use crate::config::{Activation, Nod5Config, TextEncoding};
use crate::error::Result;
use crate::hyperparams::FullyConnected;
use crate::masked::{masked_avg, masked_maximum};
use crate::params::ParamStore;
use crate::vocab::{EmbeddingTable, TokenBatch};

/// Pools `[B, L, E]` token features over valid tokens into `[B, E]`.
pub fn encode_text(features: &Tensor, mask: &Tensor, encoding: TextEncoding) -> Result<Tensor> {
    let mask = mask.unsqueeze(2)?;
    let pooled = match encoding {
        TextEncoding::AvgPool => masked_avg(features, &mask, 1)?,
        TextEncoding::MaxPool => masked_maximum(features, &mask, 1)?,
    };
    Ok(pooled.squeeze(1)?)
}

/// Embeds a caption with the open vocabulary, pools it and maps it to `C`
/// class logits.
#[derive(Debug, Clone)]
pub struct ObjectPredictor {
    embedding: EmbeddingTable,
    encoding: TextEncoding,
    classifier: FullyConnected,
}

impl ObjectPredictor {
    pub fn new(
        config: &Nod5Config,
        embedding: EmbeddingTable,
        num_classes: usize,
        store: &ParamStore,
    ) -> Result<Self> {
        let embedding = if config.train_word_embedding {
            embedding.trainable(store, "object_prediction/word_embedding")?
        } else {
            embedding
        };
        let classifier = FullyConnected::new(
            embedding.dims(),
            num_classes,
            &config.fc_hyperparams,
            Some(Activation::None),
            store,
            "object_prediction/predicted_logits",
        )?;
        Ok(Self {
            embedding,
            encoding: config.text_encoding,
            classifier,
        })
    }

    /// `[B, C]` logits for a batch of token lists.
    pub fn forward(&self, texts: &TokenBatch) -> Result<Tensor> {
        let device = self.embedding.weights().device();
        let (_, features) = self.embedding.embed_batch(texts, device)?;
        let pooled = encode_text(&features, &texts.mask(device)?, self.encoding)?;
        Ok(self.classifier.forward(&pooled)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vocab::INIT_WIDTH;
    use candle_core::Device;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn words(list: &[&str]) -> Vec<String> {
        list.iter().map(|w| w.to_string()).collect()
    }

    fn table() -> EmbeddingTable {
        let matrix = ndarray::arr2(&[[2f32, 0.0], [0.0, 4.0]]);
        let mut rng = StdRng::seed_from_u64(1);
        EmbeddingTable::new(
            &words(&["dog", "cat"]),
            Some(&matrix),
            2,
            INIT_WIDTH,
            &mut rng,
            &Device::Cpu,
        )
        .unwrap()
    }

    #[test]
    fn test_encode_text_ignores_padding() {
        let features = Tensor::new(
            &[[[2f32, 0.0], [0.0, 4.0], [9.0, 9.0]]],
            &Device::Cpu,
        )
        .unwrap();
        let mask = Tensor::new(&[[1f32, 1.0, 0.0]], &Device::Cpu).unwrap();

        let avg: Vec<Vec<f32>> = encode_text(&features, &mask, TextEncoding::AvgPool)
            .unwrap()
            .to_vec2()
            .unwrap();
        assert_eq!(avg, vec![vec![1.0, 2.0]]);
        let max: Vec<Vec<f32>> = encode_text(&features, &mask, TextEncoding::MaxPool)
            .unwrap()
            .to_vec2()
            .unwrap();
        assert_eq!(max, vec![vec![2.0, 4.0]]);
    }

    #[test]
    fn test_object_predictor_logits() {
        let store = ParamStore::new(&Device::Cpu);
        store
            .insert(
                "object_prediction/predicted_logits.weight",
                Tensor::new(&[[1f32, 0.0], [0.0, 1.0], [1.0, 1.0]], &Device::Cpu).unwrap(),
            )
            .unwrap();
        let predictor = ObjectPredictor::new(&Nod5Config::default(), table(), 3, &store).unwrap();
        let texts = TokenBatch::new(&[words(&["dog", "cat"]), words(&["cat"])]);
        let logits: Vec<Vec<f32>> = predictor.forward(&texts).unwrap().to_vec2().unwrap();
        assert_eq!(logits, vec![vec![1.0, 2.0, 3.0], vec![0.0, 4.0, 4.0]]);
        assert!(store.get("object_prediction/word_embedding").unwrap().is_none());
    }

    #[test]
    fn test_trainable_embedding_is_registered() {
        let store = ParamStore::new(&Device::Cpu);
        let config = Nod5Config {
            train_word_embedding: true,
            text_encoding: TextEncoding::MaxPool,
            ..Nod5Config::default()
        };
        let predictor = ObjectPredictor::new(&config, table(), 4, &store).unwrap();
        let texts = TokenBatch::new(&[words(&["dog"])]);
        assert_eq!(predictor.forward(&texts).unwrap().dims(), &[1, 4]);
        assert!(store.get("object_prediction/word_embedding").unwrap().is_some());
    }
}
