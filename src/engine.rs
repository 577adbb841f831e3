use anyhow::{ensure, Result};

/// Maximum decoder context length, including the 3-token seed.
pub const N_TEXT_CTX: usize = 448;

/// Cache geometry of the decoder.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ModelDims {
    pub n_layer: usize,
    pub n_state: usize,
}

impl Default for ModelDims {
    fn default() -> Self {
        Self {
            n_layer: 6,
            n_state: 512,
        }
    }
}

/// Per-layer cross-attention keys/values produced by the encoder.
/// Opaque to the decode loop; only the engine interprets the layout.
pub struct CrossAttention {
    pub k: Vec<f32>,
    pub v: Vec<f32>,
}

/// Decoder self-attention key/value cache, shape [n_layer, 1, N_TEXT_CTX, n_state].
///
/// Each decode step consumes the cache by value and returns a replacement;
/// old and new cache never alias within one step.
pub struct KvCache {
    pub k: Vec<f32>,
    pub v: Vec<f32>,
}

impl KvCache {
    pub fn zeroed(dims: ModelDims) -> Self {
        let len = dims.n_layer * N_TEXT_CTX * dims.n_state;
        Self {
            k: vec![0.0; len],
            v: vec![0.0; len],
        }
    }
}

/// Logits for a batch of positions, shape [n_positions, n_vocab].
pub struct Logits {
    data: Vec<f32>,
    n_vocab: usize,
}

impl Logits {
    pub fn new(data: Vec<f32>, n_vocab: usize) -> Result<Self> {
        ensure!(n_vocab > 0, "empty vocabulary");
        ensure!(
            !data.is_empty() && data.len() % n_vocab == 0,
            "logits length {} is not a multiple of vocab size {}",
            data.len(),
            n_vocab
        );
        Ok(Self { data, n_vocab })
    }

    /// Logits at the final position.
    pub fn last(&self) -> &[f32] {
        &self.data[self.data.len() - self.n_vocab..]
    }
}

pub struct DecodeStep {
    pub logits: Logits,
    pub cache: KvCache,
}

/// The encoder/decoder pair behind the transcription loop.
///
/// Implementations own the two inference sessions; they are constructed once
/// and reused for the process lifetime. `offset` marks the position at which
/// `tokens` begin writing into the cache.
pub trait InferenceEngine {
    fn dims(&self) -> ModelDims;

    fn encode(&mut self, mel: &[f32]) -> Result<CrossAttention>;

    fn decode_step(
        &mut self,
        tokens: &[i64],
        cache: KvCache,
        cross: &CrossAttention,
        offset: usize,
    ) -> Result<DecodeStep>;
}
