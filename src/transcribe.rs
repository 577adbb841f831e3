use anyhow::{Context, Result};
use tracing::debug;

use crate::config::Config;
use crate::engine::InferenceEngine;

pub mod decoder;
pub mod mel;
pub mod segment;
pub mod tokenizer;

pub use segment::{Segment, Segmenter};

pub const SAMPLE_RATE: u32 = 16_000;
pub const N_FFT: usize = 400;
pub const N_HOP: usize = 160;
pub const N_MELS: usize = 80;
pub const CHUNK_LENGTH: usize = 30;
pub const N_SAMPLES: usize = CHUNK_LENGTH * SAMPLE_RATE as usize;
pub const N_FRAMES: usize = N_SAMPLES / N_HOP;

/// One decoded cycle: the detected language and whatever text the model
/// produced for the segment. The text may be empty while the language is
/// still reported.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Transcription {
    pub language: &'static str,
    pub text: String,
}

/// The full segment-to-text pipeline around one inference engine.
///
/// `decode` is not reentrant; callers serialize invocations on one instance.
pub struct Transcriber<E> {
    segmenter: Segmenter,
    extractor: mel::FeatureExtractor,
    engine: E,
}

impl<E: InferenceEngine> Transcriber<E> {
    /// Requires the vocabulary and mel filters to be initialized.
    pub fn new(engine: E) -> Result<Self> {
        Ok(Self {
            segmenter: Segmenter::new(),
            extractor: mel::FeatureExtractor::new()?,
            engine,
        })
    }

    /// Initialize the static tables from the configured resource files,
    /// then build the transcriber.
    pub fn from_config(engine: E, config: &Config) -> Result<Self> {
        tokenizer::init_vocabulary_from_file(&config.vocab)?;
        mel::init_filters_from_file(&config.mel_filters)?;
        Self::new(engine)
    }

    /// Run one full cycle over newly captured samples. Returns None when the
    /// audio drained this cycle amounts to silence.
    pub fn decode(
        &mut self,
        samples: &[f32],
        sample_rate: u32,
        channels: usize,
    ) -> Result<Option<Transcription>> {
        let Some(segment) = self.segmenter.segment(samples, sample_rate, channels)? else {
            return Ok(None);
        };

        let mel = self.extractor.extract(&segment.samples, segment.len);
        let cross = self.engine.encode(&mel)?;

        let language_token = decoder::detect_language(&mut self.engine, &cross)?;
        let language =
            tokenizer::language_code(language_token).context("unknown language token")?;

        let outcome = decoder::generate(&mut self.engine, &cross, language_token)?;
        debug!(
            language,
            n_tokens = outcome.tokens.len(),
            sum_logprob = outcome.sum_logprob,
            "decoded segment"
        );

        let text = tokenizer::decode(decoder::trim(&outcome.tokens))?
            .trim()
            .to_owned();

        Ok(Some(Transcription { language, text }))
    }

    /// Drop carryover and pending audio; the next cycle starts fresh.
    pub fn clear(&mut self) {
        self.segmenter.clear();
    }
}
