//! Streaming speech transcription on top of a Whisper-style model.
//!
//! Audio flows from a capture device into a shared [`SampleRing`], where a
//! worker thread periodically drains it, carves out up to 30 seconds of
//! speech, computes log-mel features and runs a constrained greedy decode.
//! The model itself sits behind the [`InferenceEngine`] trait so any backend
//! that can run the encoder and one decoder step can plug in.

pub mod audio;
pub mod config;
pub mod engine;
pub mod pipeline;
pub mod transcribe;

pub use audio::{CaptureSource, SampleRing, SourceFormat};
pub use config::Config;
pub use engine::{CrossAttention, DecodeStep, InferenceEngine, KvCache, Logits, ModelDims};
pub use pipeline::Pipeline;
pub use transcribe::{Transcriber, Transcription};
