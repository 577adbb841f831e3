use anyhow::{ensure, Context, Result};

use crate::engine::{CrossAttention, InferenceEngine, KvCache, N_TEXT_CTX};

use super::tokenizer::{
    EOT, LANGUAGES, NO_TIMESTAMPS, SOT, SPACE, SUPPRESS_TOKENS, TIMESTAMP_BEGIN, TRANSCRIBE,
};

/// Upper bound on generation steps per segment.
pub const MAX_DECODE_STEPS: usize = 224;

/// Highest timestamp slot allowed for the first generated token.
const MAX_INITIAL_TIMESTAMP_INDEX: usize = 50;

const SEED_LEN: usize = 3;

pub struct DecodeOutcome {
    pub tokens: Vec<i64>,
    pub sum_logprob: f32,
}

/// Pick the most likely spoken language with a single decode step over the
/// bare start token. The cache this step produces is discarded; the main
/// loop starts from a fresh zero cache.
pub fn detect_language<E: InferenceEngine + ?Sized>(
    engine: &mut E,
    cross: &CrossAttention,
) -> Result<i64> {
    let cache = KvCache::zeroed(engine.dims());
    let step = engine.decode_step(&[SOT], cache, cross, 0)?;
    let row = step.logits.last();

    let mut best: Option<(i64, f32)> = None;
    for &(token, _) in LANGUAGES {
        let Some(&value) = row.get(token as usize) else {
            continue;
        };
        match best {
            Some((_, max)) if value <= max => {}
            _ => best = Some((token, value)),
        }
    }

    best.map(|(token, _)| token)
        .context("logits cover no language tokens")
}

/// Constrained greedy generation against one segment's cross-attention state.
/// Returns the full untrimmed token sequence including the 3-token seed.
pub fn generate<E: InferenceEngine + ?Sized>(
    engine: &mut E,
    cross: &CrossAttention,
    language_token: i64,
) -> Result<DecodeOutcome> {
    let mut tokens = Vec::with_capacity(N_TEXT_CTX + 1);
    tokens.extend_from_slice(&[SOT, language_token, TRANSCRIBE]);

    let mut cache = KvCache::zeroed(engine.dims());
    let mut sum_logprob = 0f32;

    for step in 0..MAX_DECODE_STEPS {
        // past the seed, only the newest token is fed; the cache covers the rest
        let (input, offset) = if tokens.len() > SEED_LEN {
            (&tokens[tokens.len() - 1..], tokens.len() - 1)
        } else {
            (&tokens[..], 0)
        };

        let out = engine.decode_step(input, cache, cross, offset)?;
        cache = out.cache;

        let mut logits = out.logits.last().to_vec();
        ensure!(
            logits.len() > TIMESTAMP_BEGIN as usize,
            "vocab size {} has no timestamp tokens",
            logits.len()
        );

        apply_constraints(&mut logits, &tokens[SEED_LEN..], step);

        let mut next = argmax(&logits) as i64;
        let logprobs = log_softmax(&logits);

        let mut completed = false;
        if *tokens.last().unwrap() != EOT {
            sum_logprob += logprobs[next as usize];
        } else {
            next = EOT;
            completed = true;
        }
        tokens.push(next);

        if completed || tokens.len() > N_TEXT_CTX {
            break;
        }
    }

    Ok(DecodeOutcome {
        tokens,
        sum_logprob,
    })
}

/// Tokens strictly between the seed and the first end-of-text token.
pub fn trim(tokens: &[i64]) -> &[i64] {
    let eot = tokens
        .iter()
        .position(|&t| t == EOT)
        .unwrap_or(tokens.len());
    &tokens[SEED_LEN.min(eot)..eot]
}

/// Apply the logit constraints, in order, disallowing entries by setting
/// them to the minimum representable value. `generated` is the sequence
/// produced so far, excluding the seed.
fn apply_constraints(logits: &mut [f32], generated: &[i64], step: usize) {
    let ts_begin = TIMESTAMP_BEGIN as usize;

    // an immediately empty result is never useful
    if step == 0 {
        logits[SPACE as usize] = f32::MIN;
        logits[EOT as usize] = f32::MIN;
    }

    for &token in SUPPRESS_TOKENS {
        logits[token] = f32::MIN;
    }

    // timestamps are always enabled
    logits[NO_TIMESTAMPS as usize] = f32::MIN;

    // timestamps come in pairs, except directly before end-of-text
    let last_was_timestamp = generated.last().is_some_and(|&t| t >= TIMESTAMP_BEGIN);
    let penultimate_was_timestamp =
        generated.len() < 2 || generated[generated.len() - 2] >= TIMESTAMP_BEGIN;
    if last_was_timestamp {
        if penultimate_was_timestamp {
            for v in &mut logits[ts_begin..] {
                *v = f32::MIN;
            }
        } else {
            for v in &mut logits[..EOT as usize] {
                *v = f32::MIN;
            }
        }
    }

    if step == 0 {
        // the sequence must open with a timestamp from the early window
        for v in &mut logits[..ts_begin] {
            *v = f32::MIN;
        }
        // the vocab may end inside the window; never slice past it
        let beyond = (ts_begin + MAX_INITIAL_TIMESTAMP_INDEX + 1).min(logits.len());
        for v in &mut logits[beyond..] {
            *v = f32::MIN;
        }
    }

    // when timestamps jointly outweigh the best text token, sample a timestamp
    let logprobs = log_softmax(logits);
    let timestamp_logprob = log_sum_exp(&logprobs[ts_begin..]);
    let max_text_logprob = logprobs[..ts_begin]
        .iter()
        .cloned()
        .fold(f32::MIN, f32::max);
    if timestamp_logprob > max_text_logprob {
        for v in &mut logits[..ts_begin] {
            *v = f32::MIN;
        }
    }
}

fn argmax(values: &[f32]) -> usize {
    let mut best = 0;
    for (i, &v) in values.iter().enumerate().skip(1) {
        if v > values[best] {
            best = i;
        }
    }
    best
}

fn log_softmax(values: &[f32]) -> Vec<f32> {
    let max = values.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
    let sum: f64 = values.iter().map(|&v| ((v - max) as f64).exp()).sum();
    let log_sum = sum.ln() as f32;
    values.iter().map(|&v| v - max - log_sum).collect()
}

fn log_sum_exp(logprobs: &[f32]) -> f32 {
    let sum: f64 = logprobs.iter().map(|&v| (v as f64).exp()).sum();
    sum.ln() as f32
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{DecodeStep, Logits, ModelDims};

    const N_VOCAB: usize = 51_865;

    /// Engine whose decoder always favors the scripted token for the step;
    /// marks the caches it returns so cache handling can be asserted.
    struct ScriptedEngine {
        script: Vec<i64>,
        calls: usize,
        last_marker: f32,
    }

    impl ScriptedEngine {
        fn new(script: Vec<i64>) -> Self {
            Self {
                script,
                calls: 0,
                last_marker: 0.0,
            }
        }
    }

    impl InferenceEngine for ScriptedEngine {
        fn dims(&self) -> ModelDims {
            ModelDims::default()
        }

        fn encode(&mut self, _mel: &[f32]) -> Result<CrossAttention> {
            Ok(CrossAttention {
                k: vec![0.0],
                v: vec![0.0],
            })
        }

        fn decode_step(
            &mut self,
            tokens: &[i64],
            cache: KvCache,
            _cross: &CrossAttention,
            offset: usize,
        ) -> Result<DecodeStep> {
            if offset == 0 {
                // a fresh sequence must come with a fresh zero cache
                assert_eq!(cache.k[0], 0.0, "expected a zero cache at offset 0");
            } else {
                assert_eq!(cache.k[0], self.last_marker, "stale cache fed back");
                assert_eq!(tokens.len(), 1, "incremental steps feed one token");
            }

            let favored = self.script[self.calls.min(self.script.len() - 1)];
            self.calls += 1;

            let mut row = vec![0f32; N_VOCAB];
            row[favored as usize] = 10.0;

            let mut cache = cache;
            self.last_marker = self.calls as f32;
            cache.k[0] = self.last_marker;

            Ok(DecodeStep {
                logits: Logits::new(row, N_VOCAB)?,
                cache,
            })
        }
    }

    fn cross() -> CrossAttention {
        CrossAttention {
            k: vec![0.0],
            v: vec![0.0],
        }
    }

    #[test]
    fn language_detection_is_deterministic() {
        let mut engine = ScriptedEngine::new(vec![50261]);
        assert_eq!(detect_language(&mut engine, &cross()).unwrap(), 50261);

        let mut engine = ScriptedEngine::new(vec![50261]);
        assert_eq!(detect_language(&mut engine, &cross()).unwrap(), 50261);
    }

    #[test]
    fn language_detection_ties_favor_first() {
        struct FlatEngine;
        impl InferenceEngine for FlatEngine {
            fn dims(&self) -> ModelDims {
                ModelDims::default()
            }
            fn encode(&mut self, _mel: &[f32]) -> Result<CrossAttention> {
                unreachable!()
            }
            fn decode_step(
                &mut self,
                _tokens: &[i64],
                cache: KvCache,
                _cross: &CrossAttention,
                _offset: usize,
            ) -> Result<DecodeStep> {
                Ok(DecodeStep {
                    logits: Logits::new(vec![1.0; N_VOCAB], N_VOCAB)?,
                    cache,
                })
            }
        }

        let token = detect_language(&mut FlatEngine, &cross()).unwrap();
        assert_eq!(token, LANGUAGES[0].0);
    }

    #[test]
    fn first_generated_token_is_an_early_timestamp() {
        // scripted to want plain text immediately; the masks must force a
        // timestamp from the early window instead
        let mut engine = ScriptedEngine::new(vec![100, EOT]);
        let outcome = generate(&mut engine, &cross(), 50259).unwrap();

        let first = outcome.tokens[SEED_LEN];
        assert!(first >= TIMESTAMP_BEGIN);
        assert!(first <= TIMESTAMP_BEGIN + MAX_INITIAL_TIMESTAMP_INDEX as i64);
    }

    #[test]
    fn eot_wanted_immediately_yields_empty_text() {
        let mut engine = ScriptedEngine::new(vec![EOT]);
        let outcome = generate(&mut engine, &cross(), 50259).unwrap();

        // step 0 forces a timestamp, EOT follows; trimming leaves only the
        // timestamp, which carries no text
        let body = trim(&outcome.tokens);
        assert_eq!(body.len(), 1);
        assert!(body[0] >= TIMESTAMP_BEGIN);
    }

    #[test]
    fn timestamps_never_run_three_in_a_row() {
        // always favoring a timestamp drives the pairing rule through every
        // branch within the step limit
        let mut engine = ScriptedEngine::new(vec![TIMESTAMP_BEGIN + 60]);
        let outcome = generate(&mut engine, &cross(), 50259).unwrap();

        let body = &outcome.tokens[SEED_LEN..];
        for w in body.windows(3) {
            let run = w.iter().all(|&t| t >= TIMESTAMP_BEGIN);
            assert!(!run, "three consecutive timestamps in {w:?}");
        }
    }

    #[test]
    fn narrow_vocab_ending_inside_initial_window_decodes() {
        // a vocab that stops between TIMESTAMP_BEGIN and the end of the
        // initial-timestamp window must still mask cleanly
        struct NarrowEngine;
        impl InferenceEngine for NarrowEngine {
            fn dims(&self) -> ModelDims {
                ModelDims::default()
            }
            fn encode(&mut self, _mel: &[f32]) -> Result<CrossAttention> {
                unreachable!()
            }
            fn decode_step(
                &mut self,
                _tokens: &[i64],
                cache: KvCache,
                _cross: &CrossAttention,
                _offset: usize,
            ) -> Result<DecodeStep> {
                let n_vocab = TIMESTAMP_BEGIN as usize + 10;
                let mut row = vec![0f32; n_vocab];
                row[EOT as usize] = 10.0;
                Ok(DecodeStep {
                    logits: Logits::new(row, n_vocab)?,
                    cache,
                })
            }
        }

        let outcome = generate(&mut NarrowEngine, &cross(), 50259).unwrap();
        let first = outcome.tokens[SEED_LEN];
        assert!(first >= TIMESTAMP_BEGIN);
        assert!(first < TIMESTAMP_BEGIN + 10);
    }

    #[test]
    fn generation_respects_context_and_step_bounds() {
        let mut engine = ScriptedEngine::new(vec![TIMESTAMP_BEGIN + 60]);
        let outcome = generate(&mut engine, &cross(), 50259).unwrap();

        assert!(outcome.tokens.len() <= N_TEXT_CTX + 1);
        assert!(outcome.tokens.len() <= SEED_LEN + MAX_DECODE_STEPS);
    }

    #[test]
    fn forced_completion_after_eot() {
        let mut engine = ScriptedEngine::new(vec![TIMESTAMP_BEGIN, EOT, 100]);
        let outcome = generate(&mut engine, &cross(), 50259).unwrap();

        // once EOT lands, the loop pins the next token to EOT and stops
        let last_two = &outcome.tokens[outcome.tokens.len() - 2..];
        assert_eq!(last_two, &[EOT, EOT]);
    }

    #[test]
    fn sum_logprob_accumulates_until_eot() {
        let mut engine = ScriptedEngine::new(vec![TIMESTAMP_BEGIN, EOT]);
        let outcome = generate(&mut engine, &cross(), 50259).unwrap();
        assert!(outcome.sum_logprob < 0.0);
        assert!(outcome.sum_logprob.is_finite());
    }

    #[test]
    fn trim_bounds() {
        let tokens = [SOT, 50259, TRANSCRIBE, 51000, 100, EOT, EOT];
        assert_eq!(trim(&tokens), &[51000, 100]);
        assert_eq!(trim(&[SOT, 50259, TRANSCRIBE, EOT]), &[] as &[i64]);
        // no EOT produced: everything after the seed survives
        assert_eq!(trim(&[SOT, 50259, TRANSCRIBE, 51000]), &[51000]);
    }
}
