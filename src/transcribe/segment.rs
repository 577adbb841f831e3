use anyhow::Result;
use rubato::{Resampler, SincFixedOut, SincInterpolationParameters};

use super::{N_SAMPLES, SAMPLE_RATE};

/// Peak squared amplitude below which a filled region counts as silence.
const LOUDNESS_THRESHOLD: f32 = 0.001;

/// Half-width of the energy window used by the silence-point search.
const SEARCH_HALF_WINDOW: usize = 50;

/// One 30-second chunk of 16 kHz mono audio. `samples` is always exactly
/// N_SAMPLES long, zero-padded past `len`, the true content boundary.
pub struct Segment {
    pub samples: Vec<f32>,
    pub len: usize,
}

/// Turns an arbitrary-rate/channel sample stream into fixed-length segments,
/// carrying unconsumed tail audio over to the next call.
pub struct Segmenter {
    carryover: Vec<f32>,
    pending: Vec<f32>,
    resampler: Option<StreamResampler>,
}

impl Segmenter {
    pub fn new() -> Self {
        Self {
            carryover: Vec::new(),
            pending: Vec::new(),
            resampler: None,
        }
    }

    /// Feed newly captured interleaved samples and try to cut a segment.
    /// Returns None when the filled region is empty or below the loudness
    /// threshold; the carryover is consumed either way.
    pub fn segment(
        &mut self,
        samples: &[f32],
        sample_rate: u32,
        channels: usize,
    ) -> Result<Option<Segment>> {
        self.ingest(samples, sample_rate, channels)?;

        let mut buffer = vec![0f32; N_SAMPLES];

        let carry_len = self.carryover.len().min(N_SAMPLES);
        buffer[..carry_len].copy_from_slice(&self.carryover[..carry_len]);
        self.carryover.clear();

        let take = self.pending.len().min(N_SAMPLES - carry_len);
        buffer[carry_len..carry_len + take].copy_from_slice(&self.pending[..take]);
        shift(&mut self.pending, take);

        let len = carry_len + take;
        if len == 0 {
            return Ok(None);
        }

        let peak = buffer[..len].iter().map(|x| x * x).fold(0f32, f32::max);
        if peak < LOUDNESS_THRESHOLD {
            return Ok(None);
        }

        // cut at the quietest point in the last fifth of the filled region;
        // everything after the cut becomes the next call's carryover
        let mut len2 = len;
        let start = len * 4 / 5;
        if len - start >= 100 {
            let mut min_vol = f32::MAX;
            let mut min_index = start;
            for i in start..len - SEARCH_HALF_WINDOW {
                let window = &buffer[i - SEARCH_HALF_WINDOW..i + SEARCH_HALF_WINDOW];
                let vol = window.iter().map(|x| x * x).sum::<f32>() / window.len() as f32;
                if vol < min_vol {
                    min_vol = vol;
                    min_index = i;
                }
            }
            len2 = min_index + SEARCH_HALF_WINDOW;
            self.carryover.extend_from_slice(&buffer[len2..len]);
        }

        Ok(Some(Segment {
            samples: buffer,
            len: len2,
        }))
    }

    pub fn clear(&mut self) {
        self.carryover.clear();
        self.pending.clear();
        self.resampler = None;
    }

    fn ingest(&mut self, samples: &[f32], sample_rate: u32, channels: usize) -> Result<()> {
        if samples.is_empty() {
            return Ok(());
        }

        if sample_rate == SAMPLE_RATE && channels == 1 {
            self.pending.extend_from_slice(samples);
            return Ok(());
        }

        let mono: Vec<f32> = if channels > 1 {
            samples
                .chunks(channels)
                .map(|frame| frame.iter().sum::<f32>() / channels as f32)
                .collect()
        } else {
            samples.to_vec()
        };

        if sample_rate == SAMPLE_RATE {
            self.pending.extend_from_slice(&mono);
            return Ok(());
        }

        let resampler = match &mut self.resampler {
            Some(r) if r.rate_in == sample_rate => r,
            _ => {
                // source rate changed; restart resampling from scratch
                self.resampler = Some(StreamResampler::new(sample_rate)?);
                self.resampler.as_mut().unwrap()
            }
        };
        resampler.push(&mono, &mut self.pending)
    }
}

impl Default for Segmenter {
    fn default() -> Self {
        Self::new()
    }
}

struct StreamResampler {
    rate_in: u32,
    inner: SincFixedOut<f32>,
    buffer: Vec<f32>,
}

impl StreamResampler {
    fn new(rate_in: u32) -> Result<Self> {
        let params = SincInterpolationParameters {
            sinc_len: 256,
            f_cutoff: 0.95,
            oversampling_factor: 256,
            interpolation: rubato::SincInterpolationType::Linear,
            window: rubato::WindowFunction::BlackmanHarris2,
        };

        let inner = SincFixedOut::<f32>::new(
            SAMPLE_RATE as f64 / rate_in as f64,
            8.0,
            params,
            1024,
            1,
        )
        .map_err(anyhow::Error::msg)?;

        Ok(Self {
            rate_in,
            inner,
            buffer: Vec::new(),
        })
    }

    /// Resample as much buffered input as possible, appending to `out`.
    /// Input that cannot fill a whole chunk stays buffered.
    fn push(&mut self, samples: &[f32], out: &mut Vec<f32>) -> Result<()> {
        self.buffer.extend_from_slice(samples);

        let mut i_in = 0;
        loop {
            let in_min = self.inner.input_frames_next();
            if self.buffer.len() - i_in < in_min {
                break;
            }

            let out_max = self.inner.output_frames_max();
            let i_out = out.len();
            out.resize(i_out + out_max, 0.0);

            let src = &self.buffer[i_in..];
            let dst = &mut out[i_out..i_out + out_max];
            let (n_in, n_out) = self.inner.process_into_buffer(&[src], &mut [dst], None)?;

            i_in += n_in;
            out.truncate(i_out + n_out);
        }

        shift(&mut self.buffer, i_in);
        Ok(())
    }
}

fn shift(v: &mut Vec<f32>, n: usize) {
    let remain = v.len() - n;
    v.copy_within(n.., 0);
    v.truncate(remain);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn segments_are_always_full_capacity() {
        let mut segmenter = Segmenter::new();
        for len in [400usize, 4_800, 100_000, N_SAMPLES] {
            let samples = vec![0.5f32; len];
            let segment = segmenter.segment(&samples, SAMPLE_RATE, 1).unwrap();
            let segment = segment.expect("loud input must produce a segment");
            assert_eq!(segment.samples.len(), N_SAMPLES);
            assert!(segment.len <= N_SAMPLES);
            segmenter.clear();
        }
    }

    #[test]
    fn silence_produces_no_segment() {
        let mut segmenter = Segmenter::new();
        assert!(segmenter.segment(&[], SAMPLE_RATE, 1).unwrap().is_none());

        let quiet = vec![0.01f32; 48_000];
        assert!(segmenter.segment(&quiet, SAMPLE_RATE, 1).unwrap().is_none());
    }

    #[test]
    fn zero_padding_past_content() {
        let mut segmenter = Segmenter::new();
        let samples = vec![0.5f32; 400];
        let segment = segmenter.segment(&samples, SAMPLE_RATE, 1).unwrap().unwrap();
        assert_eq!(segment.len, 400);
        assert!(segment.samples[400..].iter().all(|&v| v == 0.0));
    }

    #[test]
    fn short_fill_skips_silence_search() {
        let mut segmenter = Segmenter::new();
        // last fifth is 80 samples, below the 100-sample search minimum
        let samples = vec![0.5f32; 400];
        let segment = segmenter.segment(&samples, SAMPLE_RATE, 1).unwrap().unwrap();
        assert_eq!(segment.len, 400);

        // nothing was carried over
        let again = segmenter.segment(&samples, SAMPLE_RATE, 1).unwrap().unwrap();
        assert_eq!(again.len, 400);
        assert_eq!(again.samples[..400], vec![0.5f32; 400][..]);
    }

    #[test]
    fn carryover_reappears_in_next_segment() {
        let mut segmenter = Segmenter::new();

        // loud chunk with a quiet dip inside the tail fifth
        let mut first = vec![0.5f32; N_SAMPLES];
        for v in &mut first[400_000..400_100] {
            *v = 0.01;
        }
        let segment = segmenter.segment(&first, SAMPLE_RATE, 1).unwrap().unwrap();
        assert!(segment.len < N_SAMPLES, "cut point expected in tail fifth");
        let cut = segment.len;
        assert!((399_950..=400_150).contains(&cut), "cut {cut} not at the dip");

        // the audio after the cut must prefix the next segment
        let carry_len = N_SAMPLES - cut;
        let second = segmenter
            .segment(&vec![0.9f32; 48_000], SAMPLE_RATE, 1)
            .unwrap()
            .unwrap();
        assert_eq!(second.samples[..100], first[cut..cut + 100]);
        assert_eq!(second.samples[carry_len], 0.9);
    }

    #[test]
    fn carryover_flushes_without_new_input() {
        let mut segmenter = Segmenter::new();

        let mut first = vec![0.5f32; N_SAMPLES];
        for v in &mut first[400_000..400_100] {
            *v = 0.01;
        }
        let cut = segmenter
            .segment(&first, SAMPLE_RATE, 1)
            .unwrap()
            .unwrap()
            .len;
        assert!(cut < N_SAMPLES);

        // an empty tick still delivers the carried-over tail
        let flushed = segmenter.segment(&[], SAMPLE_RATE, 1).unwrap().unwrap();
        assert_eq!(flushed.samples[..100], first[cut..cut + 100]);
        assert!(flushed.len <= N_SAMPLES - cut);
    }

    #[test]
    fn downmix_and_resample_to_16k_mono() {
        let mut segmenter = Segmenter::new();
        // one second of loud stereo audio at 48 kHz
        let samples = vec![0.5f32; 48_000 * 2];
        let segment = segmenter.segment(&samples, 48_000, 2).unwrap().unwrap();
        assert!(segment.len > 0);
        assert!(segment.len <= 16_000);
        assert_eq!(segment.samples.len(), N_SAMPLES);
    }
}
