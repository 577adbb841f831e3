use std::f32::consts::PI;
use std::path::Path;
use std::sync::{Arc, OnceLock};

use anyhow::{ensure, Context, Result};
use byteorder::ByteOrder;
use rustfft::{num_complex::Complex32 as Complex, Fft, FftPlanner};

use super::{N_FFT, N_FRAMES, N_HOP, N_MELS, N_SAMPLES};

pub const N_FILTER: usize = N_FFT / 2 + 1;

const LOG_FLOOR: f32 = -10.0; // log10 of the 1e-10 power floor

static FILTERS: OnceLock<Vec<f32>> = OnceLock::new();

/// Install the mel filter matrix from a blob of N_MELS x N_FILTER
/// little-endian f32 values, laid out filter-major. Idempotent; the first
/// initialization wins.
pub fn init_filters(bytes: &[u8]) -> Result<()> {
    ensure!(
        bytes.len() == N_MELS * N_FILTER * 4,
        "mel filter blob is {} bytes, expected {}",
        bytes.len(),
        N_MELS * N_FILTER * 4
    );

    let mut filters = vec![0f32; N_MELS * N_FILTER];
    byteorder::LittleEndian::read_f32_into(bytes, &mut filters);
    _ = FILTERS.set(filters);
    Ok(())
}

pub fn init_filters_from_file(path: impl AsRef<Path>) -> Result<()> {
    let path = path.as_ref();
    let bytes = std::fs::read(path)
        .with_context(|| format!("failed to read mel filters {}", path.display()))?;
    init_filters(&bytes)
}

/// Turns one audio segment into a fixed N_MELS x N_FRAMES log-mel matrix.
pub struct FeatureExtractor {
    window: Vec<f32>,
    fft: Arc<dyn Fft<f32>>,
    fft_io: Vec<Complex>,
    fft_scratch: Vec<Complex>,
    magnitude: Vec<f32>,
    filter: &'static [f32],
}

impl FeatureExtractor {
    pub fn new() -> Result<Self> {
        let filter = FILTERS.get().context("mel filters not initialized")?;

        let window = (0..N_FFT)
            .map(|i| 0.5 * (1. - ((2.0 * PI * i as f32) / (N_FFT - 1) as f32).cos()))
            .collect();

        let fft = FftPlanner::new().plan_fft_forward(N_FFT);
        let n_scratch = fft.get_inplace_scratch_len();

        Ok(Self {
            window,
            fft,
            fft_io: vec![Complex::default(); N_FFT],
            fft_scratch: vec![Complex::default(); n_scratch],
            magnitude: vec![0f32; N_FILTER],
            filter,
        })
    }

    /// Compute the log-mel spectrogram of `samples[..len]`, laid out
    /// [mel bin][frame]. The output is always N_MELS x N_FRAMES; frames past
    /// `len` carry the floor value and participate in normalization.
    pub fn extract(&mut self, samples: &[f32], len: usize) -> Vec<f32> {
        assert_eq!(samples.len(), N_SAMPLES);
        let len = len.min(N_SAMPLES);

        let mut mel = vec![LOG_FLOOR; N_MELS * N_FRAMES];
        let n_frames = len.div_ceil(N_HOP).min(N_FRAMES);

        let mut mmax = LOG_FLOOR;
        for i in 0..n_frames {
            let center = N_HOP * i;
            for j in 0..N_FFT {
                // frame centered on the hop index, reflected at both ends
                let mut p = center as isize + j as isize - (N_FFT / 2) as isize;
                if p < 0 {
                    p = -p;
                } else if p >= N_SAMPLES as isize {
                    p = 2 * N_SAMPLES as isize - p - 1;
                }
                self.fft_io[j].re = self.window[j] * samples[p as usize];
                self.fft_io[j].im = 0.;
            }

            self.fft
                .process_with_scratch(&mut self.fft_io, &mut self.fft_scratch);

            for j in 0..N_FILTER {
                self.magnitude[j] = self.fft_io[j].norm_sqr();
            }

            for j in 0..N_MELS {
                let mut sum = 0.;
                for k in 0..N_FILTER {
                    sum += self.filter[j * N_FILTER + k] * self.magnitude[k];
                }

                let m = sum.max(1e-10).log10();
                mel[j * N_FRAMES + i] = m;
                mmax = mmax.max(m);
            }
        }

        mmax -= 8.0;
        for m in &mut mel {
            let v = m.max(mmax);
            *m = (v + 4.0) / 4.0;
        }

        mel
    }
}

#[cfg(test)]
pub(crate) fn init_test_filters() {
    // sparse synthetic bank; the exact values are irrelevant to the shape
    // and normalization properties under test
    let mut filters = vec![0f32; N_MELS * N_FILTER];
    for (j, row) in filters.chunks_mut(N_FILTER).enumerate() {
        for (k, v) in row.iter_mut().enumerate() {
            if k % N_MELS == j {
                *v = 1.0 / N_FILTER as f32;
            }
        }
    }
    let mut bytes = vec![0u8; filters.len() * 4];
    byteorder::LittleEndian::write_f32_into(&filters, &mut bytes);
    init_filters(&bytes).unwrap();
}
