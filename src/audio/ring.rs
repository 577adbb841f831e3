use std::sync::Arc;

use parking_lot::Mutex;
use tracing::warn;

/// Native format of the samples a producer writes into the ring.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SourceFormat {
    pub sample_rate: u32,
    pub channels: usize,
}

/// Bounded ring of interleaved samples shared between the capture callback
/// and the decode worker. Writes never block; on overflow the oldest data is
/// discarded.
#[derive(Clone)]
pub struct SampleRing {
    inner: Arc<Mutex<Inner>>,
}

struct Inner {
    data: Vec<f32>,
    write_pos: usize,
    read_pos: usize,
    len: usize,
    format: Option<SourceFormat>,
}

impl SampleRing {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                data: vec![0.0; capacity],
                write_pos: 0,
                read_pos: 0,
                len: 0,
                format: None,
            })),
        }
    }

    /// Append samples from the producer. A format change discards whatever
    /// is buffered; samples at mixed rates cannot be decoded together.
    pub fn write(&self, samples: &[f32], format: SourceFormat) {
        let mut ring = self.inner.lock();

        if ring.format != Some(format) {
            ring.reset();
            ring.format = Some(format);
        }

        let capacity = ring.data.len();
        let mut dropped = 0usize;
        for &sample in samples {
            let write_pos = ring.write_pos;
            ring.data[write_pos] = sample;
            ring.write_pos = (write_pos + 1) % capacity;

            if ring.len < capacity {
                ring.len += 1;
            } else {
                ring.read_pos = (ring.read_pos + 1) % capacity;
                dropped += 1;
            }
        }

        if dropped > 0 {
            warn!(dropped, "capture ring overflow, oldest samples discarded");
        }
    }

    /// Take everything currently buffered, oldest first.
    pub fn drain(&self) -> Option<(Vec<f32>, SourceFormat)> {
        let mut ring = self.inner.lock();
        let format = ring.format?;
        if ring.len == 0 {
            return None;
        }

        let capacity = ring.data.len();
        let mut samples = Vec::with_capacity(ring.len);
        let mut pos = ring.read_pos;
        for _ in 0..ring.len {
            samples.push(ring.data[pos]);
            pos = (pos + 1) % capacity;
        }

        ring.read_pos = ring.write_pos;
        ring.len = 0;

        Some((samples, format))
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.inner.lock().reset();
    }
}

impl Inner {
    fn reset(&mut self) {
        self.write_pos = 0;
        self.read_pos = 0;
        self.len = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FORMAT: SourceFormat = SourceFormat {
        sample_rate: 48_000,
        channels: 2,
    };

    #[test]
    fn write_then_drain() {
        let ring = SampleRing::new(16);
        ring.write(&[1.0, 2.0, 3.0], FORMAT);
        assert_eq!(ring.len(), 3);

        let (samples, format) = ring.drain().unwrap();
        assert_eq!(samples, vec![1.0, 2.0, 3.0]);
        assert_eq!(format, FORMAT);
        assert!(ring.drain().is_none());
    }

    #[test]
    fn overflow_discards_oldest() {
        let ring = SampleRing::new(10);
        ring.write(&[1.0, 2.0, 3.0, 4.0, 5.0], FORMAT);
        ring.write(&[6.0, 7.0, 8.0, 9.0, 10.0], FORMAT);
        ring.write(&[11.0, 12.0], FORMAT);

        assert_eq!(ring.len(), 10);
        let (samples, _) = ring.drain().unwrap();
        assert_eq!(
            samples,
            vec![3.0, 4.0, 5.0, 6.0, 7.0, 8.0, 9.0, 10.0, 11.0, 12.0]
        );
    }

    #[test]
    fn format_change_discards_buffered_audio() {
        let ring = SampleRing::new(16);
        ring.write(&[1.0, 2.0], FORMAT);

        let mono = SourceFormat {
            sample_rate: 16_000,
            channels: 1,
        };
        ring.write(&[3.0], mono);

        let (samples, format) = ring.drain().unwrap();
        assert_eq!(samples, vec![3.0]);
        assert_eq!(format, mono);
    }

    #[test]
    fn handles_are_shared() {
        let ring = SampleRing::new(8);
        let writer = ring.clone();
        writer.write(&[1.0], FORMAT);
        assert_eq!(ring.len(), 1);
    }
}
