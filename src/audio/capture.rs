use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::SampleFormat;
use crossbeam_channel::{bounded, Receiver};
use tracing::{error, info, warn};

use super::ring::{SampleRing, SourceFormat};

/// A running input stream feeding a [`SampleRing`].
pub struct CaptureSource {
    stream: cpal::Stream,
    running: Arc<AtomicBool>,
    stopped: Receiver<()>,
}

impl CaptureSource {
    /// Open the input device whose name contains `device_name` (or the
    /// default input device) and start writing its samples into `ring`.
    pub fn start(device_name: Option<&str>, ring: SampleRing) -> Result<Self> {
        let host = cpal::default_host();
        let device = match device_name {
            Some(name) => find_device(&host, name)?,
            None => host
                .default_input_device()
                .context("no default input device")?,
        };
        let label = device.name().unwrap_or_else(|_| "unknown".to_owned());

        let supported = device
            .default_input_config()
            .with_context(|| format!("no default input config for {label}"))?;
        if supported.sample_format() != SampleFormat::F32 {
            bail!(
                "unsupported sample format {} on {label}",
                supported.sample_format()
            );
        }

        let format = SourceFormat {
            sample_rate: supported.sample_rate().0,
            channels: supported.channels() as usize,
        };

        let running = Arc::new(AtomicBool::new(true));
        let (stopped_tx, stopped) = bounded(1);

        let stream = {
            let running = running.clone();
            let mut acked = false;
            device.build_input_stream(
                &supported.config(),
                move |data: &[f32], _: &cpal::InputCallbackInfo| {
                    if !running.load(Ordering::Relaxed) {
                        if !acked {
                            acked = true;
                            _ = stopped_tx.try_send(());
                        }
                        return;
                    }
                    ring.write(data, format);
                },
                |err| error!("input stream error: {err}"),
                None,
            )?
        };
        stream.play()?;

        info!(
            device = label,
            sample_rate = format.sample_rate,
            channels = format.channels,
            "capture started"
        );

        Ok(Self {
            stream,
            running,
            stopped,
        })
    }

    /// Signal the callback to stop and wait for its acknowledgement, so no
    /// write can race the teardown. Waits at most `timeout`.
    pub fn stop(self, timeout: Duration) {
        self.running.store(false, Ordering::Relaxed);
        if self.stopped.recv_timeout(timeout).is_err() {
            warn!("capture stream did not acknowledge stop in time");
        }
        drop(self.stream);
        info!("capture stopped");
    }
}

fn find_device(host: &cpal::Host, name: &str) -> Result<cpal::Device> {
    let devices = host
        .input_devices()
        .context("failed to enumerate input devices")?;
    for device in devices {
        if device.name().is_ok_and(|n| n.contains(name)) {
            return Ok(device);
        }
    }
    bail!("input device matching {name:?} not found")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_device_name_is_an_error() {
        let ring = SampleRing::new(16);
        assert!(CaptureSource::start(Some("no-such-device-498213"), ring).is_err());
    }
}
