use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::Result;
use tracing::{error, info, warn};

use crate::audio::{CaptureSource, SampleRing, SourceFormat};
use crate::config::Config;
use crate::engine::InferenceEngine;
use crate::transcribe::{Transcriber, Transcription};

const STOP_TIMEOUT: Duration = Duration::from_secs(1);

enum Message {
    Quit,
    Clear,
    Source(Option<String>),
}

/// Owns the worker thread that moves audio from the capture ring through the
/// transcriber and into `sink`, one decode cycle per tick.
pub struct Pipeline {
    sender: Sender<Message>,
    handle: Option<JoinHandle<Result<()>>>,
}

impl Pipeline {
    pub fn spawn<E>(
        transcriber: Transcriber<E>,
        config: Config,
        sink: crossbeam_channel::Sender<Transcription>,
    ) -> Self
    where
        E: InferenceEngine + Send + 'static,
    {
        let (sender, receiver) = mpsc::channel();

        let handle = std::thread::spawn(move || {
            let mut worker = Worker {
                transcriber,
                ring: SampleRing::new(config.ring_capacity),
                capture: None,
                last_format: None,
                sink,
            };
            worker.set_source(config.device.as_deref());

            loop {
                match receiver.recv_timeout(config.interval) {
                    Ok(Message::Quit) | Err(RecvTimeoutError::Disconnected) => break,
                    Ok(Message::Clear) => worker.clear(),
                    Ok(Message::Source(name)) => worker.switch_source(name.as_deref()),
                    Err(RecvTimeoutError::Timeout) => {
                        if !worker.cycle() {
                            break;
                        }
                    }
                }
            }

            if let Some(capture) = worker.capture.take() {
                capture.stop(STOP_TIMEOUT);
            }
            Ok(())
        });

        Self {
            sender,
            handle: Some(handle),
        }
    }

    /// Switch to another input device. `None` selects the default device.
    pub fn set_source(&self, device: Option<String>) {
        _ = self.sender.send(Message::Source(device));
    }

    /// Drop buffered audio and decoder state.
    pub fn clear(&self) {
        _ = self.sender.send(Message::Clear);
    }

    pub fn shutdown(&mut self) {
        if let Some(handle) = self.handle.take() {
            _ = self.sender.send(Message::Quit);
            match handle.join() {
                Ok(Ok(())) => info!("pipeline stopped"),
                Ok(Err(e)) => error!("pipeline worker failed: {e:#}"),
                Err(_) => error!("pipeline worker panicked"),
            }
        }
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        self.shutdown();
    }
}

struct Worker<E: InferenceEngine> {
    transcriber: Transcriber<E>,
    ring: SampleRing,
    capture: Option<CaptureSource>,
    last_format: Option<SourceFormat>,
    sink: crossbeam_channel::Sender<Transcription>,
}

impl<E: InferenceEngine> Worker<E> {
    /// Run one decode cycle. Returns false once the sink is gone.
    fn cycle(&mut self) -> bool {
        let (samples, format) = match self.ring.drain() {
            Some((samples, format)) => {
                self.last_format = Some(format);
                (samples, format)
            }
            // nothing captured this tick; still run so carryover left by
            // the previous cut gets decoded
            None => match self.last_format {
                Some(format) => (Vec::new(), format),
                None => return true,
            },
        };

        match self
            .transcriber
            .decode(&samples, format.sample_rate, format.channels)
        {
            Ok(Some(transcription)) => self.sink.send(transcription).is_ok(),
            Ok(None) => true,
            Err(e) => {
                error!("decode cycle failed: {e:#}");
                true
            }
        }
    }

    fn clear(&mut self) {
        self.ring.clear();
        self.transcriber.clear();
    }

    fn switch_source(&mut self, device: Option<&str>) {
        if let Some(capture) = self.capture.take() {
            capture.stop(STOP_TIMEOUT);
        }
        self.clear();
        self.set_source(device);
    }

    // A missing device is not fatal; the ring simply stays empty until a
    // working source is selected.
    fn set_source(&mut self, device: Option<&str>) {
        match CaptureSource::start(device, self.ring.clone()) {
            Ok(capture) => self.capture = Some(capture),
            Err(e) => warn!("failed to start capture: {e:#}"),
        }
    }
}
