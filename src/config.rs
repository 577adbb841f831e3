use std::{path::Path, str::FromStr, time::Duration};

use ini::{Ini, SectionSetter};

pub const CONFIG_FILE: &str = "rtscribe.ini";

pub const INTERVAL_DEFAULT: Duration = Duration::from_millis(3000);

/// 30 s of stereo audio at 48 kHz; plenty for one tick at any common rate.
pub const RING_CAPACITY_DEFAULT: usize = 30 * 48_000 * 2;

#[derive(Clone, Debug)]
pub struct Config {
    /// Path to the byte-level subword vocabulary (vocab.json).
    pub vocab: String,
    /// Path to the 201x80 little-endian f32 mel filter blob.
    pub mel_filters: String,
    /// Interval between decode ticks.
    pub interval: Duration,
    /// Input device name substring; None selects the default device.
    pub device: Option<String>,
    /// Capture ring capacity in samples.
    pub ring_capacity: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            vocab: "vocab.json".to_owned(),
            mel_filters: "mel_filters.bin".to_owned(),
            interval: INTERVAL_DEFAULT,
            device: None,
            ring_capacity: RING_CAPACITY_DEFAULT,
        }
    }
}

impl Config {
    pub fn load() -> Self {
        Self::load_from(CONFIG_FILE)
    }

    pub fn load_from(path: impl AsRef<Path>) -> Self {
        let conf = Ini::load_from_file(path).unwrap_or_default();
        let device = conf.get_str("device", "");

        Self {
            vocab: conf.get_str("vocab", "vocab.json"),
            mel_filters: conf.get_str("mel-filters", "mel_filters.bin"),
            interval: Duration::from_millis(
                conf.get_u32("interval-ms", INTERVAL_DEFAULT.as_millis() as _) as _,
            ),
            device: (!device.is_empty()).then_some(device),
            ring_capacity: conf.get_u32("ring-capacity", RING_CAPACITY_DEFAULT as _) as _,
        }
    }

    pub fn save(&self) {
        self.save_to(CONFIG_FILE);
    }

    pub fn save_to(&self, path: impl AsRef<Path>) {
        let mut conf = Ini::new();
        conf.with_general_section()
            .set("vocab", &self.vocab)
            .set("mel-filters", &self.mel_filters)
            .set_u32("interval-ms", self.interval.as_millis() as _)
            .set("device", self.device.as_deref().unwrap_or(""))
            .set_u32("ring-capacity", self.ring_capacity as _);

        _ = conf.write_to_file(path);
    }
}

trait IniSetter<'a> {
    fn set_u32(&'a mut self, key: &str, value: u32) -> &'a mut SectionSetter<'a>;
}

impl<'a> IniSetter<'a> for SectionSetter<'a> {
    fn set_u32(&'a mut self, key: &str, value: u32) -> &'a mut SectionSetter<'a> {
        self.set(key, value.to_string())
    }
}

trait IniGetter {
    fn get_u32(&self, key: &str, default: u32) -> u32;
    fn get_str(&self, key: &str, default: &str) -> String;
}

impl IniGetter for Ini {
    fn get_u32(&self, key: &str, default: u32) -> u32 {
        u32::from_str(self.general_section().get(key).unwrap_or_default()).unwrap_or(default)
    }

    fn get_str(&self, key: &str, default: &str) -> String {
        self.general_section()
            .get(key)
            .unwrap_or(default)
            .to_string()
    }
}
