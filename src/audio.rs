pub mod capture;
pub mod ring;

pub use capture::CaptureSource;
pub use ring::{SampleRing, SourceFormat};
