pub mod audio;
pub mod device;
pub mod espeak;
pub mod microphone;
pub mod vad;

pub use espeak::EspeakSpeech;
pub use microphone::CpalMicrophone;
pub use vad::{VadRecognitionEngine, VadSettings};
