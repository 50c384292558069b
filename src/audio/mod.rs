//! Audio platform layer: mixing, output, fetching, decoding, synthesis.
//!
//! # Signal path
//!
//! ```text
//! SourceFetcher ─▶ decode (symphonia) ─▶ resample ─▶ DecodedBuffer
//!                                                        │
//!                              Tone ─────────────────────┤
//!                                                        ▼
//!                           MixGraph (buses, ramps) ─▶ OutputDevice (cpal)
//!
//! SourceFetcher ─▶ StreamDecoder ─▶ MediaElement (own cpal stream)
//! ```
//!
//! The engine drives the graph path; the element path is the fallback when
//! the graph cannot play a source.
//!
//! # Quick Start
//!
//! ```rust
//! use std::time::Duration;
//! use tale_audio::audio::{Bus, MixGraph, OfflineDevice, OutputDevice, Tone};
//!
//! let mixer = MixGraph::shared(48_000);
//! let device = OfflineDevice::new();
//! device.open(48_000, mixer.clone()).unwrap();
//!
//! mixer.lock().unwrap().start_tone(Tone::DIAGNOSTIC, Bus::Sfx);
//! let frames = device.render(4_800);
//! assert!(frames.iter().any(|s| s.abs() > 0.0));
//! ```

pub mod decode;
pub mod device;
pub mod element;
pub mod error;
pub mod fetch;
pub mod mixer;
pub mod playback;
pub mod resample;
pub mod tone;

pub use decode::{decode_bytes, DecodedBuffer, SharedBuffer, StreamDecoder};
pub use device::{ContextState, CpalDevice, OfflineDevice, OutputDevice};
pub use element::{ElementHandle, ElementOptions, ElementPlayback, MediaElement, StreamingElement};
pub use error::AudioError;
pub use fetch::{HttpFetcher, SourceFetcher};
pub use mixer::{Bus, GainParam, MixGraph, SharedMixer, SourceId, Started};
pub use playback::{Playback, Stopper};
pub use resample::{resample_stereo, to_stereo};
pub use tone::{Tone, Waveform};

#[cfg(test)]
pub use element::MockElement;
#[cfg(test)]
pub use fetch::MockFetcher;
