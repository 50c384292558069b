//! Adaptive audio for immersive reading.
//!
//! Chapters carry declarative triggers (background cues, sound effects,
//! voiced dialogue).  As the reader turns pages the engine crossfades music,
//! fires one-shots and plays tapped voice lines over ducked music, falling
//! back to simpler playback paths whenever decoding or the output refuses.
//!
//! * [`audio`]: mixing graph, output devices, fetch/decode, streaming element.
//! * [`chapter`]: chapter and page models.
//! * [`config`]: persisted settings.
//! * [`engine`]: cue engine, voice player, scheduler, prefetcher, session.

pub mod audio;
pub mod chapter;
pub mod config;
pub mod engine;
