//! Error type shared by the audio layer.

use thiserror::Error;

/// Everything that can go wrong between a source locator and the speakers.
///
/// None of these are fatal to reading: the engine logs them and falls back
/// (or stays silent).
#[derive(Debug, Clone, Error, PartialEq)]
pub enum AudioError {
    /// The platform refused to open or resume output (no user gesture yet).
    #[error("audio output not permitted yet: {0}")]
    Policy(String),

    /// The output device could not be opened or failed while running.
    #[error("audio device error: {0}")]
    Device(String),

    /// A graph operation was attempted before the output context is running.
    #[error("audio graph not started")]
    NotStarted,

    /// The source bytes could not be loaded.
    #[error("failed to fetch `{src}`: {reason}")]
    Fetch { src: String, reason: String },

    /// The source bytes are not decodable audio.
    #[error("failed to decode `{src}`: {reason}")]
    Decode { src: String, reason: String },

    /// The streaming element path failed.
    #[error("streaming playback failed: {0}")]
    Element(String),

    /// A gain or source node id no longer exists in the graph.
    #[error("unknown graph node {0}")]
    UnknownNode(u64),
}
