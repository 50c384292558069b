//! Configuration for the audio engine.
//!
//! Provides `AppConfig` (top-level settings), one sub-config per engine
//! component, `AppPaths` for cross-platform directories, and TOML
//! persistence via `AppConfig::load` / `AppConfig::save`.

pub mod paths;
pub mod settings;

pub use paths::AppPaths;
pub use settings::{
    AppConfig, AssetsConfig, AudioConfig, ConnectionClass, CueConfig, NetworkHint,
    PrefetchConfig, VoiceConfig, VolumePrefs, clamp_level,
};
