//! Engine settings, defaults and TOML persistence.
//!
//! All structs implement `Serialize`, `Deserialize`, `Default` and `Clone`
//! so they can be round-tripped through TOML files and shared across tasks.
//! Every section is `#[serde(default)]`: a settings file only needs the keys
//! it wants to change.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use super::AppPaths;

// ---------------------------------------------------------------------------
// AudioConfig
// ---------------------------------------------------------------------------

/// Output context settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AudioConfig {
    /// Requested graph sample rate in Hz.  The device may run at another
    /// rate; decoded buffers follow whatever it reports.
    pub sample_rate: u32,
    /// Open the output suspended and only resume on the first user gesture.
    pub require_gesture: bool,
    /// Ramp length applied to bus volume changes.
    pub volume_ramp_ms: u64,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate: 48_000,
            require_gesture: true,
            volume_ramp_ms: 30,
        }
    }
}

impl AudioConfig {
    pub fn volume_ramp(&self) -> Duration {
        Duration::from_millis(self.volume_ramp_ms)
    }
}

// ---------------------------------------------------------------------------
// CueConfig
// ---------------------------------------------------------------------------

/// Background-music crossfade timing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CueConfig {
    /// Crossfade length.
    pub fade_ms: u64,
    /// Extra time after a fade before the outgoing source is stopped.
    pub stop_guard_ms: u64,
}

impl Default for CueConfig {
    fn default() -> Self {
        Self {
            fade_ms: 1_200,
            stop_guard_ms: 20,
        }
    }
}

impl CueConfig {
    pub fn fade(&self) -> Duration {
        Duration::from_millis(self.fade_ms)
    }

    pub fn stop_guard(&self) -> Duration {
        Duration::from_millis(self.stop_guard_ms)
    }
}

// ---------------------------------------------------------------------------
// VoiceConfig
// ---------------------------------------------------------------------------

/// Voice-line ducking.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VoiceConfig {
    /// Music multiplier while a line plays, `(0.0, 1.0]`.
    pub duck_level: f32,
    /// How fast music drops when a line starts.
    pub attack_ms: u64,
    /// How fast music comes back after a line ends.
    pub release_ms: u64,
}

impl Default for VoiceConfig {
    fn default() -> Self {
        Self {
            duck_level: 0.5,
            attack_ms: 120,
            release_ms: 480,
        }
    }
}

impl VoiceConfig {
    pub fn attack(&self) -> Duration {
        Duration::from_millis(self.attack_ms)
    }

    pub fn release(&self) -> Duration {
        Duration::from_millis(self.release_ms)
    }
}

// ---------------------------------------------------------------------------
// PrefetchConfig
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PrefetchConfig {
    pub enabled: bool,
    /// Distinct sources warmed per page change.
    pub max_per_pass: usize,
    /// Cap used instead when the network is constrained.
    pub constrained_max_per_pass: usize,
}

impl Default for PrefetchConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_per_pass: 6,
            constrained_max_per_pass: 2,
        }
    }
}

// ---------------------------------------------------------------------------
// NetworkHint
// ---------------------------------------------------------------------------

/// Effective connection class, as reported by the host platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum ConnectionClass {
    #[serde(rename = "slow-2g")]
    Slow2g,
    #[serde(rename = "2g")]
    TwoG,
    #[serde(rename = "3g")]
    ThreeG,
    #[serde(rename = "4g")]
    FourG,
    #[default]
    #[serde(rename = "unknown")]
    Unknown,
}

/// What the host knows about the network.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct NetworkHint {
    /// Reader asked for reduced data usage.
    pub save_data: bool,
    pub connection: ConnectionClass,
}

impl NetworkHint {
    /// Data-saver on, or a 2G-class connection.
    pub fn is_constrained(&self) -> bool {
        self.save_data || matches!(self.connection, ConnectionClass::Slow2g | ConnectionClass::TwoG)
    }
}

// ---------------------------------------------------------------------------
// AssetsConfig
// ---------------------------------------------------------------------------

/// Where relative source locators are resolved.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AssetsConfig {
    /// Directory relative locators are read from.
    pub root_dir: PathBuf,
    /// Remote origin tried when a relative locator is not on disk.
    pub base_url: Option<String>,
    /// Per-request HTTP timeout.
    pub timeout_secs: u64,
}

impl Default for AssetsConfig {
    fn default() -> Self {
        Self {
            root_dir: PathBuf::from("."),
            base_url: None,
            timeout_secs: 15,
        }
    }
}

// ---------------------------------------------------------------------------
// VolumePrefs
// ---------------------------------------------------------------------------

/// The reader's two volume controls, both `0.0..=1.0`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VolumePrefs {
    pub music: f32,
    pub voice: f32,
}

impl Default for VolumePrefs {
    fn default() -> Self {
        Self {
            music: 0.8,
            voice: 1.0,
        }
    }
}

impl VolumePrefs {
    /// Same preferences with both levels clamped to `0.0..=1.0`.
    pub fn clamped(self) -> Self {
        Self {
            music: clamp_level(self.music),
            voice: clamp_level(self.voice),
        }
    }
}

/// Clamp a gain to `0.0..=1.0`.  NaN maps to silence.
pub fn clamp_level(level: f32) -> f32 {
    if level.is_nan() {
        0.0
    } else {
        level.clamp(0.0, 1.0)
    }
}

// ---------------------------------------------------------------------------
// AppConfig  (top-level)
// ---------------------------------------------------------------------------

/// Top-level configuration, serialised as `settings.toml`.
///
/// # Persistence
///
/// ```rust,no_run
/// use tale_audio::config::AppConfig;
///
/// // Load (returns Default when file is missing)
/// let mut config = AppConfig::load().unwrap();
///
/// config.volume.music = 0.4;
/// config.save().unwrap();
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub audio: AudioConfig,
    pub cue: CueConfig,
    pub voice: VoiceConfig,
    pub prefetch: PrefetchConfig,
    pub network: NetworkHint,
    pub assets: AssetsConfig,
    /// Reader volume preferences, replayed into the buses on load.
    pub volume: VolumePrefs,
}

impl AppConfig {
    /// Load configuration from the platform-appropriate `settings.toml`.
    ///
    /// Returns `Ok(AppConfig::default())` when the file does not exist yet.
    pub fn load() -> Result<Self> {
        Self::load_from(&AppPaths::new().settings_file)
    }

    /// Load from an explicit path.
    pub fn load_from(path: &std::path::Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content)?;
        Ok(config)
    }

    /// Save to the platform-appropriate `settings.toml`, creating parent
    /// directories as needed.
    pub fn save(&self) -> Result<()> {
        self.save_to(&AppPaths::new().settings_file)
    }

    /// Save to an explicit path.
    pub fn save_to(&self, path: &std::path::Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
