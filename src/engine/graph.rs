//! The session's single audio graph.
//!
//! [`AudioGraph`] ties together the output device, the mixing graph and a
//! decode cache keyed by source locator.  It is constructed once per
//! reading session and shared (`Arc<AudioGraph>`) with the cue engine,
//! the voice player and the prefetcher.
//!
//! # Lifecycle
//!
//! ```text
//! new ──▶ Idle ──ensure_started──▶ Suspended ──(resume)──▶ Running
//!           │            │                                   │
//!           │       Err(Policy): stays Idle, retried on      │
//!           │       the next ensure_started                  │
//!           └───────────────────── close ◀───────────────────┘
//! ```

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::OnceCell;

use crate::audio::{
    decode_bytes, AudioError, Bus, ContextState, MixGraph, OutputDevice, Playback, SharedBuffer,
    SharedMixer, SourceFetcher, Tone,
};
use crate::config::{clamp_level, AudioConfig};

/// Output device + mixing graph + decode cache.
pub struct AudioGraph {
    device: Arc<dyn OutputDevice>,
    fetcher: Arc<dyn SourceFetcher>,
    mixer: SharedMixer,
    requested_rate: u32,
    volume_ramp: Duration,
    /// Rate the device opened at; set once the first open succeeds.
    started: OnceCell<u32>,
    cache: Mutex<HashMap<String, Arc<OnceCell<SharedBuffer>>>>,
}

impl AudioGraph {
    pub fn new(
        device: Arc<dyn OutputDevice>,
        fetcher: Arc<dyn SourceFetcher>,
        config: &AudioConfig,
    ) -> Self {
        Self {
            device,
            fetcher,
            mixer: MixGraph::shared(config.sample_rate),
            requested_rate: config.sample_rate,
            volume_ramp: config.volume_ramp(),
            started: OnceCell::new(),
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Run `f` with the mixer locked.  Never call across an `.await`.
    pub fn with_mixer<R>(&self, f: impl FnOnce(&mut MixGraph) -> R) -> Result<R, AudioError> {
        let mut mix = self
            .mixer
            .lock()
            .map_err(|_| AudioError::Device("mixer lock poisoned".into()))?;
        Ok(f(&mut mix))
    }

    pub fn mixer(&self) -> SharedMixer {
        self.mixer.clone()
    }

    pub fn sample_rate(&self) -> u32 {
        self.with_mixer(|m| m.sample_rate())
            .unwrap_or(self.requested_rate)
    }

    // -----------------------------------------------------------------------
    // Context
    // -----------------------------------------------------------------------

    /// Open the output context if needed and make sure it is running.
    ///
    /// Concurrent callers share one open.  A failed open is not remembered:
    /// the next call tries again, which is how a policy refusal turns into
    /// sound after the first user gesture.
    pub async fn ensure_started(&self) -> Result<(), AudioError> {
        self.started
            .get_or_try_init(|| async {
                let device = self.device.clone();
                let mixer = self.mixer.clone();
                let rate = self.requested_rate;
                let opened = tokio::task::spawn_blocking(move || device.open(rate, mixer))
                    .await
                    .map_err(|e| AudioError::Device(e.to_string()))??;

                self.with_mixer(|m| m.set_sample_rate(opened))?;
                log::info!("graph: output opened at {opened} Hz");
                Ok::<u32, AudioError>(opened)
            })
            .await?;

        match self.device.state() {
            ContextState::Running => Ok(()),
            ContextState::Suspended => {
                let device = self.device.clone();
                tokio::task::spawn_blocking(move || device.resume())
                    .await
                    .map_err(|e| AudioError::Device(e.to_string()))??;
                log::info!("graph: output resumed");
                Ok(())
            }
            ContextState::Closed => Err(AudioError::Device("output already closed".into())),
            ContextState::Idle => Err(AudioError::NotStarted),
        }
    }

    pub fn context_state(&self) -> ContextState {
        self.device.state()
    }

    pub fn is_running(&self) -> bool {
        self.context_state() == ContextState::Running
    }

    // -----------------------------------------------------------------------
    // Decode cache
    // -----------------------------------------------------------------------

    /// Decoded buffer for `src`, fetching and decoding on a miss.
    ///
    /// Concurrent requests for the same source share one fetch.  Errors are
    /// returned to every waiter and not cached.
    pub async fn decode(&self, src: &str) -> Result<SharedBuffer, AudioError> {
        let cell = {
            let mut cache = self
                .cache
                .lock()
                .map_err(|_| AudioError::Device("decode cache lock poisoned".into()))?;
            cache.entry(src.to_string()).or_default().clone()
        };

        cell.get_or_try_init(|| async {
            let bytes = self.fetcher.fetch(src).await?;
            let rate = self.sample_rate();
            let owned = src.to_string();
            let buffer = tokio::task::spawn_blocking(move || {
                decode_bytes(&owned, bytes).map(|b| b.into_rate(rate))
            })
            .await
            .map_err(|e| AudioError::Decode {
                src: src.to_string(),
                reason: e.to_string(),
            })??;

            log::debug!(
                "graph: decoded `{src}` ({:.2}s @ {} Hz)",
                buffer.duration().as_secs_f32(),
                buffer.sample_rate
            );
            Ok::<SharedBuffer, AudioError>(Arc::new(buffer))
        })
        .await
        .cloned()
    }

    pub fn is_cached(&self, src: &str) -> bool {
        self.cache
            .lock()
            .map(|c| c.get(src).is_some_and(|cell| cell.initialized()))
            .unwrap_or(false)
    }

    pub fn cached_count(&self) -> usize {
        self.cache
            .lock()
            .map(|c| c.values().filter(|cell| cell.initialized()).count())
            .unwrap_or(0)
    }

    // -----------------------------------------------------------------------
    // Volume
    // -----------------------------------------------------------------------

    /// Set a bus level (clamped to `0.0..=1.0`) with a short ramp.
    pub fn set_bus_volume(&self, bus: Bus, level: f32) {
        let level = clamp_level(level);
        let ramp = self.volume_ramp;
        if let Err(e) = self.with_mixer(|m| m.set_bus_gain(bus, level, ramp)) {
            log::warn!("graph: cannot set {} volume: {e}", bus.as_str());
        }
    }

    /// The level last set on `bus`.
    pub fn bus_volume(&self, bus: Bus) -> f32 {
        self.with_mixer(|m| m.bus_target(bus)).unwrap_or(0.0)
    }

    /// Ramp the music-duck stage.  Only the voice player drives this.
    pub fn ramp_duck(&self, level: f32, ramp: Duration) {
        if let Err(e) = self.with_mixer(|m| m.ramp_duck(level, ramp)) {
            log::warn!("graph: cannot duck music: {e}");
        }
    }

    /// Effective music level right now (bus × duck).
    pub fn music_level(&self) -> f32 {
        self.with_mixer(|m| m.music_level()).unwrap_or(0.0)
    }

    // -----------------------------------------------------------------------
    // Playback
    // -----------------------------------------------------------------------

    /// Decode `src` and start it once on `bus`.
    pub async fn play_buffer(&self, src: &str, bus: Bus) -> Result<Playback, AudioError> {
        if !self.is_running() {
            return Err(AudioError::NotStarted);
        }
        let buffer = self.decode(src).await?;
        self.start_decoded(buffer, bus)
    }

    /// Start an already decoded buffer once on `bus`.
    pub fn start_decoded(&self, buffer: SharedBuffer, bus: Bus) -> Result<Playback, AudioError> {
        if !self.is_running() {
            return Err(AudioError::NotStarted);
        }
        let started = self.with_mixer(|m| m.start_buffer(buffer, bus, 1.0, false))?;
        Ok(Playback::from_graph(self.mixer.clone(), started))
    }

    /// Fire-and-forget one-shot: failures are logged and yield silence.
    pub async fn play_oneshot(&self, src: &str, bus: Bus) -> Option<Playback> {
        match self.play_buffer(src, bus).await {
            Ok(playback) => Some(playback),
            Err(e) => {
                log::warn!("graph: one-shot `{src}` on {} skipped: {e}", bus.as_str());
                None
            }
        }
    }

    pub fn play_tone(&self, tone: Tone, bus: Bus) -> Result<Playback, AudioError> {
        if !self.is_running() {
            return Err(AudioError::NotStarted);
        }
        let started = self.with_mixer(|m| m.start_tone(tone, bus))?;
        Ok(Playback::from_graph(self.mixer.clone(), started))
    }

    /// Pull `frames` stereo frames straight from the mixer.
    ///
    /// For headless runs with an [`OfflineDevice`](crate::audio::OfflineDevice);
    /// with a real device the callback is already consuming the graph.
    pub fn render_offline(&self, frames: usize) -> Vec<f32> {
        let mut out = vec![0.0; frames * 2];
        if let Err(e) = self.with_mixer(|m| m.render(&mut out)) {
            log::error!("graph: offline render failed: {e}");
        }
        out
    }

    /// Stop every source and release the device.
    pub fn close(&self) {
        if let Err(e) = self.with_mixer(|m| m.stop_all()) {
            log::warn!("graph: stop on close failed: {e}");
        }
        self.device.close();
        log::info!("graph: closed");
    }
}

impl Drop for AudioGraph {
    fn drop(&mut self) {
        self.device.close();
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::{MockFetcher, OfflineDevice};
    use crate::engine::testing::{offline_graph, offline_graph_with};

    #[tokio::test]
    async fn concurrent_starts_open_once() {
        let (graph, device) = offline_graph(MockFetcher::new());
        let (a, b) = tokio::join!(graph.ensure_started(), graph.ensure_started());
        assert!(a.is_ok() && b.is_ok());
        assert_eq!(device.open_count(), 1);
        assert!(graph.is_running());
    }

    #[tokio::test]
    async fn policy_refusal_is_retried() {
        let device = Arc::new(OfflineDevice::refusing());
        let graph = offline_graph_with(device.clone(), MockFetcher::new());

        let err = graph.ensure_started().await.unwrap_err();
        assert!(matches!(err, AudioError::Policy(_)));
        assert_eq!(graph.context_state(), ContextState::Idle);

        device.set_refuse(false);
        graph.ensure_started().await.unwrap();
        assert!(graph.is_running());
    }

    #[tokio::test]
    async fn suspended_context_is_resumed() {
        let device = Arc::new(OfflineDevice::suspended());
        let graph = offline_graph_with(device.clone(), MockFetcher::new());
        graph.ensure_started().await.unwrap();
        assert_eq!(device.state(), ContextState::Running);
    }

    #[tokio::test]
    async fn concurrent_decodes_share_one_fetch() {
        let fetcher = MockFetcher::with_delay(Duration::from_millis(20)).with_wav("a.wav", 800);
        let fetcher = Arc::new(fetcher);
        let device = Arc::new(OfflineDevice::new());
        let graph = AudioGraph::new(device, fetcher.clone(), &AudioConfig::default());

        let (a, b) = tokio::join!(graph.decode("a.wav"), graph.decode("a.wav"));
        assert!(Arc::ptr_eq(&a.unwrap(), &b.unwrap()));
        assert_eq!(fetcher.calls(), 1);
        assert!(graph.is_cached("a.wav"));
        assert_eq!(graph.cached_count(), 1);
    }

    #[tokio::test]
    async fn decode_resamples_to_graph_rate() {
        let (graph, _) = offline_graph(MockFetcher::new().with_wav("a.wav", 1_600));
        let buffer = graph.decode("a.wav").await.unwrap();
        assert_eq!(buffer.sample_rate, graph.sample_rate());
    }

    #[tokio::test]
    async fn decode_failures_are_not_cached() {
        let fetcher = Arc::new(MockFetcher::new().with_garbage("bad.mp3"));
        let graph = AudioGraph::new(
            Arc::new(OfflineDevice::new()),
            fetcher.clone(),
            &AudioConfig::default(),
        );

        assert!(graph.decode("bad.mp3").await.is_err());
        assert!(!graph.is_cached("bad.mp3"));
        assert!(graph.decode("bad.mp3").await.is_err());
        assert_eq!(fetcher.calls(), 2);
        assert_eq!(graph.cached_count(), 0);
    }

    #[tokio::test]
    async fn bus_volume_is_clamped() {
        let (graph, _) = offline_graph(MockFetcher::new());
        graph.set_bus_volume(Bus::Music, 1.5);
        assert_eq!(graph.bus_volume(Bus::Music), 1.0);
        graph.set_bus_volume(Bus::Voice, -0.5);
        assert_eq!(graph.bus_volume(Bus::Voice), 0.0);
        graph.set_bus_volume(Bus::Music, f32::NAN);
        assert_eq!(graph.bus_volume(Bus::Music), 0.0);
    }

    #[tokio::test]
    async fn volume_change_is_ramped() {
        let (graph, _) = offline_graph(MockFetcher::new());
        graph.set_bus_volume(Bus::Sfx, 0.0);
        // not applied instantly
        assert_eq!(graph.with_mixer(|m| m.bus_gain(Bus::Sfx)).unwrap(), 1.0);
        graph.render_offline(graph.sample_rate() as usize / 10);
        assert_eq!(graph.with_mixer(|m| m.bus_gain(Bus::Sfx)).unwrap(), 0.0);
    }

    #[tokio::test]
    async fn oneshot_needs_running_context() {
        let (graph, _) = offline_graph(MockFetcher::new().with_wav("b.wav", 800));
        assert!(graph.play_oneshot("b.wav", Bus::Sfx).await.is_none());

        graph.ensure_started().await.unwrap();
        assert!(graph.play_oneshot("b.wav", Bus::Sfx).await.is_some());
        assert_eq!(graph.with_mixer(|m| m.sources_on(Bus::Sfx).len()).unwrap(), 1);
    }

    #[tokio::test]
    async fn oneshot_failure_degrades_to_silence() {
        let (graph, _) = offline_graph(MockFetcher::new());
        graph.ensure_started().await.unwrap();
        assert!(graph.play_oneshot("missing.ogg", Bus::Sfx).await.is_none());
    }

    #[tokio::test]
    async fn tone_renders_offline() {
        let (graph, _) = offline_graph(MockFetcher::new());
        graph.ensure_started().await.unwrap();
        let mut playback = graph.play_tone(Tone::DIAGNOSTIC, Bus::Voice).unwrap();

        let frames = Tone::DIAGNOSTIC.frames(graph.sample_rate()) as usize;
        let out = graph.render_offline(frames + 10);
        assert!(out.iter().any(|s| s.abs() > 0.05));
        assert!(playback.ended.try_recv().is_ok());
    }

    #[tokio::test]
    async fn close_stops_sources() {
        let (graph, device) = offline_graph(MockFetcher::new());
        graph.ensure_started().await.unwrap();
        let mut playback = graph.play_tone(Tone::DIAGNOSTIC, Bus::Voice).unwrap();
        graph.close();
        assert!(playback.ended.try_recv().is_ok());
        assert_eq!(device.state(), ContextState::Closed);
        assert!(graph.ensure_started().await.is_err());
    }
}
