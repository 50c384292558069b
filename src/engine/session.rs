//! One reading session: a chapter open in the reader.
//!
//! The session owns the fired-set and page cursor and wires page changes,
//! taps and volume controls into the engine.  Every call degrades to
//! silence when audio is unavailable; nothing here returns an audio error.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;

use super::cue::{CueEngine, CueOptions, CueState};
use super::graph::AudioGraph;
use super::prefetch::Prefetcher;
use super::scheduler::{Firing, TriggerScheduler};
use super::voice::{VoiceOptions, VoiceOutcome, VoicePlayer, TEST_TONE_SRC};
use crate::audio::{Bus, ContextState, MediaElement};
use crate::chapter::{Chapter, PageList};
use crate::config::{clamp_level, AppConfig, CueConfig, VolumePrefs};

/// Snapshot for status displays and logs.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionStatus {
    pub context: ContextState,
    pub page: usize,
    pub pages: usize,
    pub cue: CueState,
    pub speaking: bool,
    pub fired: usize,
    pub cached: usize,
    pub volume: VolumePrefs,
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let cue = match &self.cue {
            CueState::Idle => "none".to_string(),
            CueState::Playing { src } => src.clone(),
            CueState::Transitioning { from, to } => format!("{from} -> {to}"),
        };
        write!(
            f,
            "audio {} | page {}/{} | cue {} | voice {} | fired {} | cached {} | music {:.2} voice {:.2}",
            self.context.as_str(),
            self.page + 1,
            self.pages,
            cue,
            if self.speaking { "speaking" } else { "idle" },
            self.fired,
            self.cached,
            self.volume.music,
            self.volume.voice,
        )
    }
}

pub struct ReadingSession {
    chapter: Chapter,
    pages: PageList,
    graph: Arc<AudioGraph>,
    cues: Arc<CueEngine>,
    voice: Arc<VoicePlayer>,
    scheduler: TriggerScheduler,
    prefetcher: Prefetcher,
    cue_config: CueConfig,
    voice_options: VoiceOptions,
    volume: VolumePrefs,
    page: usize,
    mounted: bool,
    /// Ambience claimed at mount, started once audio runs.
    ambience: Option<Firing>,
}

impl ReadingSession {
    pub fn new(
        chapter: Chapter,
        pages: PageList,
        graph: Arc<AudioGraph>,
        element: Arc<dyn MediaElement>,
        config: &AppConfig,
    ) -> Self {
        let cues = Arc::new(CueEngine::new(graph.clone(), element.clone(), &config.cue));
        let voice = Arc::new(VoicePlayer::new(graph.clone(), element, &config.voice));
        Self {
            chapter,
            pages,
            graph,
            cues,
            voice,
            scheduler: TriggerScheduler::new(),
            prefetcher: Prefetcher::new(config.prefetch.clone(), config.network.clone()),
            cue_config: config.cue.clone(),
            voice_options: VoiceOptions::from_config(&config.voice),
            volume: config.volume.clamped(),
            page: 0,
            mounted: false,
            ambience: None,
        }
    }

    /// Start the session on page 0.  A second call is a no-op.
    ///
    /// Must run inside a tokio runtime: playback and prefetch are spawned.
    pub fn mount(&mut self) {
        if self.mounted {
            log::debug!("session: already mounted");
            return;
        }
        self.mounted = true;
        log::info!(
            "session: mounted ({} blocks, {} triggers, {} pages)",
            self.chapter.blocks().len(),
            self.chapter.triggers().len(),
            self.pages.len()
        );

        self.apply_volumes(self.volume);
        self.ambience = self.scheduler.start_ambience(&self.chapter);
        if self.graph.is_running() {
            self.start_ambience();
        }
        self.enter_page(0);
    }

    /// The reader interacted: try to start audio and catch up on anything
    /// deferred.  Returns whether audio is now running.
    pub async fn user_gesture(&mut self) -> bool {
        if let Err(e) = self.graph.ensure_started().await {
            log::info!("session: audio still unavailable: {e}");
            return false;
        }
        self.start_ambience();
        for firing in self.scheduler.catch_up(&self.chapter, &self.pages) {
            self.dispatch(&firing);
        }
        true
    }

    /// The visible page changed.  Returns what fired.
    pub fn page_changed(&mut self, index: usize) -> Vec<Firing> {
        let index = index.min(self.pages.len().saturating_sub(1));
        self.enter_page(index)
    }

    fn enter_page(&mut self, index: usize) -> Vec<Firing> {
        self.page = index;
        let running = self.graph.is_running();
        let firings = self
            .scheduler
            .on_page(&self.chapter, &self.pages, index, running);
        for firing in &firings {
            self.dispatch(firing);
        }
        self.prefetcher
            .warm(&self.graph, &self.chapter, &self.pages, index);
        firings
    }

    fn start_ambience(&mut self) {
        if let Some(firing) = self.ambience.take() {
            self.dispatch(&firing);
        }
    }

    fn dispatch(&self, firing: &Firing) {
        match firing {
            Firing::Cue { src, looping } => {
                self.cues
                    .set_cue(src, CueOptions::from_config(&self.cue_config, *looping));
            }
            Firing::Sfx { src } => {
                let graph = self.graph.clone();
                let src = src.clone();
                tokio::spawn(async move {
                    graph.play_oneshot(&src, Bus::Sfx).await;
                });
            }
        }
    }

    /// Play the voice line of `block_id`, if it has one.
    ///
    /// A tap counts as a user gesture, so audio is started first if needed.
    pub async fn tap_dialogue(&mut self, block_id: &str) -> Option<JoinHandle<VoiceOutcome>> {
        let src = match self.chapter.voice_for(block_id) {
            Some(src) => src.to_string(),
            None => {
                log::debug!("session: `{block_id}` has no voice line");
                return None;
            }
        };
        if !self.graph.is_running() {
            self.user_gesture().await;
        }
        Some(self.voice.play(&src, self.voice_options))
    }

    /// Play the diagnostic tone through the voice path.
    pub async fn test_tone(&mut self) -> JoinHandle<VoiceOutcome> {
        if !self.graph.is_running() {
            self.user_gesture().await;
        }
        self.voice.play(TEST_TONE_SRC, self.voice_options)
    }

    pub fn set_music_volume(&mut self, level: f32) {
        self.volume.music = clamp_level(level);
        self.graph.set_bus_volume(Bus::Music, self.volume.music);
        self.cues.set_element_volume(self.volume.music);
    }

    pub fn set_voice_volume(&mut self, level: f32) {
        self.volume.voice = clamp_level(level);
        self.graph.set_bus_volume(Bus::Voice, self.volume.voice);
        self.voice.set_element_volume(self.volume.voice);
    }

    /// Replay stored preferences into the buses.
    pub fn apply_volumes(&mut self, prefs: VolumePrefs) {
        let prefs = prefs.clamped();
        self.set_music_volume(prefs.music);
        self.set_voice_volume(prefs.voice);
    }

    pub fn volumes(&self) -> VolumePrefs {
        self.volume
    }

    pub fn page(&self) -> usize {
        self.page
    }

    pub fn chapter(&self) -> &Chapter {
        &self.chapter
    }

    pub fn status(&self) -> SessionStatus {
        SessionStatus {
            context: self.graph.context_state(),
            page: self.page,
            pages: self.pages.len(),
            cue: self.cues.state(),
            speaking: self.voice.is_speaking(),
            fired: self.scheduler.fired_count(),
            cached: self.graph.cached_count(),
            volume: self.volume,
        }
    }

    /// Stop all sound and release the output.
    pub fn close(&mut self) {
        self.voice.stop();
        self.cues.stop(Duration::ZERO);
        self.graph.close();
        self.mounted = false;
        log::info!("session: closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::{MockElement, MockFetcher, OfflineDevice};
    use crate::engine::testing::{drive, offline_graph_with, render_for};

    const SCENARIO: &str = r#"{
        "blocks": [
            { "type": "narration", "id": "p1", "text": "one" },
            { "type": "narration", "id": "p2", "text": "two" },
            { "type": "dialogue", "id": "d1", "speaker": "Mara", "voice": "vo/d1.wav" }
        ],
        "triggers": [
            { "kind": "cue", "at": "progress:0.0", "src": "A" },
            { "kind": "sfx", "at": "para:p2", "src": "B" }
        ]
    }"#;

    fn fetcher() -> MockFetcher {
        MockFetcher::new()
            .with_wav("A", 1_600)
            .with_wav("B", 16_000)
            .with_wav("vo/d1.wav", 800)
    }

    fn config() -> AppConfig {
        let mut config = AppConfig::default();
        config.audio = crate::engine::testing::test_audio_config();
        config.cue.fade_ms = 100;
        config
    }

    fn session_on(device: OfflineDevice) -> (ReadingSession, Arc<AudioGraph>, Arc<OfflineDevice>) {
        let device = Arc::new(device);
        let graph = offline_graph_with(device.clone(), fetcher());
        let chapter = Chapter::from_json(SCENARIO).unwrap();
        let pages = PageList::new(vec![vec!["p1".into()], vec!["p2".into(), "d1".into()]]);
        let session = ReadingSession::new(
            chapter,
            pages,
            graph.clone(),
            Arc::new(MockElement::new()),
            &config(),
        );
        (session, graph, device)
    }

    async fn wait_for(graph: &AudioGraph, mut done: impl FnMut() -> bool) {
        for _ in 0..1_000 {
            if done() {
                return;
            }
            render_for(graph, Duration::from_millis(5)).await;
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        panic!("condition not reached");
    }

    fn on_bus(graph: &AudioGraph, bus: Bus) -> usize {
        graph.with_mixer(|m| m.sources_on(bus).len()).unwrap()
    }

    #[tokio::test]
    async fn two_page_scenario() {
        let (mut session, graph, _) = session_on(OfflineDevice::new());
        graph.ensure_started().await.unwrap();

        session.mount();
        wait_for(&graph, || on_bus(&graph, Bus::Music) == 1).await;
        assert_eq!(session.status().cue, CueState::Playing { src: "A".into() });

        let fired = session.page_changed(1);
        assert_eq!(fired, vec![Firing::Sfx { src: "B".into() }]);
        wait_for(&graph, || on_bus(&graph, Bus::Sfx) == 1).await;

        assert!(session.page_changed(0).is_empty());
        assert!(session.page_changed(1).is_empty());
        assert_eq!(session.status().fired, 2);
    }

    #[tokio::test]
    async fn mount_twice_is_harmless() {
        let (mut session, graph, _) = session_on(OfflineDevice::new());
        graph.ensure_started().await.unwrap();
        session.mount();
        session.mount();
        wait_for(&graph, || on_bus(&graph, Bus::Music) == 1).await;
        render_for(&graph, Duration::from_millis(50)).await;
        assert_eq!(on_bus(&graph, Bus::Music), 1);
    }

    #[tokio::test]
    async fn audio_waits_for_a_gesture() {
        let (mut session, graph, device) = session_on(OfflineDevice::refusing());
        session.mount();
        assert!(session.page_changed(1).is_empty());
        assert_eq!(session.status().context, ContextState::Idle);

        // still refused: reading continues in silence
        assert!(!session.user_gesture().await);
        assert_eq!(on_bus(&graph, Bus::Music), 0);

        device.set_refuse(false);
        assert!(session.user_gesture().await);
        assert_eq!(session.status().context, ContextState::Running);
        wait_for(&graph, || on_bus(&graph, Bus::Music) == 1 && on_bus(&graph, Bus::Sfx) == 1)
            .await;
        assert_eq!(session.status().fired, 2);
    }

    #[tokio::test]
    async fn suspended_output_is_resumed_on_gesture() {
        let (mut session, graph, _) = session_on(OfflineDevice::suspended());
        session.mount();
        assert!(session.user_gesture().await);
        assert!(graph.is_running());
        wait_for(&graph, || on_bus(&graph, Bus::Music) == 1).await;
    }

    #[tokio::test]
    async fn tap_plays_the_dialogue_voice() {
        let (mut session, graph, _) = session_on(OfflineDevice::new());
        session.mount();
        session.page_changed(1);

        // the tap itself starts audio
        let handle = session.tap_dialogue("d1").await.unwrap();
        assert!(graph.is_running());
        let outcome = drive(&graph, handle).await.unwrap();
        assert_eq!(outcome, VoiceOutcome::Completed { strategy: "graph" });

        assert!(session.tap_dialogue("p1").await.is_none());
        assert!(session.tap_dialogue("missing").await.is_none());
    }

    #[tokio::test]
    async fn test_tone_completes() {
        let (mut session, graph, _) = session_on(OfflineDevice::new());
        let handle = session.test_tone().await;
        let outcome = drive(&graph, handle).await.unwrap();
        assert_eq!(outcome, VoiceOutcome::Completed { strategy: "test-tone" });
    }

    #[tokio::test]
    async fn volumes_are_clamped_and_applied() {
        let (mut session, graph, _) = session_on(OfflineDevice::new());
        session.apply_volumes(VolumePrefs {
            music: 1.7,
            voice: -0.2,
        });
        assert_eq!(session.volumes(), VolumePrefs { music: 1.0, voice: 0.0 });
        assert_eq!(graph.bus_volume(Bus::Music), 1.0);
        assert_eq!(graph.bus_volume(Bus::Voice), 0.0);

        session.set_music_volume(0.25);
        assert_eq!(graph.bus_volume(Bus::Music), 0.25);

        session.set_music_volume(f32::NAN);
        assert_eq!(session.volumes().music, 0.0);
        assert_eq!(graph.bus_volume(Bus::Music), 0.0);
    }

    #[tokio::test]
    async fn page_index_is_clamped() {
        let (mut session, _, _) = session_on(OfflineDevice::new());
        session.mount();
        session.page_changed(9);
        assert_eq!(session.page(), 1);
    }

    #[tokio::test]
    async fn close_silences_everything() {
        let (mut session, graph, _) = session_on(OfflineDevice::new());
        graph.ensure_started().await.unwrap();
        session.mount();
        wait_for(&graph, || on_bus(&graph, Bus::Music) == 1).await;

        session.close();
        assert_eq!(on_bus(&graph, Bus::Music), 0);
        assert_eq!(session.status().context, ContextState::Closed);
        // still callable afterwards
        assert!(session.page_changed(1).is_empty());
    }

    #[test]
    fn status_display_is_one_line() {
        let status = SessionStatus {
            context: ContextState::Running,
            page: 0,
            pages: 3,
            cue: CueState::Transitioning {
                from: "a.ogg".into(),
                to: "b.ogg".into(),
            },
            speaking: false,
            fired: 1,
            cached: 2,
            volume: VolumePrefs::default(),
        };
        let line = status.to_string();
        assert!(line.contains("page 1/3"));
        assert!(line.contains("a.ogg -> b.ogg"));
        assert!(!line.contains('\n'));
    }
}
