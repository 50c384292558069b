//! Voice lines: one at a time, music ducked underneath.
//!
//! ```text
//! play(src) ── cut current line ── duck music (attack)
//!     │
//!     ├─▶ decode ── still newest? ── start on the voice bus
//!     │
//!     └─▶ on failure, FallbackChain: element ─▶ fallback tone
//!             │
//!             └─▶ await end ── still newest? ── restore music (release)
//! ```
//!
//! The graph path starts its source while holding the line lock, so a line
//! superseded during decode never reaches the output.
//!
//! A line always resolves: `Completed` with the strategy that played it,
//! `Interrupted` when a newer line (or `stop`) cut it, or `Silent` when even
//! the tone could not play.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;

use super::fallback::{FallbackChain, Strategy};
use super::graph::AudioGraph;
use crate::audio::{
    AudioError, Bus, ElementOptions, MediaElement, Playback, Stopper, Tone,
};
use crate::config::VoiceConfig;

/// Reserved source that always plays [`Tone::DIAGNOSTIC`], no network.
pub const TEST_TONE_SRC: &str = "tone:test";

/// Rate tones are synthesized at for the element path.
const ELEMENT_TONE_RATE: u32 = 48_000;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VoiceOptions {
    /// Music multiplier while the line plays.
    pub duck_level: f32,
    /// Time for music to come back after the line ends.
    pub release: Duration,
}

impl VoiceOptions {
    pub fn from_config(config: &VoiceConfig) -> Self {
        Self {
            duck_level: config.duck_level,
            release: config.release(),
        }
    }
}

impl Default for VoiceOptions {
    fn default() -> Self {
        Self::from_config(&VoiceConfig::default())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VoiceOutcome {
    Completed { strategy: &'static str },
    Interrupted,
    Silent,
}

// ---------------------------------------------------------------------------
// Strategies
// ---------------------------------------------------------------------------

struct ElementVoice {
    graph: Arc<AudioGraph>,
    element: Arc<dyn MediaElement>,
}

#[async_trait]
impl Strategy<Playback> for ElementVoice {
    fn name(&self) -> &'static str {
        "element"
    }

    async fn attempt(&self, src: &str) -> Result<Playback, AudioError> {
        let options = ElementOptions {
            looping: false,
            volume: self.graph.bus_volume(Bus::Voice),
        };
        Ok(self.element.play(src, options).await?.into())
    }
}

/// Synthesized tone: through the graph when it runs, else the element.
struct ToneVoice {
    graph: Arc<AudioGraph>,
    element: Arc<dyn MediaElement>,
    tone: Tone,
    name: &'static str,
}

#[async_trait]
impl Strategy<Playback> for ToneVoice {
    fn name(&self) -> &'static str {
        self.name
    }

    async fn attempt(&self, _src: &str) -> Result<Playback, AudioError> {
        if self.graph.is_running() {
            return self.graph.play_tone(self.tone, Bus::Voice);
        }
        let samples = self.tone.render_stereo(ELEMENT_TONE_RATE);
        let volume = self.graph.bus_volume(Bus::Voice);
        Ok(self
            .element
            .play_pcm(samples, ELEMENT_TONE_RATE, volume)
            .await?
            .into())
    }
}

// ---------------------------------------------------------------------------
// VoicePlayer
// ---------------------------------------------------------------------------

#[derive(Default)]
struct VoiceLine {
    generation: u64,
    current: Option<Stopper>,
}

enum GraphLine {
    Started(Playback),
    Superseded,
    Unavailable,
}

pub struct VoicePlayer {
    graph: Arc<AudioGraph>,
    attack: Duration,
    release: Duration,
    line: Mutex<VoiceLine>,
    chain: FallbackChain<Playback>,
    test_tone: FallbackChain<Playback>,
}

impl VoicePlayer {
    pub fn new(graph: Arc<AudioGraph>, element: Arc<dyn MediaElement>, config: &VoiceConfig) -> Self {
        let chain = FallbackChain::new()
            .then(ElementVoice {
                graph: graph.clone(),
                element: element.clone(),
            })
            .then(ToneVoice {
                graph: graph.clone(),
                element: element.clone(),
                tone: Tone::VOICE_FALLBACK,
                name: "tone",
            });

        let test_tone = FallbackChain::new().then(ToneVoice {
            graph: graph.clone(),
            element,
            tone: Tone::DIAGNOSTIC,
            name: "test-tone",
        });

        Self {
            graph,
            attack: config.attack(),
            release: config.release(),
            line: Mutex::new(VoiceLine::default()),
            chain,
            test_tone,
        }
    }

    fn line(&self) -> MutexGuard<'_, VoiceLine> {
        self.line.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Play `src` as the only voice line, ducking music until it ends.
    ///
    /// Any line already playing is cut before this returns.
    pub fn play(self: &Arc<Self>, src: &str, options: VoiceOptions) -> JoinHandle<VoiceOutcome> {
        let generation = {
            let mut line = self.line();
            if let Some(previous) = line.current.take() {
                log::debug!("voice: cutting current line");
                previous.stop();
            }
            line.generation += 1;
            line.generation
        };
        self.graph.ramp_duck(options.duck_level, self.attack);

        let player = self.clone();
        let src = src.to_string();
        tokio::spawn(async move { player.run_line(generation, src, options).await })
    }

    async fn run_line(&self, generation: u64, src: String, options: VoiceOptions) -> VoiceOutcome {
        let chain = if src == TEST_TONE_SRC {
            &self.test_tone
        } else {
            match self.play_on_graph(generation, &src).await {
                GraphLine::Started(playback) => {
                    return self.await_line(generation, &src, "graph", playback, options).await;
                }
                GraphLine::Superseded => return VoiceOutcome::Interrupted,
                GraphLine::Unavailable => &self.chain,
            }
        };

        let Some((strategy, playback)) = chain.run(&src).await else {
            log::warn!("voice: nothing could play `{src}`");
            return self.finish(generation, options, VoiceOutcome::Silent);
        };

        {
            let mut line = self.line();
            if line.generation != generation {
                playback.stopper.stop();
                return VoiceOutcome::Interrupted;
            }
            line.current = Some(playback.stopper.clone());
        }
        self.await_line(generation, &src, strategy, playback, options).await
    }

    /// Decode `src`, then start it on the voice bus only if `generation` is
    /// still the newest line.
    async fn play_on_graph(&self, generation: u64, src: &str) -> GraphLine {
        if !self.graph.is_running() {
            return GraphLine::Unavailable;
        }
        let buffer = match self.graph.decode(src).await {
            Ok(buffer) => buffer,
            Err(e) => {
                log::warn!("voice: graph cannot play `{src}`: {e}");
                return GraphLine::Unavailable;
            }
        };

        let mut line = self.line();
        if line.generation != generation {
            log::debug!("voice: `{src}` superseded while decoding");
            return GraphLine::Superseded;
        }
        match self.graph.start_decoded(buffer, Bus::Voice) {
            Ok(playback) => {
                line.current = Some(playback.stopper.clone());
                GraphLine::Started(playback)
            }
            Err(e) => {
                log::warn!("voice: graph cannot start `{src}`: {e}");
                GraphLine::Unavailable
            }
        }
    }

    async fn await_line(
        &self,
        generation: u64,
        src: &str,
        strategy: &'static str,
        playback: Playback,
        options: VoiceOptions,
    ) -> VoiceOutcome {
        log::debug!("voice: `{src}` playing via {strategy}");
        // resolves on natural end and on stop
        let _ = playback.ended.await;

        self.finish(generation, options, VoiceOutcome::Completed { strategy })
    }

    /// Release the duck if `generation` is still the newest line.
    fn finish(&self, generation: u64, options: VoiceOptions, outcome: VoiceOutcome) -> VoiceOutcome {
        let mut line = self.line();
        if line.generation != generation {
            return VoiceOutcome::Interrupted;
        }
        line.current = None;
        self.graph.ramp_duck(1.0, options.release);
        outcome
    }

    /// Cut the current line and bring the music back.
    pub fn stop(&self) {
        let mut line = self.line();
        line.generation += 1;
        if let Some(current) = line.current.take() {
            current.stop();
        }
        self.graph.ramp_duck(1.0, self.release);
    }

    pub fn is_speaking(&self) -> bool {
        self.line().current.is_some()
    }

    /// Apply a voice volume change to a line playing through the element.
    /// Graph lines follow the voice bus on their own.
    pub fn set_element_volume(&self, volume: f32) {
        if let Some(Stopper::Element(handle)) = &self.line().current {
            handle.set_volume(volume);
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
