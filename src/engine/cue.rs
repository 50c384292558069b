//! Background-music cues with crossfades.
//!
//! # State machine
//!
//! ```text
//!            set_cue(a)              set_cue(b)
//!   Idle ─────────────▶ Playing{a} ─────────────▶ Transitioning{a → b}
//!                            ▲                            │
//!                            │        fade + guard        │
//!                            └──── Playing{b} ◀───────────┘
//! ```
//!
//! At most one cue is current and at most one predecessor is fading out.
//! A new transition during a fade retires the older fading source over the
//! short stop guard, so no source is ever left running at zero gain.
//!
//! Commands are claimed synchronously in call order (a generation counter);
//! the decode that follows runs in a spawned task and is discarded if a newer
//! claim landed meanwhile.
//!
//! When the graph path cannot play a cue (decode failed, context not
//! running) the cue falls back to a [`MediaElement`].  Graph cues and the
//! element cue are never audible together.

use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::task::JoinHandle;

use super::graph::AudioGraph;
use crate::audio::{Bus, ElementHandle, ElementOptions, MediaElement, SharedBuffer, SourceId};
use crate::config::CueConfig;

// ---------------------------------------------------------------------------
// Public types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CueOptions {
    pub fade: Duration,
    pub looping: bool,
}

impl CueOptions {
    pub fn from_config(config: &CueConfig, looping: bool) -> Self {
        Self {
            fade: config.fade(),
            looping,
        }
    }
}

/// How a `set_cue` call ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CueOutcome {
    /// Same source as the current (or pending) cue; nothing changed.
    Unchanged,
    /// Crossfaded on the graph.
    Crossfaded,
    /// Playing through the streaming element.
    Fallback,
    /// A newer cue was requested before this one could start.
    Superseded,
    /// Neither path could play the source.
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CueState {
    Idle,
    Playing { src: String },
    Transitioning { from: String, to: String },
}

// ---------------------------------------------------------------------------
// Internal slots
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct GraphCue {
    src: String,
    id: SourceId,
}

#[derive(Debug, Clone)]
struct ElementCue {
    src: String,
    handle: ElementHandle,
}

#[derive(Default)]
struct CueSlots {
    generation: u64,
    /// Most recently claimed source (current or still decoding).
    target: Option<String>,
    current: Option<GraphCue>,
    fading: Option<GraphCue>,
    element: Option<ElementCue>,
}

// ---------------------------------------------------------------------------
// CueEngine
// ---------------------------------------------------------------------------

pub struct CueEngine {
    graph: Arc<AudioGraph>,
    element: Arc<dyn MediaElement>,
    stop_guard: Duration,
    slots: Mutex<CueSlots>,
}

impl CueEngine {
    pub fn new(graph: Arc<AudioGraph>, element: Arc<dyn MediaElement>, config: &CueConfig) -> Self {
        Self {
            graph,
            element,
            stop_guard: config.stop_guard(),
            slots: Mutex::new(CueSlots::default()),
        }
    }

    fn slots(&self) -> MutexGuard<'_, CueSlots> {
        // slots hold plain data; a panic elsewhere cannot leave them torn
        self.slots.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Switch the background music to `src`.
    ///
    /// The claim happens before this returns, so the last call wins no
    /// matter which decode finishes first.
    pub fn set_cue(self: &Arc<Self>, src: &str, options: CueOptions) -> JoinHandle<CueOutcome> {
        let generation = {
            let mut slots = self.slots();
            if slots.target.as_deref() == Some(src) {
                log::debug!("cue: `{src}` already current");
                return tokio::spawn(std::future::ready(CueOutcome::Unchanged));
            }
            slots.generation += 1;
            slots.target = Some(src.to_string());
            slots.generation
        };

        let engine = self.clone();
        let src = src.to_string();
        tokio::spawn(async move { engine.apply(generation, src, options).await })
    }

    async fn apply(&self, generation: u64, src: String, options: CueOptions) -> CueOutcome {
        let buffer = if self.graph.is_running() {
            match self.graph.decode(&src).await {
                Ok(buffer) => Some(buffer),
                Err(e) => {
                    log::warn!("cue: graph path failed for `{src}`: {e}");
                    None
                }
            }
        } else {
            log::debug!("cue: context not running, `{src}` goes to the element");
            None
        };

        match buffer {
            Some(buffer) => self.crossfade(generation, src, buffer, options),
            None => self.fallback(generation, src, options).await,
        }
    }

    fn crossfade(
        &self,
        generation: u64,
        src: String,
        buffer: SharedBuffer,
        options: CueOptions,
    ) -> CueOutcome {
        let mut slots = self.slots();
        if slots.generation != generation {
            return CueOutcome::Superseded;
        }

        if let Some(element) = slots.element.take() {
            log::debug!("cue: leaving element playback of `{}`", element.src);
            element.handle.stop();
        }

        let fade = options.fade;
        let guard = self.stop_guard;
        let slots = &mut *slots;
        let applied = self.graph.with_mixer(|mix| {
            if let Some(old) = slots.fading.take() {
                // cancel its fade where it is and get it out of the way
                let _ = mix.ramp_source(old.id, 0.0, guard);
                let _ = mix.stop_after(old.id, guard);
            }
            if let Some(current) = slots.current.take() {
                let _ = mix.ramp_source(current.id, 0.0, fade);
                let _ = mix.stop_after(current.id, fade + guard);
                slots.fading = Some(current);
            }

            let started = mix.start_buffer(buffer, Bus::Music, 0.0, options.looping);
            let _ = mix.ramp_source(started.id, 1.0, fade);
            started.id
        });

        match applied {
            Ok(id) => {
                log::info!("cue: crossfading to `{src}` over {}ms", fade.as_millis());
                slots.current = Some(GraphCue { src, id });
                CueOutcome::Crossfaded
            }
            Err(e) => {
                log::error!("cue: cannot start `{src}`: {e}");
                slots.target = None;
                CueOutcome::Failed
            }
        }
    }

    async fn fallback(&self, generation: u64, src: String, options: CueOptions) -> CueOutcome {
        {
            let mut slots = self.slots();
            if slots.generation != generation {
                return CueOutcome::Superseded;
            }
            self.silence_graph_cues(&mut slots);
            if let Some(element) = slots.element.take() {
                element.handle.stop();
            }
        }

        let element_options = ElementOptions {
            looping: options.looping,
            volume: self.graph.bus_volume(Bus::Music),
        };
        let started = self.element.play(&src, element_options).await;

        let mut slots = self.slots();
        match started {
            Ok(playback) => {
                if slots.generation != generation {
                    playback.handle.stop();
                    return CueOutcome::Superseded;
                }
                // a graph cue may not have been running when we silenced
                self.silence_graph_cues(&mut slots);
                log::info!("cue: `{src}` playing through the element");
                slots.element = Some(ElementCue {
                    src,
                    handle: playback.handle,
                });
                CueOutcome::Fallback
            }
            Err(e) => {
                log::warn!("cue: element failed for `{src}`: {e}");
                if slots.generation == generation {
                    slots.target = None;
                }
                CueOutcome::Failed
            }
        }
    }

    /// Stop every graph cue immediately.
    fn silence_graph_cues(&self, slots: &mut CueSlots) {
        let ids: Vec<SourceId> = [slots.current.take(), slots.fading.take()]
            .into_iter()
            .flatten()
            .map(|cue| cue.id)
            .collect();
        if ids.is_empty() {
            return;
        }
        let _ = self.graph.with_mixer(|mix| {
            for id in ids {
                mix.stop_now(id);
            }
        });
    }

    /// Fade out and forget the current cue.
    pub fn stop(&self, fade: Duration) {
        let mut slots = self.slots();
        slots.generation += 1;
        slots.target = None;

        if let Some(element) = slots.element.take() {
            element.handle.stop();
        }

        let guard = self.stop_guard;
        let slots = &mut *slots;
        let _ = self.graph.with_mixer(|mix| {
            if let Some(old) = slots.fading.take() {
                let _ = mix.ramp_source(old.id, 0.0, guard);
                let _ = mix.stop_after(old.id, guard);
            }
            if let Some(current) = slots.current.take() {
                let _ = mix.ramp_source(current.id, 0.0, fade);
                let _ = mix.stop_after(current.id, fade + guard);
                slots.fading = Some(current);
            }
        });
        log::debug!("cue: stopped");
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    pub fn state(&self) -> CueState {
        let slots = self.slots();
        if let Some(element) = &slots.element {
            return CueState::Playing {
                src: element.src.clone(),
            };
        }

        let (current, fading) = (slots.current.clone(), slots.fading.clone());
        let playing = |cue: &GraphCue| {
            self.graph
                .with_mixer(|mix| mix.is_playing(cue.id))
                .unwrap_or(false)
        };

        match (current, fading) {
            (Some(to), Some(from)) if playing(&from) => CueState::Transitioning {
                from: from.src,
                to: to.src,
            },
            (Some(current), _) if playing(&current) => CueState::Playing { src: current.src },
            _ => CueState::Idle,
        }
    }

    /// Source of the cue that is (or is becoming) audible.
    pub fn current_src(&self) -> Option<String> {
        let slots = self.slots();
        slots
            .element
            .as_ref()
            .map(|e| e.src.clone())
            .or_else(|| slots.current.as_ref().map(|c| c.src.clone()))
    }

    /// Source most recently requested, including one still decoding.
    pub fn pending_src(&self) -> Option<String> {
        self.slots().target.clone()
    }

    /// Keep the element path in line with the music volume control.
    pub fn set_element_volume(&self, volume: f32) {
        if let Some(element) = &self.slots().element {
            element.handle.set_volume(volume);
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
