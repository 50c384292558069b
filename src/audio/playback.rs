//! A started sound, whichever path it took.

use tokio::sync::oneshot;

use super::element::{ElementHandle, ElementPlayback};
use super::mixer::{SharedMixer, SourceId, Started};

/// How to cut a running sound.
#[derive(Clone)]
pub enum Stopper {
    /// A source in the mixing graph.
    Graph { mixer: SharedMixer, id: SourceId },
    /// A streaming element.
    Element(ElementHandle),
}

impl Stopper {
    /// Stop immediately.  Safe to call on a sound that already ended.
    pub fn stop(&self) {
        match self {
            Stopper::Graph { mixer, id } => {
                if let Ok(mut mix) = mixer.lock() {
                    mix.stop_now(*id);
                }
            }
            Stopper::Element(handle) => handle.stop(),
        }
    }

    pub fn path(&self) -> &'static str {
        match self {
            Stopper::Graph { .. } => "graph",
            Stopper::Element(_) => "element",
        }
    }
}

impl std::fmt::Debug for Stopper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Stopper::Graph { id, .. } => write!(f, "Stopper::Graph({id})"),
            Stopper::Element(_) => f.write_str("Stopper::Element"),
        }
    }
}

/// A sound that has started: a way to stop it and a signal for its end.
#[derive(Debug)]
pub struct Playback {
    pub stopper: Stopper,
    pub ended: oneshot::Receiver<()>,
}

impl Playback {
    pub fn from_graph(mixer: SharedMixer, started: Started) -> Self {
        Self {
            stopper: Stopper::Graph {
                mixer,
                id: started.id,
            },
            ended: started.ended,
        }
    }
}

impl From<ElementPlayback> for Playback {
    fn from(playback: ElementPlayback) -> Self {
        Self {
            stopper: Stopper::Element(playback.handle),
            ended: playback.ended,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::mixer::{Bus, MixGraph};
    use crate::audio::tone::Tone;

    #[test]
    fn graph_stopper_ends_source() {
        let mixer = MixGraph::shared(48_000);
        let started = mixer.lock().unwrap().start_tone(Tone::DIAGNOSTIC, Bus::Voice);
        let mut playback = Playback::from_graph(mixer.clone(), started);

        playback.stopper.stop();
        assert!(playback.ended.try_recv().is_ok());
        assert!(mixer.lock().unwrap().sources_on(Bus::Voice).is_empty());
        // second stop is harmless
        playback.stopper.stop();
    }

    #[test]
    fn element_stopper_flags_handle() {
        let handle = ElementHandle::new(1.0);
        let (_tx, rx) = oneshot::channel();
        let playback: Playback = ElementPlayback {
            handle: handle.clone(),
            ended: rx,
        }
        .into();
        assert_eq!(playback.stopper.path(), "element");
        playback.stopper.stop();
        assert!(handle.is_stopped());
    }
}
