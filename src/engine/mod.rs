//! The adaptive audio-cue engine.
//!
//! # Components
//!
//! ```text
//!                      ReadingSession
//!        ┌──────────────┬──────┴───────┬───────────────┐
//!        ▼              ▼              ▼               ▼
//! TriggerScheduler   CueEngine     VoicePlayer     Prefetcher
//!   (fired-set)     (crossfade)   (duck, chain)   (warm cache)
//!        │              │              │               │
//!        └──── sfx ─────┴──────┬───────┴───────────────┘
//!                              ▼
//!                          AudioGraph
//!                (device, MixGraph, decode cache)
//! ```
//!
//! Only the cue engine touches the current music source, only the voice
//! player drives the duck stage, and the prefetcher only fills the decode
//! cache.

pub mod cue;
pub mod fallback;
pub mod graph;
pub mod prefetch;
pub mod scheduler;
pub mod session;
pub mod voice;

pub use cue::{CueEngine, CueOptions, CueOutcome, CueState};
pub use fallback::{FallbackChain, Strategy};
pub use graph::AudioGraph;
pub use prefetch::Prefetcher;
pub use scheduler::{Firing, TriggerScheduler};
pub use session::{ReadingSession, SessionStatus};
pub use voice::{VoiceOptions, VoiceOutcome, VoicePlayer, TEST_TONE_SRC};

#[cfg(test)]
pub(crate) mod testing {
    use std::future::Future;
    use std::sync::Arc;
    use std::time::Duration;

    use super::AudioGraph;
    use crate::audio::{MockFetcher, OfflineDevice};
    use crate::config::AudioConfig;

    /// Graph rate used in tests; low to keep offline renders cheap.
    pub const TEST_RATE: u32 = 8_000;

    pub fn test_audio_config() -> AudioConfig {
        AudioConfig {
            sample_rate: TEST_RATE,
            require_gesture: false,
            volume_ramp_ms: 30,
        }
    }

    pub fn offline_graph_with(device: Arc<OfflineDevice>, fetcher: MockFetcher) -> Arc<AudioGraph> {
        Arc::new(AudioGraph::new(
            device,
            Arc::new(fetcher),
            &test_audio_config(),
        ))
    }

    pub fn offline_graph(fetcher: MockFetcher) -> (Arc<AudioGraph>, Arc<OfflineDevice>) {
        let device = Arc::new(OfflineDevice::new());
        (offline_graph_with(device.clone(), fetcher), device)
    }

    /// Render `duration` of audio in small blocks, yielding between blocks
    /// so spawned engine tasks make progress.
    pub async fn render_for(graph: &AudioGraph, duration: Duration) {
        let total = (duration.as_secs_f64() * graph.sample_rate() as f64) as usize;
        let mut done = 0;
        while done < total {
            let block = (total - done).min(256);
            graph.render_offline(block);
            done += block;
            tokio::task::yield_now().await;
        }
    }

    /// Keep rendering until `fut` completes (panics after ~10 s of audio).
    pub async fn drive<F: Future>(graph: &AudioGraph, fut: F) -> F::Output {
        tokio::pin!(fut);
        for _ in 0..2_000 {
            tokio::select! {
                out = &mut fut => return out,
                _ = tokio::time::sleep(Duration::from_millis(1)) => {
                    graph.render_offline(40);
                }
            }
        }
        panic!("future did not complete while rendering");
    }
}
