//! Plain streaming playback, independent of the mixing graph.
//!
//! When the graph path is unavailable (decode failed, context not running)
//! the engine falls back to a [`MediaElement`]: play a locator directly with
//! its own volume, no buses, no ramps.
//!
//! [`StreamingElement`] fetches the bytes, then decodes progressively on a
//! dedicated thread that also owns a private `cpal` stream, so playback
//! starts before the whole source is decoded.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use async_trait::async_trait;
use cpal::traits::StreamTrait;
use tokio::sync::oneshot;

use crate::config::clamp_level;

use super::decode::StreamDecoder;
use super::device::open_output;
use super::error::AudioError;
use super::fetch::SourceFetcher;
use super::resample::resample_stereo;

// ---------------------------------------------------------------------------
// Options / handles
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ElementOptions {
    pub looping: bool,
    /// Linear volume `0.0..=1.0`.
    pub volume: f32,
}

impl Default for ElementOptions {
    fn default() -> Self {
        Self {
            looping: false,
            volume: 1.0,
        }
    }
}

#[derive(Debug)]
struct ElementControl {
    stopped: AtomicBool,
    volume: AtomicU32,
}

/// Shared control over one element playback.  Cheap to clone.
#[derive(Debug, Clone)]
pub struct ElementHandle {
    control: Arc<ElementControl>,
}

impl ElementHandle {
    pub fn new(volume: f32) -> Self {
        Self {
            control: Arc::new(ElementControl {
                stopped: AtomicBool::new(false),
                volume: AtomicU32::new(clamp_level(volume).to_bits()),
            }),
        }
    }

    /// Stop playback.  Idempotent.
    pub fn stop(&self) {
        self.control.stopped.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.control.stopped.load(Ordering::SeqCst)
    }

    pub fn set_volume(&self, volume: f32) {
        self.control
            .volume
            .store(clamp_level(volume).to_bits(), Ordering::SeqCst);
    }

    pub fn volume(&self) -> f32 {
        f32::from_bits(self.control.volume.load(Ordering::SeqCst))
    }
}

/// A started element.  `ended` resolves when playback finishes or is stopped.
#[derive(Debug)]
pub struct ElementPlayback {
    pub handle: ElementHandle,
    pub ended: oneshot::Receiver<()>,
}

// ---------------------------------------------------------------------------
// MediaElement trait
// ---------------------------------------------------------------------------

/// Fallback playback path.
#[async_trait]
pub trait MediaElement: Send + Sync {
    /// Start playing `src`.  Resolves once playback has actually begun.
    async fn play(&self, src: &str, options: ElementOptions)
        -> Result<ElementPlayback, AudioError>;

    /// Play already-synthesized interleaved stereo samples.
    async fn play_pcm(
        &self,
        samples: Vec<f32>,
        sample_rate: u32,
        volume: f32,
    ) -> Result<ElementPlayback, AudioError>;
}

// ---------------------------------------------------------------------------
// StreamingElement
// ---------------------------------------------------------------------------

/// Queue high-water mark in samples (~0.5 s of 48 kHz stereo).
const QUEUE_HIGH_WATER: usize = 48_000;

enum Feed {
    Encoded {
        src: String,
        bytes: Vec<u8>,
        looping: bool,
    },
    Pcm {
        samples: Vec<f32>,
        sample_rate: u32,
    },
}

/// Progressive decoder feeding a private output stream.
pub struct StreamingElement {
    fetcher: Arc<dyn SourceFetcher>,
}

impl StreamingElement {
    pub fn new(fetcher: Arc<dyn SourceFetcher>) -> Self {
        Self { fetcher }
    }

    async fn start(&self, feed: Feed, volume: f32) -> Result<ElementPlayback, AudioError> {
        let handle = ElementHandle::new(volume);
        let (ready_tx, ready_rx) = oneshot::channel();
        let (ended_tx, ended_rx) = oneshot::channel();

        let control = handle.clone();
        thread::Builder::new()
            .name("tale-audio-element".into())
            .spawn(move || run_element(feed, control, ready_tx, ended_tx))
            .map_err(|e| AudioError::Element(format!("cannot spawn element thread: {e}")))?;

        ready_rx
            .await
            .map_err(|_| AudioError::Element("element thread exited before starting".into()))??;

        Ok(ElementPlayback {
            handle,
            ended: ended_rx,
        })
    }
}

#[async_trait]
impl MediaElement for StreamingElement {
    async fn play(
        &self,
        src: &str,
        options: ElementOptions,
    ) -> Result<ElementPlayback, AudioError> {
        let bytes = self
            .fetcher
            .fetch(src)
            .await
            .map_err(|e| AudioError::Element(e.to_string()))?;

        let feed = Feed::Encoded {
            src: src.to_string(),
            bytes,
            looping: options.looping,
        };
        self.start(feed, options.volume).await
    }

    async fn play_pcm(
        &self,
        samples: Vec<f32>,
        sample_rate: u32,
        volume: f32,
    ) -> Result<ElementPlayback, AudioError> {
        self.start(
            Feed::Pcm {
                samples,
                sample_rate,
            },
            volume,
        )
        .await
    }
}

/// Element thread: owns the stream, decodes into the queue, reports start
/// and end.
fn run_element(
    feed: Feed,
    control: ElementHandle,
    ready: oneshot::Sender<Result<(), AudioError>>,
    ended: oneshot::Sender<()>,
) {
    let queue: Arc<Mutex<VecDeque<f32>>> = Arc::new(Mutex::new(VecDeque::new()));

    let callback_queue = queue.clone();
    let callback_control = control.clone();
    let opened = open_output(None, move |stereo: &mut [f32]| {
        let volume = callback_control.volume();
        match callback_queue.try_lock() {
            Ok(mut q) => {
                for s in stereo.iter_mut() {
                    *s = q.pop_front().unwrap_or(0.0) * volume;
                }
            }
            Err(_) => stereo.fill(0.0),
        }
    });

    let (stream, rate) = match opened {
        Ok(opened) => opened,
        Err(e) => {
            let _ = ready.send(Err(AudioError::Element(e.to_string())));
            return;
        }
    };

    // Validate the source before reporting success.
    let mut source = match ElementSource::new(feed, rate) {
        Ok(source) => source,
        Err(e) => {
            let _ = ready.send(Err(e));
            return;
        }
    };

    if let Err(e) = stream.play() {
        let _ = ready.send(Err(AudioError::Element(e.to_string())));
        return;
    }
    let _ = ready.send(Ok(()));

    let mut exhausted = false;
    while !control.is_stopped() {
        let queued = queue.lock().map(|q| q.len()).unwrap_or(0);

        if exhausted {
            if queued == 0 {
                break;
            }
            thread::sleep(Duration::from_millis(10));
            continue;
        }

        if queued >= QUEUE_HIGH_WATER {
            thread::sleep(Duration::from_millis(10));
            continue;
        }

        match source.next_chunk() {
            Ok(Some(chunk)) => {
                if let Ok(mut q) = queue.lock() {
                    q.extend(chunk);
                }
            }
            Ok(None) => exhausted = true,
            Err(e) => {
                log::warn!("element: {e}");
                exhausted = true;
            }
        }
    }

    drop(stream);
    let _ = ended.send(());
}

/// What the element thread reads from: a progressive decoder (restarted on
/// loop) or a fixed PCM block.
enum ElementSource {
    Encoded {
        src: String,
        bytes: Vec<u8>,
        looping: bool,
        decoder: StreamDecoder,
        output_rate: u32,
    },
    Pcm(Option<Vec<f32>>),
}

impl ElementSource {
    fn new(feed: Feed, output_rate: u32) -> Result<Self, AudioError> {
        match feed {
            Feed::Encoded {
                src,
                bytes,
                looping,
            } => {
                let decoder = StreamDecoder::open(&src, bytes.clone())
                    .map_err(|e| AudioError::Element(e.to_string()))?;
                Ok(ElementSource::Encoded {
                    src,
                    bytes,
                    looping,
                    decoder,
                    output_rate,
                })
            }
            Feed::Pcm {
                samples,
                sample_rate,
            } => Ok(ElementSource::Pcm(Some(resample_stereo(
                &samples,
                sample_rate,
                output_rate,
            )))),
        }
    }

    fn next_chunk(&mut self) -> Result<Option<Vec<f32>>, AudioError> {
        match self {
            ElementSource::Pcm(samples) => Ok(samples.take()),
            ElementSource::Encoded {
                src,
                bytes,
                looping,
                decoder,
                output_rate,
            } => {
                let mut restarted = false;
                loop {
                    match decoder.next_chunk()? {
                        Some(chunk) => {
                            let rate = decoder.sample_rate();
                            return Ok(Some(resample_stereo(&chunk, rate, *output_rate)));
                        }
                        // a restart that yields nothing means there is no audio to loop
                        None if *looping && !restarted => {
                            *decoder = StreamDecoder::open(src, bytes.clone())?;
                            restarted = true;
                        }
                        None => return Ok(None),
                    }
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// MockElement (test only)
// ---------------------------------------------------------------------------

#[cfg(test)]
pub use mock::{ElementCall, MockElement};


// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::decode::test_wav;

    #[test]
    fn handle_clamps_volume_and_stops() {
        let handle = ElementHandle::new(1.7);
        assert_eq!(handle.volume(), 1.0);
        handle.set_volume(0.25);
        assert_eq!(handle.volume(), 0.25);
        handle.set_volume(f32::NAN);
        assert_eq!(handle.volume(), 0.0);

        let other = handle.clone();
        assert!(!other.is_stopped());
        handle.stop();
        assert!(other.is_stopped());
    }

    #[test]
    fn pcm_source_yields_once() {
        let mut source = ElementSource::new(
            Feed::Pcm {
                samples: vec![0.1; 200],
                sample_rate: 48_000,
            },
            48_000,
        )
        .unwrap();
        assert_eq!(source.next_chunk().unwrap().map(|c| c.len()), Some(200));
        assert!(source.next_chunk().unwrap().is_none());
    }

    #[test]
    fn encoded_source_resamples_to_output_rate() {
        let mut source = ElementSource::new(
            Feed::Encoded {
                src: "blip.wav".into(),
                bytes: test_wav(1_600, 16_000),
                looping: false,
            },
            48_000,
        )
        .unwrap();

        let mut frames = 0;
        while let Some(chunk) = source.next_chunk().unwrap() {
            frames += chunk.len() / 2;
        }
        assert!(frames.abs_diff(4_800) <= 16, "got {frames} frames");
    }

    #[test]
    fn looping_source_restarts() {
        let mut source = ElementSource::new(
            Feed::Encoded {
                src: "blip.wav".into(),
                bytes: test_wav(200, 16_000),
                looping: true,
            },
            16_000,
        )
        .unwrap();

        let mut frames = 0;
        for _ in 0..50 {
            frames += source.next_chunk().unwrap().map_or(0, |c| c.len() / 2);
        }
        assert!(frames > 200);
    }

    #[test]
    fn undecodable_source_is_element_error() {
        let result = ElementSource::new(
            Feed::Encoded {
                src: "bad.mp3".into(),
                bytes: b"garbage".to_vec(),
                looping: false,
            },
            48_000,
        );
        assert!(matches!(result, Err(AudioError::Element(_))));
    }

    #[tokio::test]
    async fn mock_ends_when_stopped() {
        let element = MockElement::new();
        let playback = element
            .play("music/a.ogg", ElementOptions::default())
            .await
            .unwrap();
        playback.handle.stop();
        tokio::time::timeout(Duration::from_secs(1), playback.ended)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(element.played_srcs(), vec!["music/a.ogg".to_string()]);
    }

    #[tokio::test]
    async fn failing_mock_refuses() {
        let element = MockElement::failing();
        assert!(element.play_pcm(vec![0.0; 8], 48_000, 1.0).await.is_err());
        assert!(element.calls().is_empty());
    }
}
