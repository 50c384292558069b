//! Platform output context.
//!
//! [`OutputDevice`] is the seam between the engine and the speakers.  A
//! device is opened once with the shared [`MixGraph`](super::MixGraph) and
//! from then on pulls frames from it on its own schedule.
//!
//! * [`CpalDevice`]: the system default output through `cpal`.
//! * [`OfflineDevice`]: headless; frames are rendered only on demand.
//!
//! # Threading
//!
//! `cpal::Stream` is not `Send` on every platform, so [`CpalDevice`] keeps
//! the stream on a dedicated worker thread and talks to it over a command
//! channel.  The output callback uses `try_lock` on the mixer and writes
//! silence when the engine holds the lock.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{mpsc, Mutex};
use std::thread;

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};

use super::error::AudioError;
use super::mixer::SharedMixer;

// ---------------------------------------------------------------------------
// ContextState
// ---------------------------------------------------------------------------

/// Lifecycle of an output context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextState {
    /// Never opened.
    Idle,
    /// Opened but not producing sound (waiting on a user gesture).
    Suspended,
    Running,
    Closed,
}

impl ContextState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContextState::Idle => "idle",
            ContextState::Suspended => "suspended",
            ContextState::Running => "running",
            ContextState::Closed => "closed",
        }
    }
}

// ---------------------------------------------------------------------------
// OutputDevice trait
// ---------------------------------------------------------------------------

/// An output context the mixing graph renders into.
///
/// All methods are blocking; async callers go through
/// `tokio::task::spawn_blocking`.
pub trait OutputDevice: Send + Sync {
    /// Open output near `requested_rate`, rendering from `mixer`.
    ///
    /// Returns the sample rate the device actually runs at.  Opening an
    /// already open device returns its current rate.
    fn open(&self, requested_rate: u32, mixer: SharedMixer) -> Result<u32, AudioError>;

    /// Move a suspended context to running.  No-op when already running.
    fn resume(&self) -> Result<(), AudioError>;

    fn state(&self) -> ContextState;

    /// Stop output and release the device.  Idempotent.
    fn close(&self);
}

// ---------------------------------------------------------------------------
// CpalDevice
// ---------------------------------------------------------------------------

enum Command {
    Open {
        rate: u32,
        mixer: SharedMixer,
        reply: mpsc::Sender<Result<u32, AudioError>>,
    },
    Resume {
        reply: mpsc::Sender<Result<(), AudioError>>,
    },
    Close,
}

/// System default output device driven through `cpal`.
///
/// # Example
///
/// ```rust,no_run
/// use tale_audio::audio::{CpalDevice, MixGraph, OutputDevice};
///
/// let mixer = MixGraph::shared(48_000);
/// let device = CpalDevice::new(false);
/// let rate = device.open(48_000, mixer.clone()).unwrap();
/// mixer.lock().unwrap().set_sample_rate(rate);
/// ```
pub struct CpalDevice {
    commands: Mutex<Option<mpsc::Sender<Command>>>,
    state: std::sync::Arc<Mutex<ContextState>>,
    start_suspended: bool,
}

impl CpalDevice {
    /// `start_suspended` models platforms that refuse sound until the user
    /// interacts: the stream is built paused and needs [`OutputDevice::resume`].
    pub fn new(start_suspended: bool) -> Self {
        Self {
            commands: Mutex::new(None),
            state: std::sync::Arc::new(Mutex::new(ContextState::Idle)),
            start_suspended,
        }
    }

    fn send(&self, cmd: Command) -> Result<(), AudioError> {
        let mut guard = self
            .commands
            .lock()
            .map_err(|_| AudioError::Device("device command lock poisoned".into()))?;

        if guard.is_none() {
            let (tx, rx) = mpsc::channel();
            let state = self.state.clone();
            let start_suspended = self.start_suspended;
            thread::Builder::new()
                .name("tale-audio-output".into())
                .spawn(move || run_worker(rx, state, start_suspended))
                .map_err(|e| AudioError::Device(format!("cannot spawn output thread: {e}")))?;
            *guard = Some(tx);
        }

        guard
            .as_ref()
            .ok_or(AudioError::NotStarted)?
            .send(cmd)
            .map_err(|_| AudioError::Device("output thread has exited".into()))
    }
}

impl OutputDevice for CpalDevice {
    fn open(&self, requested_rate: u32, mixer: SharedMixer) -> Result<u32, AudioError> {
        let (reply, rx) = mpsc::channel();
        self.send(Command::Open {
            rate: requested_rate,
            mixer,
            reply,
        })?;
        rx.recv()
            .map_err(|_| AudioError::Device("output thread dropped the open request".into()))?
    }

    fn resume(&self) -> Result<(), AudioError> {
        let (reply, rx) = mpsc::channel();
        self.send(Command::Resume { reply })?;
        rx.recv()
            .map_err(|_| AudioError::Device("output thread dropped the resume request".into()))?
    }

    fn state(&self) -> ContextState {
        self.state
            .lock()
            .map(|s| *s)
            .unwrap_or(ContextState::Closed)
    }

    fn close(&self) {
        if let Ok(mut guard) = self.commands.lock() {
            if let Some(tx) = guard.take() {
                let _ = tx.send(Command::Close);
            }
        }
        set_state(&self.state, ContextState::Closed);
    }
}

impl Drop for CpalDevice {
    fn drop(&mut self) {
        self.close();
    }
}

fn set_state(state: &Mutex<ContextState>, next: ContextState) {
    if let Ok(mut s) = state.lock() {
        *s = next;
    }
}

struct OpenStream {
    stream: cpal::Stream,
    rate: u32,
}

fn run_worker(
    rx: mpsc::Receiver<Command>,
    state: std::sync::Arc<Mutex<ContextState>>,
    start_suspended: bool,
) {
    let mut current: Option<OpenStream> = None;

    while let Ok(cmd) = rx.recv() {
        match cmd {
            Command::Open { rate, mixer, reply } => {
                if let Some(open) = &current {
                    let _ = reply.send(Ok(open.rate));
                    continue;
                }
                let result = build_stream(rate, mixer).and_then(|open| {
                    if start_suspended {
                        // some hosts start streams on build
                        let _ = open.stream.pause();
                        set_state(&state, ContextState::Suspended);
                    } else {
                        open.stream
                            .play()
                            .map_err(|e| AudioError::Policy(e.to_string()))?;
                        set_state(&state, ContextState::Running);
                    }
                    let rate = open.rate;
                    current = Some(open);
                    Ok(rate)
                });
                if let Err(e) = &result {
                    log::warn!("output: open failed: {e}");
                }
                let _ = reply.send(result);
            }
            Command::Resume { reply } => {
                let result = match &current {
                    Some(open) => open
                        .stream
                        .play()
                        .map(|_| set_state(&state, ContextState::Running))
                        .map_err(|e| AudioError::Policy(e.to_string())),
                    None => Err(AudioError::NotStarted),
                };
                let _ = reply.send(result);
            }
            Command::Close => break,
        }
    }

    if current.take().is_some() {
        log::info!("output: stream closed");
    }
    set_state(&state, ContextState::Closed);
}

fn build_stream(requested_rate: u32, mixer: SharedMixer) -> Result<OpenStream, AudioError> {
    let (stream, rate) = open_output(Some(requested_rate), move |stereo: &mut [f32]| {
        match mixer.try_lock() {
            Ok(mut mix) => mix.render(stereo),
            // engine is editing the graph; skip this block
            Err(_) => stereo.fill(0.0),
        }
    })?;
    Ok(OpenStream { stream, rate })
}

/// Build a (not yet playing) stream on the default output device.
///
/// `render` fills interleaved stereo `f32`; it is spread onto however many
/// channels the device has.  `requested_rate` is used when the device
/// supports it natively, otherwise the device default stands.  Returns the
/// stream and its sample rate.
pub(crate) fn open_output<F>(
    requested_rate: Option<u32>,
    render: F,
) -> Result<(cpal::Stream, u32), AudioError>
where
    F: FnMut(&mut [f32]) + Send + 'static,
{
    let host = cpal::default_host();
    let device = host
        .default_output_device()
        .ok_or_else(|| AudioError::Device("no output device on the default host".into()))?;

    let supported = device
        .default_output_config()
        .map_err(|e| AudioError::Device(e.to_string()))?;
    let sample_format = supported.sample_format();
    let mut config: cpal::StreamConfig = supported.config();

    if let Some(requested) = requested_rate {
        let native = device
            .supported_output_configs()
            .map(|mut ranges| {
                ranges.any(|r| {
                    r.channels() == config.channels
                        && r.sample_format() == sample_format
                        && r.min_sample_rate().0 <= requested
                        && requested <= r.max_sample_rate().0
                })
            })
            .unwrap_or(false);
        if native {
            config.sample_rate = cpal::SampleRate(requested);
        }
    }

    let rate = config.sample_rate.0;
    log::info!(
        "output: {} @ {rate} Hz, {} ch, {sample_format:?}",
        device.name().unwrap_or_else(|_| "unknown device".into()),
        config.channels
    );

    let stream = match sample_format {
        cpal::SampleFormat::F32 => build_typed::<f32, F>(&device, &config, render),
        cpal::SampleFormat::I16 => build_typed::<i16, F>(&device, &config, render),
        cpal::SampleFormat::U16 => build_typed::<u16, F>(&device, &config, render),
        other => Err(AudioError::Device(format!(
            "unsupported output sample format {other:?}"
        ))),
    }?;

    Ok((stream, rate))
}

fn build_typed<T, F>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    mut render: F,
) -> Result<cpal::Stream, AudioError>
where
    T: cpal::SizedSample + cpal::FromSample<f32>,
    F: FnMut(&mut [f32]) + Send + 'static,
{
    let channels = (config.channels as usize).max(1);
    let mut stereo: Vec<f32> = Vec::new();

    device
        .build_output_stream(
            config,
            move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
                let frames = data.len() / channels;
                stereo.resize(frames * 2, 0.0);
                render(&mut stereo);
                for (frame, out) in data.chunks_mut(channels).enumerate() {
                    let (l, r) = (stereo[frame * 2], stereo[frame * 2 + 1]);
                    for (ch, sample) in out.iter_mut().enumerate() {
                        *sample = T::from_sample(spread_stereo(l, r, channels, ch));
                    }
                }
            },
            |err: cpal::StreamError| {
                log::error!("cpal output stream error: {err}");
            },
            None,
        )
        .map_err(|e| AudioError::Device(e.to_string()))
}

/// Value for device channel `ch` of `channels` given a stereo frame.
///
/// Mono devices get the average; extra channels beyond L/R stay silent.
pub(crate) fn spread_stereo(l: f32, r: f32, channels: usize, ch: usize) -> f32 {
    match (channels, ch) {
        (1, _) => (l + r) * 0.5,
        (_, 0) => l,
        (_, 1) => r,
        _ => 0.0,
    }
}

// ---------------------------------------------------------------------------
// OfflineDevice
// ---------------------------------------------------------------------------

/// Headless output: nothing is played, frames are pulled with
/// [`OfflineDevice::render`].
///
/// Used by `--offline` runs and tests.  It can be told to refuse opening to
/// simulate a platform that blocks audio until a user gesture.
pub struct OfflineDevice {
    state: Mutex<ContextState>,
    mixer: Mutex<Option<SharedMixer>>,
    refuse: AtomicBool,
    start_suspended: bool,
    opens: AtomicUsize,
}

impl Default for OfflineDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl OfflineDevice {
    /// Opens straight into `Running`.
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ContextState::Idle),
            mixer: Mutex::new(None),
            refuse: AtomicBool::new(false),
            start_suspended: false,
            opens: AtomicUsize::new(0),
        }
    }

    /// Opens into `Suspended`; needs a resume.
    pub fn suspended() -> Self {
        Self {
            start_suspended: true,
            ..Self::new()
        }
    }

    /// Refuses to open or resume until [`set_refuse(false)`](Self::set_refuse).
    pub fn refusing() -> Self {
        let device = Self::new();
        device.set_refuse(true);
        device
    }

    pub fn set_refuse(&self, refuse: bool) {
        self.refuse.store(refuse, Ordering::SeqCst);
    }

    /// Number of successful opens.
    pub fn open_count(&self) -> usize {
        self.opens.load(Ordering::SeqCst)
    }

    /// Render `frames` stereo frames from the mixer.  Silence unless running.
    pub fn render(&self, frames: usize) -> Vec<f32> {
        let mut out = vec![0.0; frames * 2];
        if self.state() != ContextState::Running {
            return out;
        }
        let mixer = self.mixer.lock().ok().and_then(|m| m.clone());
        if let Some(mixer) = mixer {
            if let Ok(mut mix) = mixer.lock() {
                mix.render(&mut out);
            }
        }
        out
    }

    fn policy_check(&self) -> Result<(), AudioError> {
        if self.refuse.load(Ordering::SeqCst) {
            Err(AudioError::Policy("output blocked until a user gesture".into()))
        } else {
            Ok(())
        }
    }
}

impl OutputDevice for OfflineDevice {
    fn open(&self, requested_rate: u32, mixer: SharedMixer) -> Result<u32, AudioError> {
        self.policy_check()?;
        let mut state = self
            .state
            .lock()
            .map_err(|_| AudioError::Device("offline state lock poisoned".into()))?;
        if matches!(*state, ContextState::Suspended | ContextState::Running) {
            return Ok(requested_rate);
        }
        if let Ok(mut slot) = self.mixer.lock() {
            *slot = Some(mixer);
        }
        *state = if self.start_suspended {
            ContextState::Suspended
        } else {
            ContextState::Running
        };
        self.opens.fetch_add(1, Ordering::SeqCst);
        Ok(requested_rate)
    }

    fn resume(&self) -> Result<(), AudioError> {
        self.policy_check()?;
        let mut state = self
            .state
            .lock()
            .map_err(|_| AudioError::Device("offline state lock poisoned".into()))?;
        match *state {
            ContextState::Suspended | ContextState::Running => {
                *state = ContextState::Running;
                Ok(())
            }
            _ => Err(AudioError::NotStarted),
        }
    }

    fn state(&self) -> ContextState {
        self.state
            .lock()
            .map(|s| *s)
            .unwrap_or(ContextState::Closed)
    }

    fn close(&self) {
        if let Ok(mut slot) = self.mixer.lock() {
            slot.take();
        }
        set_state(&self.state, ContextState::Closed);
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::mixer::{Bus, MixGraph};
    use crate::audio::tone::Tone;

    #[test]
    fn offline_opens_running() {
        let device = OfflineDevice::new();
        assert_eq!(device.state(), ContextState::Idle);
        assert_eq!(device.open(48_000, MixGraph::shared(48_000)).unwrap(), 48_000);
        assert_eq!(device.state(), ContextState::Running);
        assert_eq!(device.open_count(), 1);
    }

    #[test]
    fn offline_suspended_needs_resume() {
        let device = OfflineDevice::suspended();
        device.open(48_000, MixGraph::shared(48_000)).unwrap();
        assert_eq!(device.state(), ContextState::Suspended);
        device.resume().unwrap();
        assert_eq!(device.state(), ContextState::Running);
    }

    #[test]
    fn refusing_device_reports_policy_error() {
        let device = OfflineDevice::refusing();
        let err = device.open(48_000, MixGraph::shared(48_000)).unwrap_err();
        assert!(matches!(err, AudioError::Policy(_)));
        assert_eq!(device.state(), ContextState::Idle);

        device.set_refuse(false);
        assert!(device.open(48_000, MixGraph::shared(48_000)).is_ok());
    }

    #[test]
    fn resume_before_open_is_not_started() {
        let device = OfflineDevice::new();
        assert_eq!(device.resume(), Err(AudioError::NotStarted));
    }

    #[test]
    fn render_pulls_from_mixer_only_when_running() {
        let mixer = MixGraph::shared(8_000);
        mixer.lock().unwrap().start_tone(Tone::DIAGNOSTIC, Bus::Sfx);

        let device = OfflineDevice::suspended();
        device.open(8_000, mixer.clone()).unwrap();
        assert!(device.render(400).iter().all(|s| *s == 0.0));
        assert_eq!(mixer.lock().unwrap().now(), 0);

        device.resume().unwrap();
        let out = device.render(400);
        assert!(out.iter().any(|s| s.abs() > 0.01));
        assert_eq!(mixer.lock().unwrap().now(), 400);
    }

    #[test]
    fn close_is_idempotent() {
        let device = OfflineDevice::new();
        device.open(48_000, MixGraph::shared(48_000)).unwrap();
        device.close();
        device.close();
        assert_eq!(device.state(), ContextState::Closed);
    }

    #[test]
    fn stereo_spreads_over_device_channels() {
        assert!((spread_stereo(0.2, 0.4, 1, 0) - 0.3).abs() < 1e-6);
        assert_eq!(spread_stereo(0.2, 0.4, 2, 1), 0.4);
        assert_eq!(spread_stereo(0.2, 0.4, 6, 0), 0.2);
        assert_eq!(spread_stereo(0.2, 0.4, 6, 4), 0.0);
    }

    #[test]
    fn devices_are_object_safe() {
        let _: Box<dyn OutputDevice> = Box::new(OfflineDevice::new());
        let _: Box<dyn OutputDevice> = Box::new(CpalDevice::new(true));
    }
}
