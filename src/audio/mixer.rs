//! Software mixing graph.
//!
//! ```text
//!  source ─ gain ─┐
//!  source ─ gain ─┼─▶ music bus ─▶ duck ─┐
//!                 │                      │
//!  source ─ gain ─┼─▶ sfx bus ───────────┼─▶ master ─▶ output
//!                 │                      │
//!  source ─ gain ─┴─▶ voice bus ─────────┘
//! ```
//!
//! Every gain is a [`GainParam`]: a value plus an optional linear ramp laid
//! out on the graph's frame clock.  Ramps and stops are scheduled in frames,
//! so a crossfade is sample-accurate regardless of when the output callback
//! happens to run.  Starting a new ramp always cancels the old one and
//! continues from the value reached at that instant, so gains never jump.
//!
//! The graph renders interleaved stereo `f32` at its sample rate.  It is
//! shared as [`SharedMixer`] between the engine (which edits it) and the
//! output callback (which renders it); lock it for short sections only and
//! never across an `.await`.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::oneshot;

use super::decode::SharedBuffer;
use super::error::AudioError;
use super::tone::Tone;
use crate::config::clamp_level;

/// Thread-safe handle to the mixing graph.
pub type SharedMixer = Arc<Mutex<MixGraph>>;

// ---------------------------------------------------------------------------
// Bus
// ---------------------------------------------------------------------------

/// Named mixing channel summed into the master output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Bus {
    Music,
    Sfx,
    Voice,
}

impl Bus {
    pub const ALL: [Bus; 3] = [Bus::Music, Bus::Sfx, Bus::Voice];

    fn index(self) -> usize {
        match self {
            Bus::Music => 0,
            Bus::Sfx => 1,
            Bus::Voice => 2,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Bus::Music => "music",
            Bus::Sfx => "sfx",
            Bus::Voice => "voice",
        }
    }
}

// ---------------------------------------------------------------------------
// GainParam
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq)]
struct Ramp {
    from: f32,
    to: f32,
    start: u64,
    end: u64,
}

/// A gain value with an optional linear ramp on the frame clock.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GainParam {
    /// Final value (the ramp target while a ramp is scheduled).
    value: f32,
    ramp: Option<Ramp>,
}

impl GainParam {
    pub fn new(value: f32) -> Self {
        Self { value, ramp: None }
    }

    /// Gain at `frame`.
    pub fn value_at(&self, frame: u64) -> f32 {
        match self.ramp {
            None => self.value,
            Some(r) if frame >= r.end => r.to,
            Some(r) if frame <= r.start => r.from,
            Some(r) => {
                let t = (frame - r.start) as f32 / (r.end - r.start) as f32;
                r.from + (r.to - r.from) * t
            }
        }
    }

    /// Value the gain is heading to.
    pub fn target(&self) -> f32 {
        self.value
    }

    pub fn is_ramping(&self, now: u64) -> bool {
        self.ramp.is_some_and(|r| now < r.end)
    }

    /// Cancel any scheduled ramp, hold the value reached at `now`, and ramp
    /// from there to `target` over `frames`.  `frames == 0` sets immediately.
    pub fn ramp_to(&mut self, target: f32, now: u64, frames: u64) {
        let current = self.value_at(now);
        self.value = target;
        self.ramp = (frames > 0).then_some(Ramp {
            from: current,
            to: target,
            start: now,
            end: now + frames,
        });
    }

    fn settle(&mut self, now: u64) {
        if self.ramp.is_some_and(|r| now >= r.end) {
            self.ramp = None;
        }
    }
}

// ---------------------------------------------------------------------------
// Sources
// ---------------------------------------------------------------------------

/// Identifier of a playing source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SourceId(u64);

impl fmt::Display for SourceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Returned by every `start_*` call.  `ended` resolves when the source
/// finishes, is stopped, or the graph is cleared.  Dropping it is fine.
#[derive(Debug)]
pub struct Started {
    pub id: SourceId,
    pub ended: oneshot::Receiver<()>,
}

enum SourceKind {
    Buffer {
        buffer: SharedBuffer,
        /// Read position in source frames.
        cursor: f64,
        /// Source frames advanced per output frame.
        step: f64,
        looping: bool,
    },
    Tone {
        tone: Tone,
        frame: u64,
    },
}

impl SourceKind {
    /// Next stereo frame, or `None` once the source has run out.
    fn next_frame(&mut self, output_rate: u32) -> Option<(f32, f32)> {
        match self {
            SourceKind::Buffer {
                buffer,
                cursor,
                step,
                looping,
            } => {
                let frames = buffer.frames();
                if frames == 0 {
                    return None;
                }
                if *cursor >= frames as f64 {
                    if !*looping {
                        return None;
                    }
                    *cursor %= frames as f64;
                }

                let idx = *cursor as usize;
                let frac = (*cursor - idx as f64) as f32;
                let next = if idx + 1 < frames {
                    Some(idx + 1)
                } else if *looping {
                    Some(0)
                } else {
                    None
                };

                let s = &buffer.samples;
                let (l0, r0) = (s[idx * 2], s[idx * 2 + 1]);
                let (l, r) = match next {
                    Some(n) => (
                        l0 + (s[n * 2] - l0) * frac,
                        r0 + (s[n * 2 + 1] - r0) * frac,
                    ),
                    None => (l0, r0),
                };

                *cursor += *step;
                Some((l, r))
            }
            SourceKind::Tone { tone, frame } => {
                if *frame >= tone.frames(output_rate) {
                    return None;
                }
                let v = tone.sample_at(*frame, output_rate);
                *frame += 1;
                Some((v, v))
            }
        }
    }

    fn retune(&mut self, output_rate: u32) {
        if let SourceKind::Buffer { buffer, step, .. } = self {
            *step = buffer.sample_rate as f64 / output_rate.max(1) as f64;
        }
    }
}

struct SourceNode {
    bus: Bus,
    gain: GainParam,
    kind: SourceKind,
    stop_at: Option<u64>,
    ended: Option<oneshot::Sender<()>>,
}

// ---------------------------------------------------------------------------
// MixGraph
// ---------------------------------------------------------------------------

/// The mixing graph: master gain, three bus gains, a music duck stage and
/// the set of playing sources.
pub struct MixGraph {
    sample_rate: u32,
    now: u64,
    master: GainParam,
    buses: [GainParam; 3],
    duck: GainParam,
    sources: HashMap<SourceId, SourceNode>,
    next_id: u64,
}

impl MixGraph {
    pub fn new(sample_rate: u32) -> Self {
        Self {
            sample_rate: sample_rate.max(1),
            now: 0,
            master: GainParam::new(1.0),
            buses: [GainParam::new(1.0); 3],
            duck: GainParam::new(1.0),
            sources: HashMap::new(),
            next_id: 1,
        }
    }

    pub fn shared(sample_rate: u32) -> SharedMixer {
        Arc::new(Mutex::new(Self::new(sample_rate)))
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Change the output rate (after the device reports what it opened).
    pub fn set_sample_rate(&mut self, sample_rate: u32) {
        self.sample_rate = sample_rate.max(1);
        for node in self.sources.values_mut() {
            node.kind.retune(self.sample_rate);
        }
    }

    /// Frames rendered so far.
    pub fn now(&self) -> u64 {
        self.now
    }

    pub fn frames_for(&self, duration: Duration) -> u64 {
        (duration.as_secs_f64() * self.sample_rate as f64).round() as u64
    }

    // -----------------------------------------------------------------------
    // Bus / master / duck gains
    // -----------------------------------------------------------------------

    pub fn bus_gain(&self, bus: Bus) -> f32 {
        self.buses[bus.index()].value_at(self.now)
    }

    /// Target the bus is heading to (equals `bus_gain` once settled).
    pub fn bus_target(&self, bus: Bus) -> f32 {
        self.buses[bus.index()].target()
    }

    pub fn set_bus_gain(&mut self, bus: Bus, level: f32, ramp: Duration) {
        let frames = self.frames_for(ramp);
        self.buses[bus.index()].ramp_to(clamp_level(level), self.now, frames);
    }

    pub fn master_gain(&self) -> f32 {
        self.master.value_at(self.now)
    }

    pub fn set_master_gain(&mut self, level: f32, ramp: Duration) {
        let frames = self.frames_for(ramp);
        self.master.ramp_to(clamp_level(level), self.now, frames);
    }

    /// Current duck multiplier applied after the music bus.
    pub fn duck_gain(&self) -> f32 {
        self.duck.value_at(self.now)
    }

    pub fn ramp_duck(&mut self, level: f32, ramp: Duration) {
        let frames = self.frames_for(ramp);
        self.duck.ramp_to(clamp_level(level), self.now, frames);
    }

    /// Effective music level: bus gain times duck.
    pub fn music_level(&self) -> f32 {
        self.bus_gain(Bus::Music) * self.duck_gain()
    }

    // -----------------------------------------------------------------------
    // Sources
    // -----------------------------------------------------------------------

    fn allocate(&mut self, bus: Bus, gain: f32, kind: SourceKind) -> Started {
        let id = SourceId(self.next_id);
        self.next_id += 1;
        let (tx, rx) = oneshot::channel();
        self.sources.insert(
            id,
            SourceNode {
                bus,
                gain: GainParam::new(clamp_level(gain)),
                kind,
                stop_at: None,
                ended: Some(tx),
            },
        );
        Started { id, ended: rx }
    }

    /// Start a decoded buffer on `bus` with its own gain stage.
    pub fn start_buffer(
        &mut self,
        buffer: SharedBuffer,
        bus: Bus,
        initial_gain: f32,
        looping: bool,
    ) -> Started {
        let step = buffer.sample_rate as f64 / self.sample_rate as f64;
        self.allocate(
            bus,
            initial_gain,
            SourceKind::Buffer {
                buffer,
                cursor: 0.0,
                step,
                looping,
            },
        )
    }

    /// Start a synthesized tone on `bus`.
    pub fn start_tone(&mut self, tone: Tone, bus: Bus) -> Started {
        self.allocate(bus, 1.0, SourceKind::Tone { tone, frame: 0 })
    }

    /// Current gain of a source's own gain stage.
    pub fn source_gain(&self, id: SourceId) -> Option<f32> {
        self.sources.get(&id).map(|n| n.gain.value_at(self.now))
    }

    /// Cancel the source's ramp at its current value and ramp to `target`.
    pub fn ramp_source(
        &mut self,
        id: SourceId,
        target: f32,
        ramp: Duration,
    ) -> Result<(), AudioError> {
        let frames = self.frames_for(ramp);
        let now = self.now;
        let node = self.sources.get_mut(&id).ok_or(AudioError::UnknownNode(id.0))?;
        node.gain.ramp_to(clamp_level(target), now, frames);
        Ok(())
    }

    /// Schedule a stop `after` from now.  An earlier scheduled stop wins.
    pub fn stop_after(&mut self, id: SourceId, after: Duration) -> Result<u64, AudioError> {
        let at = self.now + self.frames_for(after);
        let node = self.sources.get_mut(&id).ok_or(AudioError::UnknownNode(id.0))?;
        let at = node.stop_at.map_or(at, |existing| existing.min(at));
        node.stop_at = Some(at);
        Ok(at)
    }

    /// Frame at which the source is scheduled to stop, if any.
    pub fn stop_frame(&self, id: SourceId) -> Option<u64> {
        self.sources.get(&id).and_then(|n| n.stop_at)
    }

    /// Remove the source right away and resolve its `ended` signal.
    ///
    /// Returns `false` if the source had already finished.
    pub fn stop_now(&mut self, id: SourceId) -> bool {
        self.finish(id)
    }

    /// Stop every source (graph teardown).
    pub fn stop_all(&mut self) {
        let ids: Vec<SourceId> = self.sources.keys().copied().collect();
        for id in ids {
            self.finish(id);
        }
    }

    /// Sources started since the graph was created.
    pub fn started_total(&self) -> u64 {
        self.next_id - 1
    }

    pub fn is_playing(&self, id: SourceId) -> bool {
        self.sources.contains_key(&id)
    }

    /// Ids of sources currently on `bus`, oldest first.
    pub fn sources_on(&self, bus: Bus) -> Vec<SourceId> {
        let mut ids: Vec<SourceId> = self
            .sources
            .iter()
            .filter(|(_, n)| n.bus == bus)
            .map(|(id, _)| *id)
            .collect();
        ids.sort();
        ids
    }

    fn finish(&mut self, id: SourceId) -> bool {
        match self.sources.remove(&id) {
            Some(mut node) => {
                if let Some(tx) = node.ended.take() {
                    let _ = tx.send(());
                }
                true
            }
            None => false,
        }
    }

    // -----------------------------------------------------------------------
    // Rendering
    // -----------------------------------------------------------------------

    /// Render `out.len() / 2` frames of interleaved stereo and advance the
    /// clock.  Finished sources are removed and their `ended` resolved.
    pub fn render(&mut self, out: &mut [f32]) {
        out.fill(0.0);
        let frames = out.len() / 2;
        let rate = self.sample_rate;
        let start = self.now;
        let buses = self.buses;
        let duck = self.duck;
        let master = self.master;
        let mut finished = Vec::new();

        for (id, node) in self.sources.iter_mut() {
            let bus = buses[node.bus.index()];
            for i in 0..frames {
                let frame = start + i as u64;
                if node.stop_at.is_some_and(|at| frame >= at) {
                    finished.push(*id);
                    break;
                }
                let Some((l, r)) = node.kind.next_frame(rate) else {
                    finished.push(*id);
                    break;
                };
                let mut g = node.gain.value_at(frame) * bus.value_at(frame) * master.value_at(frame);
                if node.bus == Bus::Music {
                    g *= duck.value_at(frame);
                }
                out[i * 2] += l * g;
                out[i * 2 + 1] += r * g;
            }
        }

        self.now += frames as u64;

        // A scheduled stop landing exactly on the block edge
        for (id, node) in self.sources.iter() {
            if node.stop_at.is_some_and(|at| self.now >= at) && !finished.contains(id) {
                finished.push(*id);
            }
        }
        for id in finished {
            self.finish(id);
        }

        let now = self.now;
        self.master.settle(now);
        self.duck.settle(now);
        for bus in self.buses.iter_mut() {
            bus.settle(now);
        }
        for node in self.sources.values_mut() {
            node.gain.settle(now);
        }

        for s in out.iter_mut() {
            *s = s.clamp(-1.0, 1.0);
        }
    }

    /// Render `duration` worth of frames and return them.
    pub fn render_for(&mut self, duration: Duration) -> Vec<f32> {
        let mut out = vec![0.0; self.frames_for(duration) as usize * 2];
        self.render(&mut out);
        out
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
