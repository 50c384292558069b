//! Synthesized tones, the sound of last resort.
//!
//! Two tones are reserved:
//!
//! | Tone | Waveform | Frequency | Used for |
//! |------|----------|-----------|----------|
//! | [`Tone::DIAGNOSTIC`] | sine | 440 Hz | test-tone requests, graph path check |
//! | [`Tone::VOICE_FALLBACK`] | triangle | 660 Hz | tap acknowledgement when a voice line cannot play |
//!
//! They differ in both pitch and timbre so a listener can tell them apart.

use std::f32::consts::TAU;
use std::time::Duration;

/// Oscillator shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Waveform {
    Sine,
    Triangle,
    Square,
}

impl Waveform {
    /// Sample the waveform at `phase` (cycles, any real value).
    pub fn sample(&self, phase: f32) -> f32 {
        let p = phase.fract();
        match self {
            Waveform::Sine => (p * TAU).sin(),
            Waveform::Triangle => 1.0 - 4.0 * (p - 0.5).abs(),
            Waveform::Square => {
                if p < 0.5 {
                    1.0
                } else {
                    -1.0
                }
            }
        }
    }
}

/// A short, enveloped tone.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Tone {
    pub frequency_hz: f32,
    pub waveform: Waveform,
    pub duration: Duration,
    /// Peak amplitude, `0.0..=1.0`.
    pub amplitude: f32,
}

/// Attack/release length of the tone envelope; avoids clicks at both ends.
const EDGE_SECS: f32 = 0.01;

impl Tone {
    pub const DIAGNOSTIC: Tone = Tone {
        frequency_hz: 440.0,
        waveform: Waveform::Sine,
        duration: Duration::from_millis(300),
        amplitude: 0.25,
    };

    pub const VOICE_FALLBACK: Tone = Tone {
        frequency_hz: 660.0,
        waveform: Waveform::Triangle,
        duration: Duration::from_millis(180),
        amplitude: 0.3,
    };

    pub fn frames(&self, sample_rate: u32) -> u64 {
        (self.duration.as_secs_f64() * sample_rate as f64).round() as u64
    }

    /// Value of the tone at frame `n` (mono).  Zero past the end.
    pub fn sample_at(&self, n: u64, sample_rate: u32) -> f32 {
        let total = self.frames(sample_rate);
        if n >= total || sample_rate == 0 {
            return 0.0;
        }
        let t = n as f32 / sample_rate as f32;
        let remaining = (total - n) as f32 / sample_rate as f32;
        let envelope = (t / EDGE_SECS).min(1.0).min(remaining / EDGE_SECS);
        self.waveform.sample(t * self.frequency_hz) * self.amplitude * envelope
    }

    /// Render the whole tone as interleaved stereo.
    pub fn render_stereo(&self, sample_rate: u32) -> Vec<f32> {
        (0..self.frames(sample_rate))
            .flat_map(|n| {
                let s = self.sample_at(n, sample_rate);
                [s, s]
            })
            .collect()
    }
}
