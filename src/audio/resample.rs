//! Channel mapping and sample-rate conversion for decoded sources.
//!
//! The mixer works on **interleaved stereo `f32`** at the graph rate.  This
//! module provides the two conversion steps applied once, at decode time:
//!
//! 1. [`to_stereo`]: map any interleaved channel count onto L/R.
//! 2. [`resample_stereo`]: linear-interpolation resample between rates.
//!
//! Decoded sources are short (cues, sfx, voice lines) and converted once, so
//! linear interpolation is accurate enough and keeps the cache cheap to fill.

// ---------------------------------------------------------------------------
// to_stereo
// ---------------------------------------------------------------------------

/// Map interleaved `channels`-channel audio onto interleaved stereo.
///
/// * mono is duplicated to both sides;
/// * stereo is returned unchanged;
/// * more channels are folded: even channels into L, odd into R, averaged;
/// * `channels == 0` yields an empty vector.
///
/// ```rust
/// use tale_audio::audio::to_stereo;
///
/// assert_eq!(to_stereo(&[0.5, -0.5], 1), vec![0.5, 0.5, -0.5, -0.5]);
/// assert_eq!(to_stereo(&[0.1, 0.2], 2), vec![0.1, 0.2]);
/// ```
pub fn to_stereo(samples: &[f32], channels: u16) -> Vec<f32> {
    match channels {
        0 => Vec::new(),
        1 => samples.iter().flat_map(|&s| [s, s]).collect(),
        2 => samples.to_vec(),
        n => {
            let n = n as usize;
            let left_count = n.div_ceil(2) as f32;
            let right_count = (n / 2) as f32;
            samples
                .chunks_exact(n)
                .flat_map(|frame| {
                    let (mut l, mut r) = (0.0f32, 0.0f32);
                    for (ch, s) in frame.iter().enumerate() {
                        if ch % 2 == 0 {
                            l += s;
                        } else {
                            r += s;
                        }
                    }
                    [l / left_count, r / right_count]
                })
                .collect()
        }
    }
}

// ---------------------------------------------------------------------------
// resample_stereo
// ---------------------------------------------------------------------------

/// Resample interleaved stereo from `source_rate` to `target_rate` using
/// linear interpolation between adjacent frames.
///
/// * Equal rates return a copy (no interpolation).
/// * Empty input or a zero rate returns an empty vector.
///
/// ```rust
/// use tale_audio::audio::resample_stereo;
///
/// let hi = vec![0.5_f32; 960]; // 480 frames @ 48 kHz
/// let lo = resample_stereo(&hi, 48_000, 16_000);
/// assert_eq!(lo.len(), 320);   // 160 frames @ 16 kHz
/// ```
pub fn resample_stereo(samples: &[f32], source_rate: u32, target_rate: u32) -> Vec<f32> {
    if source_rate == target_rate {
        return samples.to_vec();
    }
    if samples.len() < 2 || source_rate == 0 || target_rate == 0 {
        return Vec::new();
    }

    let frames = samples.len() / 2;
    let ratio = target_rate as f64 / source_rate as f64;
    let output_frames = (frames as f64 * ratio).ceil() as usize;
    let mut output = Vec::with_capacity(output_frames * 2);

    for i in 0..output_frames {
        let src_pos = i as f64 / ratio;
        let idx = src_pos as usize;
        let frac = (src_pos - idx as f64) as f32;

        for ch in 0..2 {
            let a = samples.get(idx * 2 + ch).copied().unwrap_or(0.0);
            let sample = match samples.get((idx + 1) * 2 + ch) {
                Some(&b) => a * (1.0 - frac) + b * frac,
                None => a,
            };
            output.push(sample);
        }
    }

    output
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
