//! Audio decoding via `symphonia`.
//!
//! Sources arrive as in-memory bytes (fetched from the network or the
//! assets directory).  [`StreamDecoder`] walks them packet by packet and
//! yields interleaved stereo `f32` chunks; [`decode_bytes`] drains it into a
//! single [`DecodedBuffer`] for the graph cache.  The streaming element uses
//! [`StreamDecoder`] directly so it can start playing before the whole
//! source is decoded.
//!
//! # Supported formats
//!
//! symphonia defaults (WAV/PCM, FLAC, Ogg Vorbis, MKV/WebM) plus the `mp3`,
//! `aac` and `isomp4` features enabled in `Cargo.toml`.

use std::io::Cursor;
use std::sync::Arc;
use std::time::Duration;

use symphonia::core::audio::SampleBuffer;
use symphonia::core::codecs::{Decoder, DecoderOptions, CODEC_TYPE_NULL};
use symphonia::core::errors::Error as SymphoniaError;
use symphonia::core::formats::{FormatOptions, FormatReader};
use symphonia::core::io::MediaSourceStream;
use symphonia::core::meta::MetadataOptions;
use symphonia::core::probe::Hint;

use super::error::AudioError;
use super::resample::{resample_stereo, to_stereo};

// ---------------------------------------------------------------------------
// DecodedBuffer
// ---------------------------------------------------------------------------

/// Fully decoded source, interleaved stereo `f32` in `[-1.0, 1.0]`.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedBuffer {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

impl DecodedBuffer {
    pub fn new(samples: Vec<f32>, sample_rate: u32) -> Self {
        Self {
            samples,
            sample_rate,
        }
    }

    pub fn frames(&self) -> usize {
        self.samples.len() / 2
    }

    pub fn duration(&self) -> Duration {
        if self.sample_rate == 0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(self.frames() as f64 / self.sample_rate as f64)
    }

    /// Convert to `target_rate`, consuming `self`.  Same rate is free.
    pub fn into_rate(self, target_rate: u32) -> Self {
        if self.sample_rate == target_rate {
            return self;
        }
        Self {
            samples: resample_stereo(&self.samples, self.sample_rate, target_rate),
            sample_rate: target_rate,
        }
    }
}

/// Shared handle to a cached buffer.
pub type SharedBuffer = Arc<DecodedBuffer>;

// ---------------------------------------------------------------------------
// StreamDecoder
// ---------------------------------------------------------------------------

/// Incremental decoder over an in-memory source.
pub struct StreamDecoder {
    src: String,
    format: Box<dyn FormatReader>,
    decoder: Box<dyn Decoder>,
    track_id: u32,
    sample_rate: u32,
}

impl StreamDecoder {
    /// Probe `bytes` and prepare a decoder for the first audio track.
    ///
    /// `src` is only used for the format hint (its extension) and for error
    /// messages.
    pub fn open(src: &str, bytes: Vec<u8>) -> Result<Self, AudioError> {
        let err = |reason: String| AudioError::Decode {
            src: src.to_string(),
            reason,
        };

        let mss = MediaSourceStream::new(Box::new(Cursor::new(bytes)), Default::default());

        let mut hint = Hint::new();
        if let Some(ext) = extension_of(src) {
            hint.with_extension(ext);
        }

        let probed = symphonia::default::get_probe()
            .format(
                &hint,
                mss,
                &FormatOptions::default(),
                &MetadataOptions::default(),
            )
            .map_err(|e| err(format!("unrecognised container: {e}")))?;
        let format = probed.format;

        let track = format
            .tracks()
            .iter()
            .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
            .ok_or_else(|| err("no audio track".into()))?;
        let track_id = track.id;
        let params = track.codec_params.clone();

        let decoder = symphonia::default::get_codecs()
            .make(&params, &DecoderOptions::default())
            .map_err(|e| err(format!("unsupported codec: {e}")))?;

        Ok(Self {
            src: src.to_string(),
            format,
            decoder,
            track_id,
            sample_rate: params.sample_rate.unwrap_or(0),
        })
    }

    /// Native sample rate, or `0` until the first packet reports it.
    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Decode the next packet into interleaved stereo.
    ///
    /// Returns `Ok(None)` at end of stream.  Corrupt packets are skipped.
    pub fn next_chunk(&mut self) -> Result<Option<Vec<f32>>, AudioError> {
        loop {
            let packet = match self.format.next_packet() {
                Ok(packet) => packet,
                Err(SymphoniaError::IoError(e))
                    if e.kind() == std::io::ErrorKind::UnexpectedEof =>
                {
                    return Ok(None);
                }
                Err(SymphoniaError::ResetRequired) => return Ok(None),
                Err(e) => {
                    return Err(AudioError::Decode {
                        src: self.src.clone(),
                        reason: e.to_string(),
                    })
                }
            };

            if packet.track_id() != self.track_id {
                continue;
            }

            match self.decoder.decode(&packet) {
                Ok(decoded) => {
                    let spec = *decoded.spec();
                    if self.sample_rate == 0 {
                        self.sample_rate = spec.rate;
                    }
                    let channels = spec.channels.count() as u16;
                    let mut buf = SampleBuffer::<f32>::new(decoded.capacity() as u64, spec);
                    buf.copy_interleaved_ref(decoded);
                    return Ok(Some(to_stereo(buf.samples(), channels)));
                }
                Err(SymphoniaError::DecodeError(e)) => {
                    log::debug!("decode: skipping corrupt packet in {}: {e}", self.src);
                }
                Err(e) => {
                    return Err(AudioError::Decode {
                        src: self.src.clone(),
                        reason: e.to_string(),
                    })
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// decode_bytes
// ---------------------------------------------------------------------------

/// Decode a whole source into one buffer.
///
/// Blocking and CPU-bound: call from `tokio::task::spawn_blocking`.
pub fn decode_bytes(src: &str, bytes: Vec<u8>) -> Result<DecodedBuffer, AudioError> {
    let mut decoder = StreamDecoder::open(src, bytes)?;
    let mut samples = Vec::new();
    while let Some(chunk) = decoder.next_chunk()? {
        samples.extend_from_slice(&chunk);
    }

    if samples.is_empty() || decoder.sample_rate() == 0 {
        return Err(AudioError::Decode {
            src: src.to_string(),
            reason: "no audio frames".into(),
        });
    }

    Ok(DecodedBuffer::new(samples, decoder.sample_rate()))
}

fn extension_of(src: &str) -> Option<&str> {
    let path = src.split(['?', '#']).next().unwrap_or(src);
    let name = path.rsplit('/').next()?;
    let (_, ext) = name.rsplit_once('.')?;
    (!ext.is_empty()).then_some(ext)
}

// ---------------------------------------------------------------------------
// Test fixtures
// ---------------------------------------------------------------------------

/// Minimal mono PCM16 WAV containing `frames` samples of a quiet square
/// wave at `sample_rate`.
#[cfg(test)]
pub(crate) fn test_wav(frames: u32, sample_rate: u32) -> Vec<u8> {
    let bits_per_sample: u16 = 16;
    let channels: u16 = 1;
    let block_align: u16 = channels * (bits_per_sample / 8);
    let byte_rate: u32 = sample_rate * block_align as u32;
    let data_bytes: u32 = frames * block_align as u32;

    let mut wav = Vec::with_capacity(44 + data_bytes as usize);
    wav.extend_from_slice(b"RIFF");
    wav.extend_from_slice(&(36 + data_bytes).to_le_bytes());
    wav.extend_from_slice(b"WAVE");
    wav.extend_from_slice(b"fmt ");
    wav.extend_from_slice(&16u32.to_le_bytes());
    wav.extend_from_slice(&1u16.to_le_bytes()); // PCM
    wav.extend_from_slice(&channels.to_le_bytes());
    wav.extend_from_slice(&sample_rate.to_le_bytes());
    wav.extend_from_slice(&byte_rate.to_le_bytes());
    wav.extend_from_slice(&block_align.to_le_bytes());
    wav.extend_from_slice(&bits_per_sample.to_le_bytes());
    wav.extend_from_slice(b"data");
    wav.extend_from_slice(&data_bytes.to_le_bytes());
    for i in 0..frames {
        let sample: i16 = if (i / 20) % 2 == 0 { 8_000 } else { -8_000 };
        wav.extend_from_slice(&sample.to_le_bytes());
    }
    wav
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_pcm_wav_to_stereo() {
        let buf = decode_bytes("blip.wav", test_wav(1_000, 16_000)).unwrap();
        assert_eq!(buf.sample_rate, 16_000);
        assert_eq!(buf.frames(), 1_000);
        // mono duplicated to both sides
        assert_eq!(buf.samples[0], buf.samples[1]);
        assert!(buf.samples[0].abs() > 0.1);
    }

    #[test]
    fn garbage_bytes_fail_to_decode() {
        let err = decode_bytes("noise.mp3", b"definitely not audio".to_vec()).unwrap_err();
        assert!(matches!(err, AudioError::Decode { ref src, .. } if src == "noise.mp3"));
    }

    #[test]
    fn empty_bytes_fail_to_decode() {
        assert!(decode_bytes("empty.ogg", Vec::new()).is_err());
    }

    #[test]
    fn into_rate_resamples() {
        let buf = decode_bytes("blip.wav", test_wav(1_600, 16_000)).unwrap();
        let out = buf.into_rate(48_000);
        assert_eq!(out.sample_rate, 48_000);
        assert!(out.frames().abs_diff(4_800) <= 1);
    }

    #[test]
    fn duration_matches_frames() {
        let buf = DecodedBuffer::new(vec![0.0; 48_000 * 2], 48_000);
        assert_eq!(buf.duration(), Duration::from_secs(1));
    }

    #[test]
    fn extension_ignores_query_and_path() {
        assert_eq!(extension_of("https://cdn.x/a/b/theme.ogg?v=2"), Some("ogg"));
        assert_eq!(extension_of("audio/rain.mp3"), Some("mp3"));
        assert_eq!(extension_of("audio/noext"), None);
    }
}
