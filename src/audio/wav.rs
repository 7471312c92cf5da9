//! PCM16 WAV framing.
//!
//! The encoder writes the canonical 44-byte header for mono 16-bit PCM
//! followed by little-endian samples. Output is byte-exact: fixtures compare
//! against it directly.

use thiserror::Error;

/// Session audio rate used by the realtime relay.
pub const DEFAULT_SAMPLE_RATE: u32 = 24_000;

/// Size of the RIFF + fmt + data headers written by [`encode_wav`].
pub const HEADER_LEN: usize = 44;

const BYTES_PER_SAMPLE: u16 = 2;
const NUM_CHANNELS: u16 = 1;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum WavError {
    #[error("buffer too short for a WAV header ({0} bytes)")]
    TooShort(usize),
    #[error("missing {0} marker")]
    BadMagic(&'static str),
    #[error("unsupported format: format={format} channels={channels} bits={bits}")]
    Unsupported { format: u16, channels: u16, bits: u16 },
    #[error("no data chunk")]
    MissingData,
}

/// A decoded mono PCM16 WAV.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedWav {
    pub sample_rate: u32,
    pub samples: Vec<i16>,
}

/// Encode mono PCM16 samples as a WAV container.
pub fn encode_wav(samples: &[i16], sample_rate: u32) -> Vec<u8> {
    let data_size = samples.len() as u32 * BYTES_PER_SAMPLE as u32;
    let riff_size = 36 + data_size;

    let mut buf = Vec::with_capacity(HEADER_LEN + data_size as usize);

    // RIFF header
    buf.extend_from_slice(b"RIFF");
    buf.extend_from_slice(&riff_size.to_le_bytes());
    buf.extend_from_slice(b"WAVE");

    // fmt sub-chunk
    buf.extend_from_slice(b"fmt ");
    buf.extend_from_slice(&16u32.to_le_bytes());
    buf.extend_from_slice(&1u16.to_le_bytes()); // PCM
    buf.extend_from_slice(&NUM_CHANNELS.to_le_bytes());
    buf.extend_from_slice(&sample_rate.to_le_bytes());
    let byte_rate = sample_rate * NUM_CHANNELS as u32 * BYTES_PER_SAMPLE as u32;
    buf.extend_from_slice(&byte_rate.to_le_bytes());
    let block_align = NUM_CHANNELS * BYTES_PER_SAMPLE;
    buf.extend_from_slice(&block_align.to_le_bytes());
    buf.extend_from_slice(&(BYTES_PER_SAMPLE * 8).to_le_bytes());

    // data sub-chunk
    buf.extend_from_slice(b"data");
    buf.extend_from_slice(&data_size.to_le_bytes());
    for sample in samples {
        buf.extend_from_slice(&sample.to_le_bytes());
    }

    buf
}

/// Decode a mono PCM16 WAV.
///
/// Walks the chunk list so payloads carrying extra chunks (`LIST`, `fact`)
/// are accepted. Anything other than mono 16-bit PCM is rejected.
pub fn decode_wav(bytes: &[u8]) -> Result<DecodedWav, WavError> {
    if bytes.len() < 12 {
        return Err(WavError::TooShort(bytes.len()));
    }
    if &bytes[0..4] != b"RIFF" {
        return Err(WavError::BadMagic("RIFF"));
    }
    if &bytes[8..12] != b"WAVE" {
        return Err(WavError::BadMagic("WAVE"));
    }

    let mut sample_rate = None;
    let mut pos = 12;
    while pos + 8 <= bytes.len() {
        let id = &bytes[pos..pos + 4];
        let size = read_u32(bytes, pos + 4) as usize;
        let body_start = pos + 8;
        let body_end = body_start.saturating_add(size).min(bytes.len());
        let body = &bytes[body_start..body_end];

        match id {
            b"fmt " => {
                if body.len() < 16 {
                    return Err(WavError::TooShort(bytes.len()));
                }
                let format = read_u16(body, 0);
                let channels = read_u16(body, 2);
                let bits = read_u16(body, 14);
                if format != 1 || channels != NUM_CHANNELS || bits != 16 {
                    return Err(WavError::Unsupported { format, channels, bits });
                }
                sample_rate = Some(read_u32(body, 4));
            }
            b"data" => {
                let sample_rate = sample_rate.ok_or(WavError::BadMagic("fmt "))?;
                return Ok(DecodedWav {
                    sample_rate,
                    samples: pcm16_from_le_bytes(body),
                });
            }
            _ => {}
        }

        // Chunks are word aligned.
        pos = body_start.saturating_add(size + (size & 1));
    }

    Err(WavError::MissingData)
}

/// Interpret little-endian bytes as PCM16 samples. A trailing odd byte is
/// ignored.
pub fn pcm16_from_le_bytes(bytes: &[u8]) -> Vec<i16> {
    bytes
        .chunks_exact(2)
        .map(|b| i16::from_le_bytes([b[0], b[1]]))
        .collect()
}

pub fn pcm16_to_le_bytes(samples: &[i16]) -> Vec<u8> {
    let mut out = Vec::with_capacity(samples.len() * 2);
    for s in samples {
        out.extend_from_slice(&s.to_le_bytes());
    }
    out
}

/// Convert f32 samples in [-1, 1] to PCM16 with clamping.
pub fn f32_to_pcm16(samples: &[f32]) -> Vec<i16> {
    samples
        .iter()
        .map(|s| (s.clamp(-1.0, 1.0) * 32767.0) as i16)
        .collect()
}

/// Milliseconds of audio represented by `samples` at `sample_rate`.
pub fn samples_to_ms(samples: u64, sample_rate: u32) -> u64 {
    if sample_rate == 0 {
        return 0;
    }
    samples * 1000 / sample_rate as u64
}

fn read_u16(bytes: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([bytes[at], bytes[at + 1]])
}

fn read_u32(bytes: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
}
