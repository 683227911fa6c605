//! G.711 μ-law codec and sample-rate conversion between the telephony leg and speech providers.
//!
//! The telephony side is always 8 kHz μ-law. Providers use 16-bit linear PCM at their own rate.
//! Every function here is pure; [`TelephonyTranscoder`] only carries split samples between calls.

use callbridge_core::error::CallError;
use callbridge_core::types::{AudioFormat, TELEPHONY_SAMPLE_RATE};

const BIAS: i32 = 0x84;
const CLIP: i32 = 32635;

/// Encode one linear sample as G.711 μ-law.
pub fn encode_mulaw(sample: i16) -> u8 {
    let mut magnitude = sample as i32;
    let sign = if magnitude < 0 {
        magnitude = -magnitude;
        0x80
    } else {
        0x00
    };
    magnitude = magnitude.min(CLIP) + BIAS;

    let mut exponent: i32 = 7;
    let mut mask = 0x4000;
    while exponent > 0 && magnitude & mask == 0 {
        exponent -= 1;
        mask >>= 1;
    }
    let mantissa = (magnitude >> (exponent + 3)) & 0x0F;
    !((sign | (exponent << 4) | mantissa) as u8)
}

/// Decode one G.711 μ-law byte.
pub fn decode_mulaw(byte: u8) -> i16 {
    let u = !byte;
    let exponent = ((u >> 4) & 0x07) as i32;
    let mantissa = (u & 0x0F) as i32;
    let magnitude = (((mantissa << 3) + BIAS) << exponent) - BIAS;
    if u & 0x80 != 0 {
        -magnitude as i16
    } else {
        magnitude as i16
    }
}

pub fn mulaw_to_samples(bytes: &[u8]) -> Vec<i16> {
    bytes.iter().map(|&b| decode_mulaw(b)).collect()
}

pub fn samples_to_mulaw(samples: &[i16]) -> Vec<u8> {
    samples.iter().map(|&s| encode_mulaw(s)).collect()
}

/// Resample mono PCM with linear interpolation.
///
/// When downsampling, a centered box filter spanning the decimation ratio runs first so the
/// interpolation does not alias high frequencies into the telephone band.
pub fn resample(samples: &[i16], from_rate: u32, to_rate: u32) -> Vec<i16> {
    if from_rate == to_rate || samples.is_empty() || from_rate == 0 || to_rate == 0 {
        return samples.to_vec();
    }

    let filtered;
    let source = if from_rate > to_rate {
        let half = (from_rate / to_rate) as usize / 2;
        filtered = box_filter(samples, half);
        &filtered[..]
    } else {
        samples
    };

    let out_len = ((source.len() as u64 * to_rate as u64) / from_rate as u64) as usize;
    let step = from_rate as f64 / to_rate as f64;
    let last = source.len() - 1;

    (0..out_len)
        .map(|i| {
            let pos = i as f64 * step;
            let idx = (pos.floor() as usize).min(last);
            let frac = pos - idx as f64;
            let a = source[idx] as f64;
            let b = source[(idx + 1).min(last)] as f64;
            (a + (b - a) * frac).round().clamp(i16::MIN as f64, i16::MAX as f64) as i16
        })
        .collect()
}

fn box_filter(samples: &[i16], half: usize) -> Vec<i16> {
    if half == 0 {
        return samples.to_vec();
    }
    let last = samples.len() - 1;
    (0..samples.len())
        .map(|i| {
            let lo = i.saturating_sub(half);
            let hi = (i + half).min(last);
            let sum: i32 = samples[lo..=hi].iter().map(|&s| s as i32).sum();
            (sum / (hi - lo + 1) as i32) as i16
        })
        .collect()
}

/// Telephony μ-law bytes to linear PCM at `target_rate`.
pub fn telephony_to_linear(bytes: &[u8], target_rate: u32) -> Vec<i16> {
    resample(&mulaw_to_samples(bytes), TELEPHONY_SAMPLE_RATE, target_rate)
}

/// Linear PCM at `source_rate` to telephony μ-law bytes.
pub fn linear_to_telephony(samples: &[i16], source_rate: u32) -> Vec<u8> {
    samples_to_mulaw(&resample(samples, source_rate, TELEPHONY_SAMPLE_RATE))
}

/// Interpret bytes as 16-bit little-endian samples.
pub fn pcm16le_to_samples(bytes: &[u8]) -> Result<Vec<i16>, CallError> {
    if bytes.len() % 2 != 0 {
        return Err(CallError::Codec(format!(
            "PCM16 buffer has odd length {}",
            bytes.len()
        )));
    }
    Ok(bytes
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
        .collect())
}

pub fn samples_to_pcm16le(samples: &[i16]) -> Vec<u8> {
    let mut out = Vec::with_capacity(samples.len() * 2);
    for &s in samples {
        out.extend_from_slice(&s.to_le_bytes());
    }
    out
}

/// Root-mean-square energy of a block of samples.
pub fn rms(samples: &[i16]) -> f64 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum: f64 = samples.iter().map(|&s| (s as f64) * (s as f64)).sum();
    (sum / samples.len() as f64).sqrt()
}

fn gcd(mut a: u32, mut b: u32) -> u32 {
    while b != 0 {
        (a, b) = (b, a % b);
    }
    a
}

/// Converts a synthesized audio byte stream into telephony bytes chunk by chunk.
///
/// Network chunks split samples and resampling blocks arbitrarily. The transcoder holds the
/// leftovers so no sample is lost or duplicated. Filtering restarts at each push, so the output
/// is close to, not bit-identical with, converting the whole stream at once.
#[derive(Debug)]
pub struct TelephonyTranscoder {
    format: AudioFormat,
    pending_byte: Option<u8>,
    pending_samples: Vec<i16>,
    block: usize,
}

impl TelephonyTranscoder {
    pub fn new(format: AudioFormat) -> Self {
        let block = match format {
            AudioFormat::Pcm16 { sample_rate } if sample_rate > 0 => {
                (sample_rate / gcd(sample_rate, TELEPHONY_SAMPLE_RATE)) as usize
            }
            _ => 1,
        };
        Self {
            format,
            pending_byte: None,
            pending_samples: Vec::new(),
            block,
        }
    }

    pub fn format(&self) -> AudioFormat {
        self.format
    }

    /// Convert the next piece of the stream.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<u8> {
        let sample_rate = match self.format {
            AudioFormat::Mulaw8k => return bytes.to_vec(),
            AudioFormat::Pcm16 { sample_rate } => sample_rate,
        };

        let mut data = Vec::with_capacity(bytes.len() + 1);
        if let Some(b) = self.pending_byte.take() {
            data.push(b);
        }
        data.extend_from_slice(bytes);
        if data.len() % 2 == 1 {
            self.pending_byte = data.pop();
        }

        self.pending_samples.extend(
            data.chunks_exact(2)
                .map(|pair| i16::from_le_bytes([pair[0], pair[1]])),
        );

        let usable = self.pending_samples.len() - self.pending_samples.len() % self.block;
        if usable == 0 {
            return Vec::new();
        }
        let rest = self.pending_samples.split_off(usable);
        let ready = std::mem::replace(&mut self.pending_samples, rest);
        linear_to_telephony(&ready, sample_rate)
    }

    /// Flush whatever is held back at end of stream. A dangling half sample is discarded.
    pub fn finish(&mut self) -> Vec<u8> {
        self.pending_byte = None;
        let samples = std::mem::take(&mut self.pending_samples);
        match self.format {
            AudioFormat::Mulaw8k => Vec::new(),
            AudioFormat::Pcm16 { sample_rate } => linear_to_telephony(&samples, sample_rate),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sine(freq: f64, rate: u32, len: usize, amplitude: f64) -> Vec<i16> {
        (0..len)
            .map(|i| {
                let t = i as f64 / rate as f64;
                (amplitude * (2.0 * std::f64::consts::PI * freq * t).sin()) as i16
            })
            .collect()
    }

    #[test]
    fn test_mulaw_known_values() {
        assert_eq!(encode_mulaw(0), 0xFF);
        assert_eq!(decode_mulaw(0xFF), 0);
        assert_eq!(encode_mulaw(i16::MAX), 0x80);
        assert_eq!(encode_mulaw(i16::MIN), 0x00);
        assert_eq!(decode_mulaw(0x80), 32124);
        assert_eq!(decode_mulaw(0x00), -32124);
    }

    #[test]
    fn test_mulaw_decode_encode_is_identity() {
        for byte in 0u8..=255 {
            // 0x7F is negative zero and folds onto 0xFF.
            if byte == 0x7F {
                assert_eq!(encode_mulaw(decode_mulaw(byte)), 0xFF);
                continue;
            }
            assert_eq!(encode_mulaw(decode_mulaw(byte)), byte, "byte {byte:#04x}");
        }
    }

    #[test]
    fn test_silence_round_trips_to_silence() {
        let silence = vec![0xFFu8; 160];
        let linear = telephony_to_linear(&silence, 16_000);
        assert_eq!(linear.len(), 320);
        assert!(linear.iter().all(|&s| s == 0));
        assert_eq!(linear_to_telephony(&linear, 16_000), silence);
    }

    #[test]
    fn test_same_rate_is_identity() {
        let samples = sine(440.0, 8000, 160, 9000.0);
        assert_eq!(resample(&samples, 8000, 8000), samples);
        let bytes = samples_to_mulaw(&samples);
        assert_eq!(linear_to_telephony(&telephony_to_linear(&bytes, 8000), 8000), bytes);
    }

    #[test]
    fn test_resampled_round_trip_is_close() {
        let bytes = samples_to_mulaw(&sine(200.0, 8000, 800, 8000.0));
        let back = linear_to_telephony(&telephony_to_linear(&bytes, 16_000), 16_000);
        assert_eq!(back.len(), bytes.len());

        let original = mulaw_to_samples(&bytes);
        let restored = mulaw_to_samples(&back);
        // Skip the edges where the smoothing window is clamped.
        for i in 1..original.len() - 1 {
            let diff = (original[i] as i32 - restored[i] as i32).abs();
            assert!(diff <= 512, "sample {i}: {} vs {}", original[i], restored[i]);
        }
    }

    #[test]
    fn test_resample_lengths() {
        let src = vec![100i16; 480];
        assert_eq!(resample(&src, 24_000, 8000).len(), 160);
        assert_eq!(resample(&src, 8000, 16_000).len(), 960);
        assert!(resample(&[], 8000, 16_000).is_empty());
    }

    #[test]
    fn test_pcm16le_helpers() {
        let samples = vec![0i16, 1, -1, i16::MAX, i16::MIN];
        let bytes = samples_to_pcm16le(&samples);
        assert_eq!(bytes.len(), 10);
        assert_eq!(&bytes[2..4], &[1, 0]);
        assert_eq!(pcm16le_to_samples(&bytes).unwrap(), samples);
        let err = pcm16le_to_samples(&bytes[..3]).unwrap_err();
        assert_eq!(err.kind(), "codec");
    }

    #[test]
    fn test_rms() {
        assert_eq!(rms(&[]), 0.0);
        assert_eq!(rms(&[0; 160]), 0.0);
        assert_eq!(rms(&[1000, -1000, 1000, -1000]), 1000.0);
    }

    #[test]
    fn test_transcoder_mulaw_passthrough() {
        let mut t = TelephonyTranscoder::new(AudioFormat::Mulaw8k);
        assert_eq!(t.push(&[1, 2, 3]), vec![1, 2, 3]);
        assert!(t.finish().is_empty());
    }

    #[test]
    fn test_transcoder_split_chunks_close_to_whole_stream() {
        let samples = sine(300.0, 24_000, 2400, 10_000.0);
        let bytes = samples_to_pcm16le(&samples);
        let whole = linear_to_telephony(&samples, 24_000);

        let mut t = TelephonyTranscoder::new(AudioFormat::Pcm16 { sample_rate: 24_000 });
        let mut out = Vec::new();
        // Odd-sized pieces split samples and resampling blocks.
        for piece in bytes.chunks(333) {
            out.extend(t.push(piece));
        }
        out.extend(t.finish());
        assert_eq!(out.len(), whole.len());

        let a = mulaw_to_samples(&out);
        let b = mulaw_to_samples(&whole);
        let max_diff = a
            .iter()
            .zip(&b)
            .map(|(x, y)| (*x as i32 - *y as i32).abs())
            .max()
            .unwrap_or(0);
        assert!(max_diff <= 1024, "max diff {max_diff}");
    }
}
