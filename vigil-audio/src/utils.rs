// PCM helpers shared by the VAD, the transcription hand-off and playback
use std::time::Duration;

/// Mean absolute amplitude of a PCM16 chunk.
#[inline]
pub fn frame_energy(samples: &[i16]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum: u64 = samples.iter().map(|s| (*s as i32).unsigned_abs() as u64).sum();
    sum as f32 / samples.len() as f32
}

/// Playback length of `samples` mono samples at `sample_rate_hz`.
#[inline]
pub fn samples_duration(samples: usize, sample_rate_hz: u32) -> Duration {
    if sample_rate_hz == 0 {
        return Duration::ZERO;
    }
    Duration::from_micros(samples as u64 * 1_000_000 / sample_rate_hz as u64)
}

/// Wrap PCM16 little-endian samples in a canonical 44-byte RIFF/WAVE header.
pub fn encode_wav_pcm16(samples: &[i16], sample_rate_hz: u32, channels: u16) -> Vec<u8> {
    let bits_per_sample: u16 = 16;
    let block_align = channels * bits_per_sample / 8;
    let byte_rate = sample_rate_hz * block_align as u32;
    let data_len = (samples.len() * 2) as u32;

    let mut out = Vec::with_capacity(44 + data_len as usize);
    out.extend_from_slice(b"RIFF");
    out.extend_from_slice(&(36 + data_len).to_le_bytes());
    out.extend_from_slice(b"WAVE");
    out.extend_from_slice(b"fmt ");
    out.extend_from_slice(&16u32.to_le_bytes());
    out.extend_from_slice(&1u16.to_le_bytes()); // PCM
    out.extend_from_slice(&channels.to_le_bytes());
    out.extend_from_slice(&sample_rate_hz.to_le_bytes());
    out.extend_from_slice(&byte_rate.to_le_bytes());
    out.extend_from_slice(&block_align.to_le_bytes());
    out.extend_from_slice(&bits_per_sample.to_le_bytes());
    out.extend_from_slice(b"data");
    out.extend_from_slice(&data_len.to_le_bytes());
    for s in samples {
        out.extend_from_slice(&s.to_le_bytes());
    }
    out
}

/// Scale the `data` chunk of a PCM16 WAV in place. Non-WAV input is left
/// untouched.
pub fn scale_wav_pcm16(buf: &mut [u8], gain: f32) {
    if buf.len() < 12 || &buf[0..4] != b"RIFF" || &buf[8..12] != b"WAVE" {
        return;
    }
    let mut idx = 12;
    while idx + 8 <= buf.len() {
        let size =
            u32::from_le_bytes([buf[idx + 4], buf[idx + 5], buf[idx + 6], buf[idx + 7]]) as usize;
        if &buf[idx..idx + 4] == b"data" {
            let start = idx + 8;
            let end = (start + size).min(buf.len());
            for chunk in buf[start..end].chunks_exact_mut(2) {
                let s = i16::from_le_bytes([chunk[0], chunk[1]]);
                let scaled = (s as f32 * gain).clamp(i16::MIN as f32, i16::MAX as f32) as i16;
                chunk.copy_from_slice(&scaled.to_le_bytes());
            }
            return;
        }
        idx += 8 + size;
    }
}

/// Average interleaved frames down to one channel.
pub fn downmix_to_mono(samples: &[i16], channels: u16) -> Vec<i16> {
    if channels <= 1 {
        return samples.to_vec();
    }
    samples
        .chunks_exact(channels as usize)
        .map(|frame| {
            let sum: i32 = frame.iter().map(|s| *s as i32).sum();
            (sum / channels as i32) as i16
        })
        .collect()
}

/// Linear-interpolation resampler for mono PCM16. Good enough for speech
/// energy and recognition; not for music.
pub fn resample_linear(samples: &[i16], from_hz: u32, to_hz: u32) -> Vec<i16> {
    if from_hz == to_hz || samples.is_empty() || from_hz == 0 || to_hz == 0 {
        return samples.to_vec();
    }
    let out_len = (samples.len() as u64 * to_hz as u64 / from_hz as u64) as usize;
    let step = from_hz as f64 / to_hz as f64;
    let last = samples.len() - 1;
    (0..out_len)
        .map(|i| {
            let pos = i as f64 * step;
            let idx = (pos as usize).min(last);
            let next = (idx + 1).min(last);
            let frac = pos - idx as f64;
            let a = samples[idx] as f64;
            let b = samples[next] as f64;
            (a + (b - a) * frac).round() as i16
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn energy_is_mean_absolute_amplitude() {
        assert_eq!(frame_energy(&[]), 0.0);
        assert_eq!(frame_energy(&[100, -100, 50, -50]), 75.0);
        assert_eq!(frame_energy(&[i16::MIN]), 32768.0);
    }

    #[test]
    fn wav_header_describes_payload() {
        let wav = encode_wav_pcm16(&[1, -1, 2], 16_000, 1);
        assert_eq!(wav.len(), 44 + 6);
        assert_eq!(&wav[0..4], b"RIFF");
        assert_eq!(u32::from_le_bytes([wav[24], wav[25], wav[26], wav[27]]), 16_000);
        assert_eq!(u32::from_le_bytes([wav[40], wav[41], wav[42], wav[43]]), 6);
        assert_eq!(i16::from_le_bytes([wav[46], wav[47]]), -1);
    }

    #[test]
    fn gain_scales_and_clamps_samples() {
        let mut wav = encode_wav_pcm16(&[1000, 30_000], 16_000, 1);
        scale_wav_pcm16(&mut wav, 2.0);
        assert_eq!(i16::from_le_bytes([wav[44], wav[45]]), 2000);
        assert_eq!(i16::from_le_bytes([wav[46], wav[47]]), i16::MAX);
    }

    #[test]
    fn duration_follows_sample_rate() {
        assert_eq!(samples_duration(16_000, 16_000), Duration::from_secs(1));
        assert_eq!(samples_duration(480, 16_000), Duration::from_millis(30));
    }

    #[test]
    fn stereo_is_averaged_to_mono() {
        assert_eq!(downmix_to_mono(&[100, 300, -50, 50], 2), vec![200, 0]);
        assert_eq!(downmix_to_mono(&[1, 2, 3], 1), vec![1, 2, 3]);
    }

    #[test]
    fn resampling_changes_length_by_rate_ratio() {
        let input: Vec<i16> = (0..480).map(|i| i as i16).collect();
        let out = resample_linear(&input, 48_000, 16_000);
        assert_eq!(out.len(), 160);
        assert_eq!(out[0], 0);
        assert_eq!(out[1], 3);
        assert_eq!(resample_linear(&input, 16_000, 16_000), input);
    }
}
