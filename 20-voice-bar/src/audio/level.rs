//! Input level metering for the 0-100 indicator.

/// Quietest level that still registers on the meter.
const FLOOR_DB: f64 = -50.0;

/// Maps the RMS amplitude of `samples` onto 0..=100, with `FLOOR_DB` as silence
/// and full scale (0 dB) as 100.
pub fn input_level(samples: &[f32]) -> u8 {
    if samples.is_empty() {
        return 0;
    }

    let rms = (samples
        .iter()
        .map(|&s| {
            let sample = s as f64;
            sample * sample
        })
        .sum::<f64>()
        / samples.len() as f64)
        .sqrt();
    if rms <= 0.0 {
        return 0;
    }

    let db = 20.0 * rms.log10();
    let normalized = ((db - FLOOR_DB) / -FLOOR_DB).clamp(0.0, 1.0);
    (normalized * 100.0).round() as u8
}

/// Interleaved 16-bit little-endian PCM, the payload format of the bundled backends.
pub fn encode_pcm16(samples: &[f32]) -> Vec<u8> {
    samples
        .iter()
        .flat_map(|&s| ((s.clamp(-1.0, 1.0) * i16::MAX as f32) as i16).to_le_bytes())
        .collect()
}

pub fn decode_pcm16(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]) as f32 / i16::MAX as f32)
        .collect()
}

/// Converts mono samples between rates by picking the nearest source sample.
pub fn resample(samples: &[f32], from_rate: u32, to_rate: u32) -> Vec<f32> {
    if from_rate == to_rate || from_rate == 0 || to_rate == 0 || samples.is_empty() {
        return samples.to_vec();
    }
    let out_len = (samples.len() as u64 * u64::from(to_rate) / u64::from(from_rate)) as usize;
    (0..out_len)
        .map(|n| {
            let source = (n as u64 * u64::from(from_rate) / u64::from(to_rate)) as usize;
            samples[source.min(samples.len() - 1)]
        })
        .collect()
}

/// Averages interleaved frames down to one channel.
pub fn downmix(interleaved: &[f32], channels: usize) -> Vec<f32> {
    if channels <= 1 {
        return interleaved.to_vec();
    }
    interleaved
        .chunks(channels)
        .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
        .collect()
}
