use crate::PcmBuf;
use anyhow::{anyhow, Result};
use hound::{SampleFormat, WavReader};
use std::io::Cursor;

pub fn is_wav(data: &[u8]) -> bool {
    data.len() >= 12 && &data[0..4] == b"RIFF" && &data[8..12] == b"WAVE"
}

/// Extract 16-bit PCM and its sample rate from a WAV container.
///
/// The `fmt ` and `data` chunks are located by walking chunk headers, so
/// `LIST`/`fact` chunks in between are skipped. Multi-channel audio keeps the
/// first channel. Truncated streams (e.g. a streaming TTS that writes a
/// placeholder data length) yield the samples that are actually present.
pub fn extract_pcm(data: &[u8]) -> Result<(PcmBuf, u32)> {
    let reader = WavReader::new(Cursor::new(data))
        .map_err(|e| anyhow!("invalid wav container: {}", e))?;
    let spec = reader.spec();
    if spec.sample_format != SampleFormat::Int || spec.bits_per_sample != 16 {
        return Err(anyhow!(
            "unsupported wav format: {:?} {} bits",
            spec.sample_format,
            spec.bits_per_sample
        ));
    }
    let channels = spec.channels.max(1) as usize;
    let samples: PcmBuf = reader
        .into_samples::<i16>()
        .map_while(|s| s.ok())
        .step_by(channels)
        .collect();
    Ok((samples, spec.sample_rate))
}
