use crate::{PcmBuf, Sample};
pub mod pcmu;
pub mod resample;
pub mod wav;

/// The only sample rate carried on the wire.
pub const RTP_SAMPLE_RATE: u32 = 8000;
/// µ-law encoding of a zero-amplitude sample.
pub const ULAW_SILENCE: u8 = 0xFF;

#[derive(Debug, Clone, Copy, Eq, Ord, PartialEq, PartialOrd)]
pub enum CodecType {
    PCMU,
    PCMA,
    TelephoneEvent,
}

pub trait Encoder: Send + Sync {
    /// Encode PCM samples into codec-specific format
    fn encode(&mut self, samples: &[Sample]) -> Vec<u8>;
}

impl CodecType {
    pub fn clock_rate(&self) -> u32 {
        RTP_SAMPLE_RATE
    }
    pub fn payload_type(&self) -> u8 {
        match self {
            CodecType::PCMU => 0,
            CodecType::PCMA => 8,
            CodecType::TelephoneEvent => 101,
        }
    }
    /// `a=rtpmap` encoding name
    pub fn rtpmap_name(&self) -> &str {
        match self {
            CodecType::PCMU => "PCMU",
            CodecType::PCMA => "PCMA",
            CodecType::TelephoneEvent => "telephone-event",
        }
    }
}

/// `floor(duration_ms / 1000 * 8000)` bytes of µ-law silence.
pub fn silence(duration_ms: u32) -> Vec<u8> {
    let len = (duration_ms as u64 * RTP_SAMPLE_RATE as u64 / 1000) as usize;
    vec![ULAW_SILENCE; len]
}

pub fn samples_to_bytes(samples: &[Sample]) -> Vec<u8> {
    samples.iter().flat_map(|s| s.to_le_bytes()).collect()
}

pub fn bytes_to_samples(u8_data: &[u8]) -> PcmBuf {
    u8_data
        .chunks_exact(2)
        .map(|chunk| i16::from_le_bytes([chunk[0], chunk[1]]))
        .collect()
}

/// Turn a synthesized audio payload into 8 kHz µ-law ready for packetization.
///
/// RIFF/WAV input is decoded, resampled and companded. Anything else is
/// treated as raw 16-bit little-endian PCM already at 8 kHz.
pub fn prepare_ulaw(audio: &[u8]) -> anyhow::Result<Vec<u8>> {
    let (samples, sample_rate) = if wav::is_wav(audio) {
        wav::extract_pcm(audio)?
    } else {
        (bytes_to_samples(audio), RTP_SAMPLE_RATE)
    };
    let resampled = resample::resample_to_8k(&samples, sample_rate);
    Ok(pcmu::PcmuEncoder::new().encode(&resampled))
}
