use super::Encoder;

const BIAS: i32 = 0x84;
const CLIP: i32 = 32635;

pub struct PcmuEncoder {}

impl PcmuEncoder {
    pub fn new() -> Self {
        Self {}
    }
}

impl Default for PcmuEncoder {
    fn default() -> Self {
        Self::new()
    }
}

impl Encoder for PcmuEncoder {
    fn encode(&mut self, samples: &[i16]) -> Vec<u8> {
        samples.iter().map(|sample| linear_to_ulaw(*sample)).collect()
    }
}

/// G.711 µ-law compression of one 16-bit sample.
pub fn linear_to_ulaw(pcm_val: i16) -> u8 {
    // widen first: -32768 has no positive i16 counterpart
    let mut magnitude = pcm_val as i32;
    let sign = if magnitude < 0 {
        magnitude = -magnitude;
        0x80
    } else {
        0x00
    };
    if magnitude > CLIP {
        magnitude = CLIP;
    }
    magnitude += BIAS;

    let mut exponent: i32 = 7;
    let mut mask: i32 = 0x4000;
    while magnitude & mask == 0 && exponent > 0 {
        exponent -= 1;
        mask >>= 1;
    }
    let mantissa = (magnitude >> (exponent + 3)) & 0x0F;
    !((sign | (exponent << 4) | mantissa) as u8)
}
