use super::RTP_SAMPLE_RATE;

/// Nearest-neighbour decimation: output sample `i` is input sample
/// `floor(i * input_rate / output_rate)`.
///
/// Lossy and not phase-accurate. Kept bit-compatible with the audio the rest
/// of the pipeline was tuned against.
pub fn resample(input: &[i16], input_sample_rate: u32, output_sample_rate: u32) -> Vec<i16> {
    if input_sample_rate == output_sample_rate || input_sample_rate == 0 {
        return input.to_vec();
    }
    let output_len =
        (input.len() as u64 * output_sample_rate as u64 / input_sample_rate as u64) as usize;
    (0..output_len)
        .filter_map(|i| {
            let src = (i as u64 * input_sample_rate as u64 / output_sample_rate as u64) as usize;
            input.get(src).copied()
        })
        .collect()
}

pub fn resample_to_8k(input: &[i16], input_sample_rate: u32) -> Vec<i16> {
    resample(input, input_sample_rate, RTP_SAMPLE_RATE)
}
