use rubato::{FastFixedIn, PolynomialDegree, Resampler};

/// Frames per resampler input chunk.
pub const INPUT_CHUNK_SIZE: usize = 1024;

/// Creates a resampler to convert between audio sample rates.
pub fn create_resampler(
    in_sampling_rate: f64,
    out_sampling_rate: f64,
    chunk_size: usize,
) -> anyhow::Result<FastFixedIn<f32>> {
    let resampler = FastFixedIn::<f32>::new(
        out_sampling_rate / in_sampling_rate,
        1.0,
        PolynomialDegree::Cubic,
        chunk_size,
        1,
    )?;
    Ok(resampler)
}

/// Averages interleaved frames down to one channel.
pub fn downmix(data: &[f32], channels: usize) -> Vec<f32> {
    if channels <= 1 {
        return data.to_vec();
    }
    data.chunks(channels)
        .map(|frame| frame.iter().sum::<f32>() / channels as f32)
        .collect()
}

/// Splits a slice of audio samples into fixed-size chunks, zero-padding the
/// last one.
pub fn split_for_chunks(samples: &[f32], chunk_size: usize) -> Vec<Vec<f32>> {
    samples
        .chunks(chunk_size)
        .map(|chunk| {
            let mut chunk = chunk.to_vec();
            chunk.resize(chunk_size, 0.0);
            chunk
        })
        .collect()
}

/// Root mean square level of a buffer; 0.0 for an empty one.
pub fn rms(samples: &[f32]) -> f32 {
    if samples.is_empty() {
        return 0.0;
    }
    (samples.iter().map(|s| s * s).sum::<f32>() / samples.len() as f32).sqrt()
}

/// Feeds arbitrary-sized mono buffers through a fixed-chunk resampler.
///
/// When both rates match the samples pass straight through.
pub struct StreamResampler {
    resampler: Option<FastFixedIn<f32>>,
    ratio: f64,
    pending: Vec<f32>,
    consumed: usize,
    produced: usize,
}

impl StreamResampler {
    pub fn new(in_rate: u32, out_rate: u32) -> anyhow::Result<Self> {
        let resampler = if in_rate == out_rate {
            None
        } else {
            Some(create_resampler(in_rate as f64, out_rate as f64, INPUT_CHUNK_SIZE)?)
        };
        Ok(Self {
            resampler,
            ratio: out_rate as f64 / in_rate as f64,
            pending: Vec::with_capacity(INPUT_CHUNK_SIZE * 2),
            consumed: 0,
            produced: 0,
        })
    }

    /// Resamples every complete chunk buffered so far.
    pub fn push(&mut self, samples: &[f32]) -> Vec<f32> {
        self.consumed += samples.len();
        let Some(resampler) = self.resampler.as_mut() else {
            self.produced += samples.len();
            return samples.to_vec();
        };

        self.pending.extend_from_slice(samples);
        let mut out = Vec::new();
        while self.pending.len() >= INPUT_CHUNK_SIZE {
            let chunk: Vec<f32> = self.pending.drain(..INPUT_CHUNK_SIZE).collect();
            match resampler.process(&[chunk.as_slice()], None) {
                Ok(resampled) => {
                    if let Some(channel) = resampled.first() {
                        out.extend_from_slice(channel);
                    }
                }
                Err(e) => tracing::warn!("Failed to resample audio chunk: {:?}", e),
            }
        }
        self.produced += out.len();
        out
    }

    /// Pushes out the buffered tail, padded with silence and trimmed back to
    /// the length the input implies.
    pub fn flush(&mut self) -> Vec<f32> {
        if self.pending.is_empty() || self.resampler.is_none() {
            return Vec::new();
        }
        let tail = split_for_chunks(&std::mem::take(&mut self.pending), INPUT_CHUNK_SIZE);
        let mut out = Vec::new();
        if let Some(resampler) = self.resampler.as_mut() {
            for chunk in tail {
                if let Ok(resampled) = resampler.process(&[chunk.as_slice()], None) {
                    if let Some(channel) = resampled.first() {
                        out.extend_from_slice(channel);
                    }
                }
            }
        }

        let expected = (self.consumed as f64 * self.ratio).round() as usize;
        out.truncate(expected.saturating_sub(self.produced));
        self.produced += out.len();
        out
    }
}
