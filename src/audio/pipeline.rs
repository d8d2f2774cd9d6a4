//! Sample processing between the device callback and the transport
//!
//! Downmixes to mono, converts to PCM 16-bit, optionally resamples to the
//! target rate, and accumulates fixed-duration chunks. The trailing buffer
//! is flushed only on stop, and only when it carries enough non-silent
//! audio to be worth transcribing.

use super::types::AudioChunk;
use rubato::{
    Resampler, SincFixedIn, SincInterpolationParameters, SincInterpolationType, WindowFunction,
};
use tracing::error;

/// Duration of each chunk handed to the transport
pub(crate) const CHUNK_DURATION_MS: u64 = 300;

/// A stop-flush shorter than this is dropped outright
pub(crate) const MIN_FLUSH_SAMPLES: usize = 512;

/// RMS amplitude below which a stop-flush counts as silence
const SILENCE_RMS_THRESHOLD: f64 = 100.0;

/// Number of samples per chunk at the given rate
pub(crate) fn chunk_samples(sample_rate: u32) -> usize {
    (sample_rate as u64 * CHUNK_DURATION_MS / 1000) as usize
}

/// Average interleaved frames down to mono
pub(crate) fn downmix_to_mono(data: &[i16], channels: usize) -> Vec<i16> {
    if channels <= 1 {
        return data.to_vec();
    }
    data.chunks(channels)
        .map(|frame| {
            let sum: i32 = frame.iter().map(|&s| s as i32).sum();
            (sum / channels as i32) as i16
        })
        .collect()
}

/// Convert float samples to PCM 16-bit, clamping out-of-range input
pub(crate) fn f32_to_i16(data: &[f32]) -> Vec<i16> {
    data.iter()
        .map(|&s| (s.clamp(-1.0, 1.0) * 32767.0) as i16)
        .collect()
}

fn rms(samples: &[i16]) -> f64 {
    if samples.is_empty() {
        return 0.0;
    }
    let sum_squares: f64 = samples.iter().map(|&s| (s as f64) * (s as f64)).sum();
    (sum_squares / samples.len() as f64).sqrt()
}

fn is_silence(samples: &[i16]) -> bool {
    rms(samples) < SILENCE_RMS_THRESHOLD
}

/// Accumulates mono samples into fixed-duration chunks
pub(crate) struct Chunker {
    buffer: Vec<i16>,
    chunk_size: usize,
    sample_rate: u32,
}

impl Chunker {
    pub(crate) fn new(sample_rate: u32) -> Self {
        let chunk_size = chunk_samples(sample_rate);
        Self {
            buffer: Vec::with_capacity(chunk_size * 2),
            chunk_size,
            sample_rate,
        }
    }

    /// Buffer samples and return every complete chunk
    pub(crate) fn push(&mut self, samples: &[i16]) -> Vec<AudioChunk> {
        self.buffer.extend_from_slice(samples);
        let mut chunks = Vec::new();
        while self.buffer.len() >= self.chunk_size {
            let samples: Vec<i16> = self.buffer.drain(..self.chunk_size).collect();
            chunks.push(AudioChunk {
                samples,
                sample_rate: self.sample_rate,
            });
        }
        chunks
    }

    /// Drain the trailing partial chunk on stop
    ///
    /// Returns None when the tail is too short or is silence; a fragment
    /// of room noise is not worth a round trip to the STT pipeline.
    pub(crate) fn flush(&mut self) -> Option<AudioChunk> {
        let samples: Vec<i16> = self.buffer.drain(..).collect();
        if samples.len() <= MIN_FLUSH_SAMPLES || is_silence(&samples) {
            return None;
        }
        Some(AudioChunk {
            samples,
            sample_rate: self.sample_rate,
        })
    }
}

/// Streaming resampler from the device rate to the target rate
pub(crate) struct StreamResampler {
    resampler: SincFixedIn<f32>,
    input_buffer: Vec<f32>,
    input_frames: usize,
}

impl StreamResampler {
    pub(crate) fn new(device_rate: u32, target_rate: u32) -> Result<Self, rubato::ResamplerConstructionError> {
        let params = SincInterpolationParameters {
            sinc_len: 256,
            f_cutoff: 0.95,
            interpolation: SincInterpolationType::Linear,
            oversampling_factor: 256,
            window: WindowFunction::BlackmanHarris2,
        };
        let target_chunk = chunk_samples(target_rate);
        let input_frames =
            (target_chunk as f64 * device_rate as f64 / target_rate as f64).ceil() as usize;
        let resampler = SincFixedIn::<f32>::new(
            target_rate as f64 / device_rate as f64,
            2.0,
            params,
            input_frames,
            1, // mono
        )?;
        Ok(Self {
            resampler,
            input_buffer: Vec::with_capacity(input_frames * 2),
            input_frames,
        })
    }

    /// Feed mono samples at the device rate, get samples at the target rate
    pub(crate) fn process(&mut self, samples: &[i16]) -> Vec<i16> {
        self.input_buffer
            .extend(samples.iter().map(|&s| s as f32 / 32768.0));

        let mut output = Vec::new();
        while self.input_buffer.len() >= self.input_frames {
            let input: Vec<f32> = self.input_buffer.drain(..self.input_frames).collect();
            match self.resampler.process(&[input], None) {
                Ok(resampled) => {
                    output.extend(resampled[0].iter().map(|&s| (s.clamp(-1.0, 1.0) * 32767.0) as i16));
                }
                Err(e) => {
                    error!("Resampling error: {}", e);
                }
            }
        }
        output
    }
}
