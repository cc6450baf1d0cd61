//! Raw block to engine frame conversion
//!
//! Picks one channel out of an interleaved block, scales it down by an
//! arithmetic right shift and re-centers it with a fixed DC offset. Output
//! saturates at the `i16` range.

use crate::engine::{FRAME_LEN, Frame};
use crate::{Error, Result};

/// Attenuation for the reference I2S microphone board
pub const MIC_ATTENUATION: u32 = 14;

/// DC offset for the reference I2S microphone board
pub const MIC_DC_OFFSET: i32 = 1650;

/// Interleave stride of the reference I2S microphone board
pub const MIC_STRIDE: usize = 3;

/// Normalizer parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NormalizerConfig {
    /// Samples per interleave group
    pub stride: usize,
    /// Channel within each group that carries the microphone
    pub channel: usize,
    /// Right shift applied to each raw sample
    pub attenuation: u32,
    /// Added after the shift
    pub dc_offset: i32,
}

impl Default for NormalizerConfig {
    fn default() -> Self {
        Self {
            stride: MIC_STRIDE,
            channel: 0,
            attenuation: MIC_ATTENUATION,
            dc_offset: MIC_DC_OFFSET,
        }
    }
}

/// Converts raw blocks into frames
#[derive(Debug, Clone)]
pub struct FrameNormalizer {
    config: NormalizerConfig,
    block_len: usize,
}

impl FrameNormalizer {
    /// Normalizer for blocks of `block_len` raw samples
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the block cannot hold a full frame at
    /// the given stride, the channel is outside the stride, or the shift is
    /// not below 32
    pub fn new(config: NormalizerConfig, block_len: usize) -> Result<Self> {
        if config.stride == 0 {
            return Err(Error::Config("stride must be at least 1".to_string()));
        }
        if config.channel >= config.stride {
            return Err(Error::Config(format!(
                "channel {} outside stride {}",
                config.channel, config.stride
            )));
        }
        if config.attenuation >= 32 {
            return Err(Error::Config(format!(
                "attenuation {} must be below 32",
                config.attenuation
            )));
        }
        if block_len < FRAME_LEN * config.stride {
            return Err(Error::Config(format!(
                "block of {block_len} samples cannot hold {FRAME_LEN} frames at stride {}",
                config.stride
            )));
        }

        Ok(Self { config, block_len })
    }

    /// Raw samples a block needs for one frame at `stride`
    #[must_use]
    pub const fn block_len_for(stride: usize) -> usize {
        FRAME_LEN * stride
    }

    /// Parameters in use
    #[must_use]
    pub const fn config(&self) -> &NormalizerConfig {
        &self.config
    }

    /// Convert one block
    ///
    /// Deterministic: the same block always yields the same frame.
    ///
    /// # Errors
    ///
    /// Returns a configuration error if the block is shorter than configured
    pub fn normalize(&self, block: &[i32]) -> Result<Frame> {
        if block.len() < self.block_len {
            return Err(Error::Config(format!(
                "short block: {} of {} samples",
                block.len(),
                self.block_len
            )));
        }

        let NormalizerConfig {
            stride,
            channel,
            attenuation,
            dc_offset,
        } = self.config;

        let mut frame = Frame::silence();
        let picked = block.iter().skip(channel).step_by(stride);
        for (out, &raw) in frame.samples_mut().iter_mut().zip(picked) {
            *out = saturate((raw >> attenuation).saturating_add(dc_offset));
        }
        Ok(frame)
    }
}

#[allow(clippy::cast_possible_truncation)]
fn saturate(value: i32) -> i16 {
    value.clamp(i32::from(i16::MIN), i32::from(i16::MAX)) as i16
}

/// Level statistics for one frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameStats {
    /// Average sample value, the residual DC
    pub mean: i32,
    /// Average squared sample value
    pub mean_square: u32,
    /// Largest absolute sample
    pub peak: u16,
}

impl FrameStats {
    /// Measure a frame
    #[must_use]
    #[allow(clippy::cast_possible_truncation, clippy::cast_possible_wrap)]
    pub fn of(frame: &Frame) -> Self {
        let samples = frame.samples();
        let sum: i64 = samples.iter().map(|&s| i64::from(s)).sum();
        let sum_sq: u64 = samples
            .iter()
            .map(|&s| u64::from(s.unsigned_abs()).pow(2))
            .sum();
        let peak = samples.iter().map(|s| s.unsigned_abs()).max().unwrap_or(0);

        Self {
            mean: (sum / FRAME_LEN as i64) as i32,
            mean_square: (sum_sq / FRAME_LEN as u64) as u32,
            peak,
        }
    }
}
