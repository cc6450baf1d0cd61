//! Audio sources feeding the block ring

use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use cpal::{Device, SampleRate, Stream, StreamConfig};

use crate::voice::ring::{BlockProducer, FrameSource};
use crate::{Error, Result};

/// Sample rate the recognizer expects (16kHz)
pub const SAMPLE_RATE: u32 = 16000;

/// Samples converted per step inside the driver callback
const CHUNK: usize = 512;

/// Something that fills a [`BlockProducer`] with interleaved raw samples
///
/// Raw samples are left-justified 32-bit values, the way an I2S peripheral
/// delivers them.
pub trait AudioSource {
    /// Interleaved channels per sample group
    fn channels(&self) -> u16;

    /// Begin delivering audio into `producer`
    ///
    /// # Errors
    ///
    /// Returns error if the source cannot be started
    fn start(&mut self, producer: BlockProducer) -> Result<()>;

    /// Stop delivering audio and release the producer
    fn stop(&mut self);

    /// Stop, then start again with a fresh producer from `frames`
    ///
    /// The old producer is released before the ring is reconnected, so no
    /// block it had begun can hold a slot.
    ///
    /// # Errors
    ///
    /// Returns error if the source cannot be started again
    fn restart(&mut self, frames: &mut FrameSource) -> Result<()> {
        self.stop();
        self.start(frames.reconnect())
    }

    /// Human readable name for logs
    fn describe(&self) -> String;
}

/// Live capture from the default input device
pub struct MicSource {
    device: Device,
    config: StreamConfig,
    stream: Option<Stream>,
}

impl MicSource {
    /// Open the default input device at [`SAMPLE_RATE`]
    ///
    /// With `channels` set, only configurations with that channel count are
    /// considered; otherwise the narrowest one is used.
    ///
    /// # Errors
    ///
    /// Returns error if audio device cannot be opened
    pub fn new(channels: Option<u16>) -> Result<Self> {
        let host = cpal::default_host();

        let device = host
            .default_input_device()
            .ok_or_else(|| Error::Audio("no input device available".to_string()))?;

        let supported_config = device
            .supported_input_configs()
            .map_err(|e| Error::Audio(e.to_string()))?
            .filter(|c| {
                channels.is_none_or(|n| c.channels() == n)
                    && c.min_sample_rate() <= SampleRate(SAMPLE_RATE)
                    && c.max_sample_rate() >= SampleRate(SAMPLE_RATE)
            })
            .min_by_key(cpal::SupportedStreamConfigRange::channels)
            .ok_or_else(|| Error::Audio("no suitable audio config found".to_string()))?;

        let config = supported_config
            .with_sample_rate(SampleRate(SAMPLE_RATE))
            .config();

        tracing::debug!(
            device = %device.name().unwrap_or_default(),
            sample_rate = SAMPLE_RATE,
            channels = config.channels,
            "microphone opened"
        );

        Ok(Self {
            device,
            config,
            stream: None,
        })
    }

    /// Check if currently capturing
    #[must_use]
    pub const fn is_capturing(&self) -> bool {
        self.stream.is_some()
    }
}

impl AudioSource for MicSource {
    fn channels(&self) -> u16 {
        self.config.channels
    }

    fn start(&mut self, mut producer: BlockProducer) -> Result<()> {
        if self.is_capturing() {
            return Ok(());
        }

        let faults = producer.fault_reporter();
        let stream = self
            .device
            .build_input_stream(
                &self.config,
                move |data: &[f32], _: &cpal::InputCallbackInfo| {
                    let mut raw = [0i32; CHUNK];
                    for chunk in data.chunks(CHUNK) {
                        for (dst, &src) in raw.iter_mut().zip(chunk) {
                            *dst = left_justify(src);
                        }
                        producer.write(&raw[..chunk.len()]);
                    }
                },
                move |err| {
                    tracing::error!(error = %err, "audio capture error");
                    faults.report(err.to_string());
                },
                None,
            )
            .map_err(|e| Error::Audio(e.to_string()))?;

        stream.play().map_err(|e| Error::Audio(e.to_string()))?;
        self.stream = Some(stream);

        tracing::debug!("audio capture started");
        Ok(())
    }

    fn stop(&mut self) {
        if let Some(stream) = self.stream.take() {
            drop(stream);
            tracing::debug!("audio capture stopped");
        }
    }

    fn describe(&self) -> String {
        format!(
            "microphone {} ({} ch)",
            self.device.name().unwrap_or_default(),
            self.config.channels
        )
    }
}

/// Scale a float sample to the full `i32` range
#[allow(clippy::cast_possible_truncation)]
pub(crate) fn left_justify(sample: f32) -> i32 {
    (f64::from(sample.clamp(-1.0, 1.0)) * f64::from(i32::MAX)) as i32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_left_justify() {
        assert_eq!(left_justify(0.0), 0);
        assert_eq!(left_justify(1.0), i32::MAX);
        assert_eq!(left_justify(-1.0), -i32::MAX);
        assert_eq!(left_justify(4.0), i32::MAX);
        assert_eq!(left_justify(0.5) >> 16, 16383);
    }
}
