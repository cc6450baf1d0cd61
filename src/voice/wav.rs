//! WAV file replay and recording

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use hound::{SampleFormat, WavReader, WavSpec, WavWriter};

use crate::engine::FRAME_MS;
use crate::voice::capture::{AudioSource, SAMPLE_RATE, left_justify};
use crate::voice::ring::BlockProducer;
use crate::{Error, Result};

/// Replays a WAV file into the ring at (a multiple of) real time
///
/// The last partial block is padded with silence. The producer is dropped
/// when the file ends, which closes the ring.
pub struct WavSource {
    path: PathBuf,
    spec: WavSpec,
    speed: f32,
    stop: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

impl WavSource {
    /// Open `path` for replay
    ///
    /// # Errors
    ///
    /// Returns error if the file cannot be read, is not 16kHz, or `speed` is
    /// not positive
    pub fn open(path: &Path, speed: f32) -> Result<Self> {
        if !(speed.is_finite() && speed > 0.0) {
            return Err(Error::Config(format!("replay speed must be positive, got {speed}")));
        }

        let spec = WavReader::open(path)?.spec();
        if spec.sample_rate != SAMPLE_RATE {
            return Err(Error::Config(format!(
                "{} is {} Hz, expected {SAMPLE_RATE} Hz",
                path.display(),
                spec.sample_rate
            )));
        }

        tracing::debug!(
            path = %path.display(),
            channels = spec.channels,
            bits = spec.bits_per_sample,
            speed,
            "wav source opened"
        );

        Ok(Self {
            path: path.to_path_buf(),
            spec,
            speed,
            stop: Arc::new(AtomicBool::new(false)),
            worker: None,
        })
    }

    /// Whether the replay thread is still running
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.worker.as_ref().is_some_and(|w| !w.is_finished())
    }
}

impl AudioSource for WavSource {
    fn channels(&self) -> u16 {
        self.spec.channels
    }

    fn start(&mut self, producer: BlockProducer) -> Result<()> {
        self.stop();
        self.stop.store(false, Ordering::Release);

        let reader = WavReader::open(&self.path)?;
        let stop = Arc::clone(&self.stop);
        let period = Duration::from_millis(u64::from(FRAME_MS)).div_f32(self.speed);

        let worker = std::thread::Builder::new()
            .name("wav-replay".to_string())
            .spawn(move || replay(reader, producer, period, &stop))?;
        self.worker = Some(worker);

        tracing::debug!(path = %self.path.display(), "wav replay started");
        Ok(())
    }

    fn stop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                tracing::warn!("wav replay thread panicked");
            }
            tracing::debug!("wav replay stopped");
        }
    }

    fn describe(&self) -> String {
        format!("{} ({} ch, x{})", self.path.display(), self.spec.channels, self.speed)
    }
}

impl Drop for WavSource {
    fn drop(&mut self) {
        self.stop();
    }
}

fn replay<R: std::io::Read>(
    mut reader: WavReader<R>,
    mut producer: BlockProducer,
    period: Duration,
    stop: &AtomicBool,
) {
    let spec = reader.spec();
    let block_len = producer.block_len();
    let mut samples = raw_samples(&mut reader, spec);
    let mut block = vec![0i32; block_len];
    let mut deadline = Instant::now();
    let mut blocks = 0u64;

    loop {
        if stop.load(Ordering::Acquire) {
            break;
        }

        let mut filled = 0;
        for (dst, src) in block.iter_mut().zip(samples.by_ref()) {
            match src {
                Ok(sample) => *dst = sample,
                Err(e) => {
                    tracing::warn!(error = %e, "wav decode error, ending replay");
                    return;
                }
            }
            filled += 1;
        }
        if filled == 0 {
            break;
        }
        block[filled..].fill(0);

        deadline += period;
        if let Some(wait) = deadline.checked_duration_since(Instant::now()) {
            std::thread::sleep(wait);
        }
        producer.write(&block);
        blocks += 1;
    }

    tracing::debug!(blocks, "wav replay finished");
}

/// Left-justified 32-bit samples regardless of the file's format
fn raw_samples<'a, R: std::io::Read + 'a>(
    reader: &'a mut WavReader<R>,
    spec: WavSpec,
) -> Box<dyn Iterator<Item = hound::Result<i32>> + 'a> {
    match spec.sample_format {
        SampleFormat::Float => Box::new(reader.samples::<f32>().map(|s| s.map(left_justify))),
        SampleFormat::Int => {
            let shift = 32u32.saturating_sub(u32::from(spec.bits_per_sample));
            Box::new(reader.samples::<i32>().map(move |s| s.map(|v| v << shift)))
        }
    }
}

/// Write mono 16-bit samples as a WAV file
///
/// # Errors
///
/// Returns error if the file cannot be written
pub fn write_wav(path: &Path, samples: &[i16], sample_rate: u32) -> Result<()> {
    let spec = WavSpec {
        channels: 1,
        sample_rate,
        bits_per_sample: 16,
        sample_format: SampleFormat::Int,
    };

    let mut writer = WavWriter::create(path, spec)?;
    for &sample in samples {
        writer.write_sample(sample)?;
    }
    writer.finalize()?;
    Ok(())
}
