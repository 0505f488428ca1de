//! Stream and engine configuration.

use core::time::Duration;

use crate::{Error, Result};

/// Sample word format exchanged with the hardware transport.
///
/// 24-bit samples travel in 32-bit words, as every supported backend
/// delivers them that way.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SampleFormat {
    S8,
    #[default]
    S16,
    S24,
    S32,
    F32,
    F64,
}

impl SampleFormat {
    /// Size of one sample word in bytes.
    pub fn bytes_per_sample(&self) -> usize {
        match self {
            SampleFormat::S8 => 1,
            SampleFormat::S16 => 2,
            SampleFormat::S24 | SampleFormat::S32 | SampleFormat::F32 => 4,
            SampleFormat::F64 => 8,
        }
    }
}

/// Negotiable hardware stream parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamParams {
    pub format: SampleFormat,
    pub channels: u32,
    pub samplerate: u32,
    pub buffer_size: u32,
}

impl Default for StreamParams {
    fn default() -> Self {
        Self {
            format: SampleFormat::S16,
            channels: 2,
            samplerate: 44100,
            buffer_size: 1024,
        }
    }
}

impl StreamParams {
    /// Bytes in one hardware period.
    pub fn period_bytes(&self) -> usize {
        self.buffer_size as usize * self.channels as usize * self.format.bytes_per_sample()
    }

    /// Wall-clock duration of one hardware period.
    pub fn period_duration(&self) -> Duration {
        Duration::from_secs_f64(self.buffer_size as f64 / self.samplerate as f64)
    }

    pub fn validate(&self) -> Result<()> {
        if self.samplerate < 8000 || self.samplerate > 384_000 {
            return Err(Error::InvalidConfig(format!(
                "samplerate {} out of range (8000-384000 Hz)",
                self.samplerate
            )));
        }
        if self.buffer_size == 0 {
            return Err(Error::InvalidConfig("buffer_size must be non-zero".into()));
        }
        if self.channels == 0 {
            return Err(Error::InvalidConfig("channels must be non-zero".into()));
        }
        Ok(())
    }
}

/// What the hardware side hands the driver when a period deadline is missed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum XrunPolicy {
    /// Substitute a zeroed period.
    #[default]
    Silence,
    /// Re-serve the most recently delivered period unchanged.
    RepeatLast,
}

/// Configuration for one [`Engine`](crate::Engine) instance.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub params: StreamParams,
    /// Musical tempo in beats per minute.
    pub bpm: f64,
    /// Tact subdivision factor; scales the tick rate relative to the beat.
    pub delay_factor: f64,
    /// Rotating buffers in the ring. At least 3; double buffering is
    /// insufficient once thread-scheduling jitter is accounted for.
    pub ring_count: usize,
    /// Independently lockable regions per buffer.
    pub sub_block_count: usize,
    pub xrun_policy: XrunPolicy,
    /// Bounded wait fallback, in periods, for every blocking rendezvous.
    pub wait_timeout_periods: u32,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            params: StreamParams::default(),
            bpm: 120.0,
            delay_factor: 0.25,
            ring_count: 4,
            sub_block_count: 16,
            xrun_policy: XrunPolicy::default(),
            wait_timeout_periods: 4,
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<()> {
        self.params.validate()?;
        if !(self.bpm.is_finite() && self.bpm > 0.0) {
            return Err(Error::InvalidTempo(self.bpm));
        }
        if !(self.delay_factor.is_finite() && self.delay_factor > 0.0) {
            return Err(Error::InvalidDelayFactor(self.delay_factor));
        }
        if self.ring_count < 3 {
            return Err(Error::InvalidConfig(format!(
                "ring_count {} too small (minimum 3)",
                self.ring_count
            )));
        }
        if self.sub_block_count == 0 {
            return Err(Error::InvalidConfig("sub_block_count must be non-zero".into()));
        }
        if self.wait_timeout_periods == 0 {
            return Err(Error::InvalidConfig(
                "wait_timeout_periods must be non-zero".into(),
            ));
        }
        Ok(())
    }

    /// Bounded wait deadline for one rendezvous.
    pub fn wait_timeout(&self) -> Duration {
        self.params.period_duration() * self.wait_timeout_periods
    }
}
