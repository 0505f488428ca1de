//! Hardware transport seam.
//!
//! The engine never talks to a device directly; it hands finished periods
//! to a [`Transport`]. Backends negotiate the stream parameters they can
//! actually honor, and the engine reconfigures itself to the negotiated
//! values before starting.

use std::collections::VecDeque;

use crate::config::StreamParams;
use crate::{Error, Result};

/// One full-duplex period-oriented audio endpoint.
pub trait Transport {
    /// Open the device with the given (already negotiated) parameters.
    fn open(&mut self, params: &StreamParams) -> Result<()>;

    /// Clamp the requested parameters to what the device supports.
    fn negotiate(&mut self, requested: &StreamParams) -> Result<StreamParams>;

    /// Deliver one period of interleaved output. Blocks for the backend's
    /// natural period pacing, if it has any.
    fn write_period(&mut self, bytes: &[u8]) -> Result<()>;

    /// Capture one period of interleaved input.
    ///
    /// The engine's period loop is output-only and never calls this;
    /// full-duplex backends and capture frontends drive it directly.
    fn read_period(&mut self, bytes: &mut [u8]) -> Result<()>;

    fn close(&mut self) -> Result<()>;
}

/// In-memory transport for offline export and tests. Accepts any
/// parameters, runs with no pacing, and keeps everything written.
#[derive(Debug, Default)]
pub struct OfflineTransport {
    params: Option<StreamParams>,
    rendered: Vec<u8>,
    capture: VecDeque<u8>,
    periods_written: u64,
}

impl OfflineTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue bytes to be served by subsequent `read_period` calls.
    pub fn queue_capture(&mut self, bytes: &[u8]) {
        self.capture.extend(bytes);
    }

    /// Everything written so far, in delivery order.
    pub fn rendered(&self) -> &[u8] {
        &self.rendered
    }

    pub fn periods_written(&self) -> u64 {
        self.periods_written
    }

    pub fn is_open(&self) -> bool {
        self.params.is_some()
    }

    fn require_open(&self) -> Result<&StreamParams> {
        self.params
            .as_ref()
            .ok_or_else(|| Error::Transport("offline transport is not open".into()))
    }
}

impl Transport for OfflineTransport {
    fn open(&mut self, params: &StreamParams) -> Result<()> {
        params.validate()?;
        self.params = Some(*params);
        Ok(())
    }

    fn negotiate(&mut self, requested: &StreamParams) -> Result<StreamParams> {
        requested.validate()?;
        Ok(*requested)
    }

    fn write_period(&mut self, bytes: &[u8]) -> Result<()> {
        let params = self.require_open()?;
        if bytes.len() != params.period_bytes() {
            return Err(Error::Transport(format!(
                "period size mismatch: got {} bytes, expected {}",
                bytes.len(),
                params.period_bytes()
            )));
        }
        self.rendered.extend_from_slice(bytes);
        self.periods_written += 1;
        Ok(())
    }

    fn read_period(&mut self, bytes: &mut [u8]) -> Result<()> {
        let params = self.require_open()?;
        if bytes.len() != params.period_bytes() {
            return Err(Error::Transport(format!(
                "period size mismatch: got {} bytes, expected {}",
                bytes.len(),
                params.period_bytes()
            )));
        }
        for byte in bytes.iter_mut() {
            *byte = self.capture.pop_front().unwrap_or(0);
        }
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.params = None;
        Ok(())
    }
}
