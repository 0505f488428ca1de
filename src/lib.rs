//! Real-time transport synchronization and tempo-tick scheduling.
//!
//! # Primary API
//!
//! - [`Engine`] / [`EngineConfig`]: Playback engine for one device
//! - [`Producer`]: Period fill callback driven by the musical clock
//! - [`TactScheduler`]: Tempo ticks against fixed hardware periods
//! - [`HardwareHandle`]: Hardware-thread side of a running engine
//! - [`Transport`] / [`OfflineTransport`]: Device seam and memory backend
//! - [`XrunMonitor`]: Underrun/overrun accounting off the real-time path
//!
//! # Example
//!
//! ```ignore
//! use tactus::{Engine, EngineConfig, OfflineTransport, Producer, WriteSlot};
//!
//! struct Silence;
//!
//! impl Producer for Silence {
//!     fn fill(&mut self, slot: &mut WriteSlot<'_>, _ticks: u32, _attacks: &[u32]) {
//!         slot.bytes_mut().fill(0);
//!     }
//! }
//!
//! let mut engine = Engine::new(EngineConfig::default(), Silence)?;
//! let mut transport = OfflineTransport::new();
//! engine.render_offline(&mut transport, 64)?;
//! # Ok::<(), tactus::Error>(())
//! ```

pub mod error;
pub use error::{Error, Result};

pub mod config;
pub use config::{EngineConfig, SampleFormat, StreamParams, XrunPolicy};

pub mod scheduler;
pub use scheduler::{TactScheduler, TickAdvance, DEFAULT_PERIOD};

pub mod gate;
pub use gate::{CallbackGate, SyncState, WaitOutcome};

pub mod ring;
pub use ring::{
    ReadSlot, ReadWait, RingBufferSet, SlotWait, SubBlock, SubstitutePeriod, WriteSlot,
};

pub mod monitor;
pub use monitor::{XrunKind, XrunMonitor, XrunReport, XrunReporter};

pub mod transport;
pub use transport::{OfflineTransport, Transport};

pub mod engine;
pub use engine::{CycleOutcome, Engine, HardwareHandle, PeriodOutcome, Producer};

pub(crate) mod lockfree;
pub use lockfree::{AtomicCounter, AtomicDouble, AtomicFlag};
