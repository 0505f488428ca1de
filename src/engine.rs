//! Transport engine: ties the scheduler, ring, gate and monitor together.
//!
//! Two threads drive a running engine. The producer thread owns the
//! [`Engine`] and calls [`Engine::run_period`] in a loop: wait for the
//! period-elapsed signal, advance the musical clock, fill the next ring
//! buffer. The hardware thread owns a [`HardwareHandle`] and a
//! [`Transport`] and calls [`HardwareHandle::cycle`] once per device
//! period: announce the period, pull the next ready buffer, hand it to the
//! device. Either side missing its deadline is an xrun, reported through
//! the [`XrunMonitor`] and survived; playback only stops on [`Engine::stop`]
//! or a transport failure.
//!
//! [`Engine::render_offline`] runs the same producer path single-threaded
//! with the gate in pass-through, as fast as the transport accepts periods.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::config::{EngineConfig, SampleFormat, StreamParams};
use crate::gate::{CallbackGate, WaitOutcome};
use crate::lockfree::{AtomicCounter, AtomicDouble, AtomicFlag};
use crate::monitor::{XrunKind, XrunMonitor, XrunReporter};
use crate::ring::{ReadWait, RingBufferSet, SlotWait, WriteSlot};
use crate::scheduler::TactScheduler;
use crate::transport::Transport;
use crate::{Error, Result};

/// Fills one period of audio for the ticks that elapsed in it.
///
/// `attacks` holds one sample offset per tick, marking where within the
/// period each tick boundary falls; it is empty for periods in which the
/// musical clock did not advance.
pub trait Producer {
    fn fill(&mut self, slot: &mut WriteSlot<'_>, ticks: u32, attacks: &[u32]);
}

/// What one producer-side period resolved to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeriodOutcome {
    /// The period was filled and handed over; `ticks` musical ticks elapsed.
    Advanced { ticks: u32 },
    /// No free ring slot within the deadline; the clock did not advance.
    Overrun,
    /// No period-elapsed signal within the deadline; the hardware side is
    /// stalled or not yet running.
    Stalled,
    Shutdown,
}

/// What one hardware-side cycle resolved to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    /// A produced period went out to the device.
    Played,
    /// The deadline passed with nothing ready; substitute bytes went out.
    Underrun,
    Shutdown,
}

/// Playback engine for one device.
pub struct Engine<P: Producer> {
    config: EngineConfig,
    scheduler: Mutex<TactScheduler>,
    ring: Arc<RingBufferSet>,
    gate: Arc<CallbackGate>,
    monitor: XrunMonitor,
    reporter: XrunReporter,
    producer: P,
    running: AtomicFlag,
    /// Tempo mirror; lets `bpm()` avoid the scheduler lock the producer
    /// thread holds during fills.
    bpm: AtomicDouble,
    /// Note offset as of the last produced period, for xrun stamping.
    position: Arc<AtomicCounter>,
    /// Hardware periods played since start.
    periods: Arc<AtomicCounter>,
}

impl<P: Producer> Engine<P> {
    pub fn new(config: EngineConfig, producer: P) -> Result<Self> {
        config.validate()?;

        let scheduler = TactScheduler::new(
            config.params.samplerate,
            config.params.buffer_size,
            config.bpm,
            config.delay_factor,
        )?;
        let ring = Arc::new(RingBufferSet::new(
            &config.params,
            config.ring_count,
            config.sub_block_count,
            config.xrun_policy,
        )?);
        let gate = Arc::new(CallbackGate::new(config.wait_timeout()));
        let monitor = XrunMonitor::new();
        let reporter = monitor.reporter();
        let config_bpm = config.bpm;

        Ok(Self {
            config,
            scheduler: Mutex::new(scheduler),
            ring,
            gate,
            monitor,
            reporter,
            producer,
            running: AtomicFlag::new(false),
            bpm: AtomicDouble::new(config_bpm),
            position: Arc::new(AtomicCounter::default()),
            periods: Arc::new(AtomicCounter::default()),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn is_running(&self) -> bool {
        self.running.get()
    }

    pub fn monitor(&self) -> &XrunMonitor {
        &self.monitor
    }

    /// Negotiate with the transport, open it, and arm the gate and ring.
    ///
    /// When `resume` is set the note offset keeps its position from the
    /// previous run; otherwise it is seeded from the start offset. Obtain
    /// the [`HardwareHandle`] after this call: the ring is rebuilt here to
    /// the negotiated parameters.
    pub fn start<T: Transport>(&mut self, transport: &mut T, resume: bool) -> Result<()> {
        if self.running.get() {
            return Err(Error::AlreadyRunning);
        }

        let negotiated = transport.negotiate(&self.config.params)?;
        self.config.params = negotiated;
        {
            let mut scheduler = self.scheduler.lock();
            scheduler.set_samplerate(negotiated.samplerate)?;
            scheduler.set_buffer_size(negotiated.buffer_size)?;
            scheduler.reset(resume);
            self.position.set(scheduler.note_offset());
        }
        self.ring = Arc::new(RingBufferSet::new(
            &negotiated,
            self.config.ring_count,
            self.config.sub_block_count,
            self.config.xrun_policy,
        )?);

        transport.open(&negotiated)?;

        self.monitor.reset();
        self.periods.reset();
        self.gate.start();
        self.running.set(true);
        Ok(())
    }

    /// Unblock both threads and refuse further periods. Idempotent. The
    /// transport stays with its owner; close it once the hardware thread
    /// has joined.
    ///
    /// Stopping is immediate, not draining: a period already produced but
    /// not yet pulled by the hardware side is abandoned in the ring.
    pub fn stop(&self) {
        self.gate.stop();
        self.ring.shutdown();
        self.running.set(false);
    }

    /// Handle for the hardware thread. Take a fresh one after every
    /// [`Engine::start`].
    pub fn handle(&self) -> HardwareHandle {
        HardwareHandle {
            ring: Arc::clone(&self.ring),
            gate: Arc::clone(&self.gate),
            reporter: self.monitor.reporter(),
            position: Arc::clone(&self.position),
            periods: Arc::clone(&self.periods),
        }
    }

    /// Produce one period: claim the next ring buffer, wait for the
    /// period-elapsed signal, advance the clock, fill, answer with the
    /// finish signal.
    pub fn run_period(&mut self) -> Result<PeriodOutcome> {
        if !self.running.get() {
            return Err(Error::NotRunning);
        }

        let mut slot = match self.ring.acquire_write_slot(self.config.wait_timeout()) {
            SlotWait::Acquired(slot) => slot,
            SlotWait::TimedOut => {
                // Ring full: the hardware side is behind. The clock holds
                // still, since no audio was produced for this period.
                self.reporter
                    .report(XrunKind::Overrun, self.position.get(), self.periods.get());
                self.gate.signal_finish();
                return Ok(PeriodOutcome::Overrun);
            }
            SlotWait::Shutdown => return Ok(PeriodOutcome::Shutdown),
        };

        match self.gate.wait_for_callback() {
            WaitOutcome::Shutdown => {
                slot.cancel();
                return Ok(PeriodOutcome::Shutdown);
            }
            WaitOutcome::TimedOut => {
                slot.cancel();
                return Ok(PeriodOutcome::Stalled);
            }
            WaitOutcome::Signalled => {}
        }

        let ticks = {
            let mut scheduler = self.scheduler.lock();
            let advance = scheduler.tick();
            let ticks = advance.ticks;
            self.producer.fill(&mut slot, ticks, advance.attacks);
            // `advance` borrows the scheduler; read the position only after
            // its last use.
            self.position.set(scheduler.note_offset());
            ticks
        };

        slot.release();
        self.gate.signal_finish();
        Ok(PeriodOutcome::Advanced { ticks })
    }

    /// Render `n_periods` back-to-back through the given transport, as fast
    /// as it accepts them. Returns the total number of ticks elapsed.
    pub fn render_offline<T: Transport>(
        &mut self,
        transport: &mut T,
        n_periods: u64,
    ) -> Result<u64> {
        if self.running.get() {
            return Err(Error::AlreadyRunning);
        }

        let negotiated = transport.negotiate(&self.config.params)?;
        self.config.params = negotiated;
        {
            let mut scheduler = self.scheduler.lock();
            scheduler.set_samplerate(negotiated.samplerate)?;
            scheduler.set_buffer_size(negotiated.buffer_size)?;
            scheduler.reset(false);
        }
        self.ring = Arc::new(RingBufferSet::new(
            &negotiated,
            self.config.ring_count,
            self.config.sub_block_count,
            self.config.xrun_policy,
        )?);

        transport.open(&negotiated)?;
        self.gate.set_pass_through();

        let timeout = self.config.wait_timeout();
        let mut total_ticks = 0u64;
        for _ in 0..n_periods {
            let mut slot = match self.ring.acquire_write_slot(timeout) {
                SlotWait::Acquired(slot) => slot,
                // Single-threaded: every slot we fill is read back below,
                // so the ring cannot fill up or shut down here.
                SlotWait::TimedOut | SlotWait::Shutdown => {
                    return Err(Error::Transport("offline render stalled".into()))
                }
            };

            {
                let mut scheduler = self.scheduler.lock();
                let advance = scheduler.tick();
                total_ticks += advance.ticks as u64;
                self.producer.fill(&mut slot, advance.ticks, advance.attacks);
            }
            slot.release();

            match self.ring.acquire_read_slot(timeout) {
                ReadWait::Acquired(slot) => {
                    transport.write_period(slot.bytes())?;
                }
                ReadWait::Substitute(_) | ReadWait::Shutdown => {
                    return Err(Error::Transport("offline render stalled".into()))
                }
            }
        }

        transport.close()?;
        self.gate.stop();
        Ok(total_ticks)
    }

    /// Change the tempo; takes effect from the next period.
    pub fn set_bpm(&self, bpm: f64) -> Result<()> {
        self.scheduler.lock().set_bpm(bpm)?;
        self.bpm.set(bpm);
        Ok(())
    }

    pub fn set_delay_factor(&self, delay_factor: f64) -> Result<()> {
        self.scheduler.lock().set_delay_factor(delay_factor)
    }

    /// Configure the loop region, inclusive on both edges.
    pub fn set_loop(&self, left: u64, right: u64, enabled: bool) -> Result<()> {
        self.scheduler.lock().set_loop(left, right, enabled)
    }

    /// Seed for the next fresh start.
    pub fn set_start_note_offset(&self, note_offset: u64) {
        self.scheduler.lock().set_start_note_offset(note_offset);
    }

    /// Replace the stream parameters. Rejected while running; buffer
    /// geometry cannot change under an open device.
    pub fn set_stream_params(&mut self, params: StreamParams) -> Result<()> {
        if self.running.get() {
            return Err(Error::AlreadyRunning);
        }
        params.validate()?;
        self.scheduler.lock().set_samplerate(params.samplerate)?;
        self.scheduler.lock().set_buffer_size(params.buffer_size)?;
        self.config.params = params;
        Ok(())
    }

    pub fn set_samplerate(&mut self, samplerate: u32) -> Result<()> {
        let mut params = self.config.params;
        params.samplerate = samplerate;
        self.set_stream_params(params)
    }

    pub fn set_buffer_size(&mut self, buffer_size: u32) -> Result<()> {
        let mut params = self.config.params;
        params.buffer_size = buffer_size;
        self.set_stream_params(params)
    }

    pub fn set_format(&mut self, format: SampleFormat) -> Result<()> {
        let mut params = self.config.params;
        params.format = format;
        self.set_stream_params(params)
    }

    pub fn bpm(&self) -> f64 {
        self.bpm.get()
    }

    pub fn note_offset(&self) -> u64 {
        self.scheduler.lock().note_offset()
    }

    pub fn note_offset_absolute(&self) -> u64 {
        self.scheduler.lock().note_offset_absolute()
    }

    pub fn loop_offset(&self) -> u64 {
        self.scheduler.lock().loop_offset()
    }

    pub fn uptime(&self) -> core::time::Duration {
        self.scheduler.lock().uptime()
    }

    pub fn periods_played(&self) -> u64 {
        self.periods.get()
    }
}

/// Hardware-thread side of a running engine.
///
/// Cheap clones of the shared state; the transport itself stays with the
/// thread that owns it.
pub struct HardwareHandle {
    ring: Arc<RingBufferSet>,
    gate: Arc<CallbackGate>,
    reporter: XrunReporter,
    position: Arc<AtomicCounter>,
    periods: Arc<AtomicCounter>,
}

impl HardwareHandle {
    /// Run one device period: announce it, wait for the producer's answer,
    /// pull the next ready buffer and hand it to the transport.
    ///
    /// A producer that misses the deadline costs an underrun, not a stop;
    /// substitute bytes go out and the next cycle proceeds normally.
    pub fn cycle<T: Transport>(&self, transport: &mut T) -> Result<CycleOutcome> {
        if self.gate.is_shut_down() {
            return Ok(CycleOutcome::Shutdown);
        }

        self.gate.signal_callback();
        if self.gate.wait_for_finish() == WaitOutcome::Shutdown {
            return Ok(CycleOutcome::Shutdown);
        }
        // A finish timeout means the producer is lagging; fall through and
        // let the ring substitute if nothing is ready.

        let timeout = self.gate.timeout();
        match self.ring.acquire_read_slot(timeout) {
            ReadWait::Acquired(slot) => {
                transport.write_period(slot.bytes())?;
                slot.release();
                self.periods.incr();
                Ok(CycleOutcome::Played)
            }
            ReadWait::Substitute(bytes) => {
                self.reporter
                    .report(XrunKind::Underrun, self.position.get(), self.periods.get());
                transport.write_period(&bytes)?;
                self.periods.incr();
                Ok(CycleOutcome::Underrun)
            }
            ReadWait::Shutdown => Ok(CycleOutcome::Shutdown),
        }
    }

    pub fn is_shut_down(&self) -> bool {
        self.gate.is_shut_down()
    }
}
