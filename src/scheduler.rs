//! Tempo-tick scheduling against fixed hardware periods.
//!
//! The hardware delivers periods at `samplerate / buffer_size` Hz while the
//! musical clock ticks at `(bpm / 60) / delay_factor` Hz; the two rates are
//! in general incommensurate. [`TactScheduler`] distributes the fractional
//! remainder across a cycle of [`DEFAULT_PERIOD`] entries so that the summed
//! tick count per cycle is exact — playback never drifts, however long the
//! session runs.

use core::time::Duration;

use crate::{Error, Result};

/// Length of one delay/attack cycle, in hardware periods.
pub const DEFAULT_PERIOD: usize = 64;

/// Ticks elapsed in one hardware period, with the sample offset at which
/// each tick boundary falls.
#[derive(Debug)]
pub struct TickAdvance<'a> {
    pub ticks: u32,
    pub attacks: &'a [u32],
}

/// Per-device musical clock.
///
/// `delay[i]` is the number of hardware periods that must elapse before the
/// tick at cycle slot `i` fires; `attack[i]` is the sample offset within the
/// period at which that tick's boundary falls, so events can start and stop
/// sample-accurately rather than only at period boundaries.
#[derive(Debug, Clone)]
pub struct TactScheduler {
    bpm: f64,
    delay_factor: f64,
    samplerate: u32,
    buffer_size: u32,

    delay: Vec<f64>,
    attack: Vec<u32>,

    tact_counter: f64,
    delay_counter: f64,
    tic_counter: usize,

    note_offset: u64,
    note_offset_absolute: u64,
    start_note_offset: u64,

    loop_left: u64,
    loop_right: u64,
    do_loop: bool,
    loop_offset: u64,

    attack_scratch: Vec<u32>,
}

impl TactScheduler {
    pub fn new(samplerate: u32, buffer_size: u32, bpm: f64, delay_factor: f64) -> Result<Self> {
        validate_rates(samplerate, buffer_size)?;
        validate_tempo(bpm, delay_factor)?;

        let mut scheduler = Self {
            bpm,
            delay_factor,
            samplerate,
            buffer_size,
            delay: vec![0.0; DEFAULT_PERIOD],
            attack: vec![0; DEFAULT_PERIOD],
            tact_counter: 0.0,
            delay_counter: 0.0,
            tic_counter: 0,
            note_offset: 0,
            note_offset_absolute: 0,
            start_note_offset: 0,
            loop_left: 0,
            loop_right: 0,
            do_loop: false,
            loop_offset: 0,
            attack_scratch: Vec::with_capacity(DEFAULT_PERIOD),
        };
        scheduler.rebuild();
        Ok(scheduler)
    }

    /// Hardware periods per musical tick for the current configuration.
    pub fn absolute_delay(&self) -> f64 {
        (self.samplerate as f64 / self.buffer_size as f64)
            / ((self.bpm / 60.0) / self.delay_factor)
    }

    /// Regenerate `delay[]` and `attack[]` from the current parameters.
    ///
    /// The attack table carries the fractional tick-boundary position from
    /// slot to slot; each delay entry is then the frame distance between
    /// consecutive boundaries, in periods. The per-cycle sum telescopes to
    /// exactly `DEFAULT_PERIOD * absolute_delay()`, which is what rules out
    /// long-term drift.
    ///
    /// Resets the cycle phase (`tic_counter`, `delay_counter`); the note
    /// offset is preserved.
    fn rebuild(&mut self) {
        let buffer_size = self.buffer_size as f64;
        let tact_frames = self.absolute_delay() * buffer_size;

        let mut pos = 0.0f64;
        for slot in self.attack.iter_mut() {
            *slot = (pos.floor() as u32).min(self.buffer_size - 1);
            pos = (pos + tact_frames) % buffer_size;
        }

        for i in 0..DEFAULT_PERIOD {
            let next = self.attack[(i + 1) % DEFAULT_PERIOD];
            self.delay[i] =
                (tact_frames + self.attack[i] as f64 - next as f64) / buffer_size;
        }

        self.tic_counter = 0;
        self.delay_counter = 0.0;
    }

    /// Advance the clock by one hardware period.
    ///
    /// Returns how many ticks elapsed and their attack offsets (empty most
    /// periods when the tempo is slower than the period rate).
    pub fn tick(&mut self) -> TickAdvance<'_> {
        self.attack_scratch.clear();
        self.delay_counter += 1.0;

        let mut ticks = 0u32;
        while self.delay_counter >= self.delay[self.tic_counter] {
            self.delay_counter -= self.delay[self.tic_counter];
            self.attack_scratch.push(self.attack[self.tic_counter]);

            self.advance_note_offset();
            self.tact_counter += 1.0;
            self.tic_counter = (self.tic_counter + 1) % DEFAULT_PERIOD;
            ticks += 1;
        }

        TickAdvance {
            ticks,
            attacks: &self.attack_scratch,
        }
    }

    fn advance_note_offset(&mut self) {
        if self.do_loop && self.note_offset + 1 > self.loop_right {
            self.note_offset = self.loop_left;
            self.loop_offset += 1;
        } else {
            self.note_offset += 1;
        }
        self.note_offset_absolute += 1;
    }

    /// Reset counters for a fresh `start()`. When resuming, the note offset
    /// keeps its position; otherwise it is seeded from `start_note_offset`.
    pub fn reset(&mut self, resume: bool) {
        self.tact_counter = 0.0;
        self.delay_counter = 0.0;
        self.tic_counter = 0;
        if !resume {
            self.note_offset = self.start_note_offset;
            self.note_offset_absolute = self.start_note_offset;
            self.loop_offset = 0;
        }
    }

    /// Change the tempo. Rejected values leave the previous configuration
    /// in effect. A mid-playback change regenerates the tables and restarts
    /// the cycle phase, a small timing discontinuity; the note offset is
    /// preserved.
    pub fn set_bpm(&mut self, bpm: f64) -> Result<()> {
        validate_tempo(bpm, self.delay_factor)?;
        self.bpm = bpm;
        self.rebuild();
        Ok(())
    }

    pub fn set_delay_factor(&mut self, delay_factor: f64) -> Result<()> {
        validate_tempo(self.bpm, delay_factor)?;
        self.delay_factor = delay_factor;
        self.rebuild();
        Ok(())
    }

    pub fn set_samplerate(&mut self, samplerate: u32) -> Result<()> {
        validate_rates(samplerate, self.buffer_size)?;
        self.samplerate = samplerate;
        self.rebuild();
        Ok(())
    }

    pub fn set_buffer_size(&mut self, buffer_size: u32) -> Result<()> {
        validate_rates(self.samplerate, buffer_size)?;
        self.buffer_size = buffer_size;
        self.rebuild();
        Ok(())
    }

    /// Configure the loop region, inclusive on both edges.
    pub fn set_loop(&mut self, left: u64, right: u64, enabled: bool) -> Result<()> {
        if right < left {
            return Err(Error::InvalidLoopRange { left, right });
        }
        self.loop_left = left;
        self.loop_right = right;
        self.do_loop = enabled;
        Ok(())
    }

    pub fn bpm(&self) -> f64 {
        self.bpm
    }

    pub fn delay_factor(&self) -> f64 {
        self.delay_factor
    }

    pub fn samplerate(&self) -> u32 {
        self.samplerate
    }

    pub fn buffer_size(&self) -> u32 {
        self.buffer_size
    }

    /// Ticks fired since the cycle phase was last reset.
    pub fn tact_counter(&self) -> f64 {
        self.tact_counter
    }

    pub fn delay_table(&self) -> &[f64] {
        &self.delay
    }

    pub fn attack_table(&self) -> &[u32] {
        &self.attack
    }

    /// Musical position, wrapped at the loop region.
    pub fn note_offset(&self) -> u64 {
        self.note_offset
    }

    /// Musical position ignoring the loop; never wraps.
    pub fn note_offset_absolute(&self) -> u64 {
        self.note_offset_absolute
    }

    pub fn set_note_offset(&mut self, note_offset: u64) {
        self.note_offset = note_offset;
    }

    pub fn start_note_offset(&self) -> u64 {
        self.start_note_offset
    }

    pub fn set_start_note_offset(&mut self, note_offset: u64) {
        self.start_note_offset = note_offset;
    }

    /// How many times the loop has wrapped since the last fresh start.
    pub fn loop_offset(&self) -> u64 {
        self.loop_offset
    }

    pub fn loop_region(&self) -> (u64, u64, bool) {
        (self.loop_left, self.loop_right, self.do_loop)
    }

    /// Elapsed musical time since offset zero, from the absolute offset.
    pub fn uptime(&self) -> Duration {
        let ticks_per_second = (self.bpm / 60.0) / self.delay_factor;
        Duration::from_secs_f64(self.note_offset_absolute as f64 / ticks_per_second)
    }
}

fn validate_rates(samplerate: u32, buffer_size: u32) -> Result<()> {
    if samplerate == 0 {
        return Err(Error::InvalidConfig("samplerate must be non-zero".into()));
    }
    if buffer_size == 0 {
        return Err(Error::InvalidConfig("buffer_size must be non-zero".into()));
    }
    Ok(())
}

fn validate_tempo(bpm: f64, delay_factor: f64) -> Result<()> {
    if !(bpm.is_finite() && bpm > 0.0) {
        return Err(Error::InvalidTempo(bpm));
    }
    if !(delay_factor.is_finite() && delay_factor > 0.0) {
        return Err(Error::InvalidDelayFactor(delay_factor));
    }
    Ok(())
}
