//! Property tests for the tempo-tick tables: per-cycle exactness, bounded
//! deviation from the ideal tick rate over long runs, and loop arithmetic.

use approx::relative_eq;
use proptest::prelude::*;

use tactus::{TactScheduler, DEFAULT_PERIOD};

fn samplerates() -> impl Strategy<Value = u32> {
    prop::sample::select(vec![22050u32, 44100, 48000, 96000, 192000])
}

fn buffer_sizes() -> impl Strategy<Value = u32> {
    prop::sample::select(vec![256u32, 480, 512, 1024, 2048])
}

fn delay_factors() -> impl Strategy<Value = f64> {
    prop::sample::select(vec![0.25f64, 0.5, 1.0])
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// The delay table telescopes: one full cycle sums to exactly
    /// `DEFAULT_PERIOD` ideal tick intervals, whatever the parameters.
    #[test]
    fn delay_cycle_sum_is_exact(
        samplerate in samplerates(),
        buffer_size in buffer_sizes(),
        bpm in 30.0f64..300.0,
        delay_factor in delay_factors(),
    ) {
        let scheduler = TactScheduler::new(samplerate, buffer_size, bpm, delay_factor).unwrap();
        let sum: f64 = scheduler.delay_table().iter().sum();
        let expected = DEFAULT_PERIOD as f64 * scheduler.absolute_delay();
        prop_assert!(relative_eq!(sum, expected, max_relative = 1e-9),
            "sum {} vs {}", sum, expected);
    }

    /// Every attack offset stays inside the period, and the first tick of a
    /// fresh table lands on the first frame.
    #[test]
    fn attacks_stay_inside_period(
        samplerate in samplerates(),
        buffer_size in buffer_sizes(),
        bpm in 30.0f64..300.0,
        delay_factor in delay_factors(),
    ) {
        let scheduler = TactScheduler::new(samplerate, buffer_size, bpm, delay_factor).unwrap();
        prop_assert_eq!(scheduler.attack_table()[0], 0);
        for &attack in scheduler.attack_table() {
            prop_assert!(attack < buffer_size);
        }
    }

    /// Over 10k periods the tick count never drifts from the ideal rate by
    /// more than the cycle-boundary rounding slack.
    #[test]
    fn long_run_tick_count_never_drifts(
        samplerate in samplerates(),
        buffer_size in buffer_sizes(),
        bpm in 30.0f64..300.0,
        delay_factor in delay_factors(),
    ) {
        let mut scheduler =
            TactScheduler::new(samplerate, buffer_size, bpm, delay_factor).unwrap();

        let periods = 10_000u64;
        let mut total = 0u64;
        for _ in 0..periods {
            let advance = scheduler.tick();
            prop_assert_eq!(advance.attacks.len(), advance.ticks as usize);
            total += advance.ticks as u64;
        }

        let expected = periods as f64 / scheduler.absolute_delay();
        let slack = 4.0 / scheduler.absolute_delay() + 2.0;
        prop_assert!(
            (total as f64 - expected).abs() <= slack,
            "{} ticks over {} periods, expected {:.3} (slack {:.3})",
            total, periods, expected, slack
        );
        prop_assert_eq!(scheduler.note_offset_absolute(), total);
    }

    /// Identical parameters always produce identical tables, and rebuilding
    /// in place changes nothing.
    #[test]
    fn tables_are_deterministic(
        samplerate in samplerates(),
        buffer_size in buffer_sizes(),
        bpm in 30.0f64..300.0,
        delay_factor in delay_factors(),
    ) {
        let a = TactScheduler::new(samplerate, buffer_size, bpm, delay_factor).unwrap();
        let mut b = TactScheduler::new(samplerate, buffer_size, bpm, delay_factor).unwrap();
        b.set_bpm(bpm).unwrap();

        prop_assert_eq!(a.delay_table(), b.delay_table());
        prop_assert_eq!(a.attack_table(), b.attack_table());
    }

    /// With the loop enabled, the wrapped offset is plain modular
    /// arithmetic over the inclusive region and the absolute offset keeps
    /// counting straight through.
    #[test]
    fn loop_arithmetic_is_modular(
        loop_right in 1u64..500,
        ticks in 0u64..2000,
    ) {
        // 48000 / 480 periods/s against 6000 BPM at factor 1.0: exactly one
        // tick per period.
        let mut scheduler = TactScheduler::new(48000, 480, 6000.0, 1.0).unwrap();
        scheduler.set_loop(0, loop_right, true).unwrap();

        for _ in 0..ticks {
            scheduler.tick();
        }

        let span = loop_right + 1;
        prop_assert_eq!(scheduler.note_offset(), ticks % span);
        prop_assert_eq!(scheduler.loop_offset(), ticks / span);
        prop_assert_eq!(scheduler.note_offset_absolute(), ticks);
    }
}
