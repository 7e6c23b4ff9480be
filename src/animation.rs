use std::{collections::HashMap, f64::consts::PI};

use crate::scenes::scene::{ChannelId, DmxData, UniverseId};

/// Seed for the channel permutation that spreads effect phases across a scene.
/// Changing it changes every stored scene's look.
pub const PHASE_SEED: usize = 1000;

const MS_PER_MINUTE: f64 = 60_000.0;

/// Combined fade dimmer in `[0,1]` for a scene at `now`.
///
/// When a scene is re-enabled while still fading out (or vice versa) the two
/// ramps overlap; the most recent direction wins via max/min.
pub fn fade_factor(
    fade: u64,
    fade_enable_completed: i64,
    fade_disable_completed: i64,
    now: i64,
) -> f64 {
    if fade == 0 {
        return 1.0;
    }
    let fade = fade as f64;

    let fade_in = if now < fade_enable_completed {
        (fade - (fade_enable_completed - now) as f64) / fade
    } else {
        1.0
    };
    let fade_out = if now < fade_disable_completed {
        (fade_disable_completed - now) as f64 / fade
    } else {
        0.0
    };

    let factor = if fade_enable_completed >= fade_disable_completed {
        fade_in.max(fade_out)
    } else {
        fade_in.min(fade_out)
    };
    factor.clamp(0.0, 1.0)
}

/// Sinusoidal dimmer in `[0,1]`
pub fn wave(bpm: f64, now: i64, phase_offset_ms: f64) -> f64 {
    (2.0 * PI * bpm * (now as f64 + phase_offset_ms) / MS_PER_MINUTE).sin() / 2.0 + 0.5
}

/// Convert a phase fraction into a time offset for the given tempo
pub fn phase_offset_ms(phase: f64, bpm: f64) -> f64 {
    phase * (MS_PER_MINUTE / bpm)
}

/// Deterministic in-place-style shuffle: element `i` swaps with
/// `((seed % (i + 1)) + i) % len`. The exact sequence is relied on for
/// stable effect phases, so this must not be replaced with an RNG.
pub fn seeded_shuffle<T: Clone>(items: &[T], seed: usize) -> Vec<T> {
    let mut shuffled = items.to_vec();
    let len = shuffled.len();
    for i in 0..len {
        let j = ((seed % (i + 1)) + i) % len;
        shuffled.swap(i, j);
    }
    shuffled
}

/// Phase (fraction of a period) for every populated channel of a scene,
/// from its position in the seeded permutation
pub fn assign_phases(dmx_data: &DmxData) -> HashMap<(UniverseId, ChannelId), f64> {
    let populated: Vec<(UniverseId, ChannelId)> = dmx_data
        .iter()
        .flat_map(|(universe, values)| {
            values
                .iter()
                .filter(|(_, value)| **value > 0)
                .map(move |(channel, _)| (*universe, *channel))
        })
        .collect();

    let count = populated.len() as f64;
    seeded_shuffle(&populated, PHASE_SEED)
        .into_iter()
        .enumerate()
        .map(|(position, key)| (key, position as f64 / count))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_fade_is_full() {
        assert_eq!(fade_factor(0, 5000, 0, 1000), 1.0);
    }

    #[test]
    fn fade_in_is_monotonic() {
        let t0 = 1_700_000_000_000;
        let fade = 1000;
        let completed = t0 + fade as i64;

        assert!(fade_factor(fade, completed, 0, t0).abs() < 1e-9);
        let mut last = 0.0;
        for t in (t0..=completed).step_by(50) {
            let f = fade_factor(fade, completed, 0, t);
            assert!(f >= last);
            last = f;
        }
        assert!((fade_factor(fade, completed, 0, completed) - 1.0).abs() < 1e-9);
        assert!((fade_factor(fade, completed, 0, t0 + 250) - 0.25).abs() < 1e-9);
    }

    #[test]
    fn fade_out_ramps_down() {
        let enabled_at = 0;
        let disabled_at = 10_000;
        let fade = 2000;
        let fec = enabled_at + fade as i64;
        let fdc = disabled_at + fade as i64;
        assert!((fade_factor(fade, fec, fdc, disabled_at) - 1.0).abs() < 1e-9);
        assert!((fade_factor(fade, fec, fdc, disabled_at + 500) - 0.75).abs() < 1e-9);
        assert_eq!(fade_factor(fade, fec, fdc, fdc), 0.0);
    }

    #[test]
    fn reenable_during_fade_out_takes_the_higher_ramp() {
        let fade = 1000;
        // disabled at 0, re-enabled at 400 while still 60% up
        let fdc = 1000;
        let fec = 1400;
        assert!((fade_factor(fade, fec, fdc, 400) - 0.6).abs() < 1e-9);
        assert!((fade_factor(fade, fec, fdc, 700) - 0.3).abs() < 1e-9);
        assert!((fade_factor(fade, fec, fdc, 1200) - 0.8).abs() < 1e-9);
        assert_eq!(fade_factor(fade, fec, fdc, 1400), 1.0);
    }

    #[test]
    fn disable_during_fade_in_takes_the_lower_ramp() {
        let fade = 1000;
        // enabled at 0, disabled at 300
        let fec = 1000;
        let fdc = 1300;
        assert!((fade_factor(fade, fec, fdc, 300) - 0.3).abs() < 1e-9);
        assert!((fade_factor(fade, fec, fdc, 1100) - 0.2).abs() < 1e-9);
        assert_eq!(fade_factor(fade, fec, fdc, 1300), 0.0);
    }

    #[test]
    fn wave_stays_in_unit_range() {
        for t in (0..10_000).step_by(37) {
            let v = wave(128.0, t, 0.0);
            assert!((0.0..=1.0).contains(&v));
        }
        assert!((wave(60.0, 0, 0.0) - 0.5).abs() < 1e-9);
        assert!((wave(60.0, 250, 0.0) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn shuffle_matches_index_formula() {
        // i=0: j=0; i=1: j=(0+1)%4=1; i=2: j=(1+2)%4=3; i=3: j=(0+3)%4=3
        assert_eq!(seeded_shuffle(&[0, 1, 2, 3], 1000), vec![0, 1, 3, 2]);
        // i=2: j=(1+2)%5=3; i=3: j=(0+3)%5=3; i=4: j=(0+4)%5=4
        assert_eq!(seeded_shuffle(&[0, 1, 2, 3, 4], 1000), vec![0, 1, 3, 2, 4]);
        assert!(seeded_shuffle::<u8>(&[], 1000).is_empty());
    }

    #[test]
    fn phases_are_deterministic_and_skip_zeros() {
        let mut dmx = DmxData::new();
        dmx.insert(1, [(1, 255), (2, 0), (3, 10), (4, 20)].into_iter().collect());
        dmx.insert(2, [(1, 5)].into_iter().collect());

        let first = assign_phases(&dmx);
        let second = assign_phases(&dmx.clone());
        assert_eq!(first, second);
        assert_eq!(first.len(), 4);
        assert!(!first.contains_key(&(1, 2)));
        // populated order: (1,1) (1,3) (1,4) (2,1) -> shuffled (1,1) (1,3) (2,1) (1,4)
        assert_eq!(first[&(1, 1)], 0.0);
        assert_eq!(first[&(1, 3)], 0.25);
        assert_eq!(first[&(2, 1)], 0.5);
        assert_eq!(first[&(1, 4)], 0.75);
    }
}
