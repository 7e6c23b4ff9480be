use std::collections::BTreeMap;

use crate::{
    animation::{assign_phases, phase_offset_ms, wave},
    live_input::UniverseSnapshot,
    scenes::scene::{ChannelId, EffectDescriptor, Scene, UniverseId},
};

/// { channel: value }, 0-255 scale, left unrounded until transmission
pub type MixedUniverse = BTreeMap<ChannelId, f64>;

/// Merge every live scene's contribution to one universe at `now`.
///
/// Each stored value is scaled by the scene's master, fade and effect
/// dimmers; overlapping scenes merge highest-takes-precedence. When a live
/// input snapshot is given it is merged in unscaled.
pub fn mix_universe(
    scenes: &[Scene],
    live_input: Option<&UniverseSnapshot>,
    universe: UniverseId,
    now: i64,
) -> MixedUniverse {
    let mut output = MixedUniverse::new();

    if let Some(snapshot) = live_input {
        for (channel, value) in &snapshot.payload {
            merge_htp(&mut output, *channel, *value as f64);
        }
    }

    for scene in scenes.iter().filter(|s| s.is_live(now)) {
        let Some(values) = scene.dmx_data.get(&universe) else {
            continue;
        };

        let scene_dimmer = scene.master_dimmer() * scene.fade_dimmer(now);
        let effects = scene.dmx_effects.get(&universe);
        let phases = if scene.effect_bpm.is_some() || effects.is_some() {
            assign_phases(&scene.dmx_data)
        } else {
            Default::default()
        };

        for (channel, raw) in values {
            let phase = phases.get(&(universe, *channel)).copied().unwrap_or(0.0);
            let effect_dimmer = match effects.and_then(|e| e.get(channel)) {
                Some(effect) => effect_dimmer(effect, phase, now),
                None => scene
                    .effect_bpm
                    .map(|bpm| wave(bpm, now, phase_offset_ms(phase, bpm)))
                    .unwrap_or(1.0),
            };

            merge_htp(
                &mut output,
                *channel,
                *raw as f64 * scene_dimmer * effect_dimmer,
            );
        }
    }

    output
}

fn effect_dimmer(effect: &EffectDescriptor, assigned_phase: f64, now: i64) -> f64 {
    match effect {
        EffectDescriptor::Wave { bpm, phase } => {
            if *bpm <= 0.0 || !bpm.is_finite() {
                return 1.0;
            }
            let phase = phase.unwrap_or(assigned_phase);
            wave(*bpm, now, phase_offset_ms(phase, *bpm))
        }
    }
}

fn merge_htp(output: &mut MixedUniverse, channel: ChannelId, value: f64) {
    let entry = output.entry(channel).or_insert(0.0);
    if value > *entry {
        *entry = value;
    }
}
