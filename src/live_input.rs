use std::collections::HashMap;

use log::{debug, trace};

use crate::scenes::scene::{DmxValues, UniverseId};

/// How long a higher-priority source holds a universe after its last frame
pub const PRIORITY_HOLD_MS: i64 = 15_000;

/// One inbound DMX frame, as decoded from the network
#[derive(Debug, Clone, PartialEq)]
pub struct DmxFrame {
    pub universe: UniverseId,
    pub priority: u8,
    pub source_name: String,
    /// Populated channels only; zero slots are dropped
    pub payload: DmxValues,
}

/// Latest accepted input for one universe
#[derive(Debug, Clone, PartialEq)]
pub struct UniverseSnapshot {
    pub payload: DmxValues,
    pub priority: u8,
    pub last_received_at: i64,
    pub sender_name: String,
}

/// Per-universe priority arbitration of network input. Expiry of a held
/// source is only evaluated when the next frame for that universe arrives.
pub struct LiveInputTracker {
    universes: Vec<UniverseId>,
    own_source_name: String,
    snapshots: HashMap<UniverseId, UniverseSnapshot>,
}

impl LiveInputTracker {
    pub fn new(universes: &[UniverseId], own_source_name: &str) -> Self {
        LiveInputTracker {
            universes: universes.to_vec(),
            own_source_name: String::from(own_source_name),
            snapshots: HashMap::new(),
        }
    }

    /// Returns true if the frame was applied
    pub fn receive(&mut self, frame: DmxFrame, now: i64) -> bool {
        if !self.universes.contains(&frame.universe) {
            trace!("Ignore frame for unconfigured universe {}", frame.universe);
            return false;
        }
        if frame.source_name == self.own_source_name {
            trace!("Ignore our own frame on universe {}", frame.universe);
            return false;
        }

        if let Some(stored) = self.snapshots.get(&frame.universe) {
            if stored.priority > frame.priority
                && now - stored.last_received_at < PRIORITY_HOLD_MS
            {
                trace!(
                    "Universe {} held by \"{}\" at priority {}; ignore \"{}\" at {}",
                    frame.universe,
                    stored.sender_name,
                    stored.priority,
                    frame.source_name,
                    frame.priority
                );
                return false;
            }
            if stored.sender_name != frame.source_name {
                debug!(
                    "Universe {} now driven by \"{}\" (priority {})",
                    frame.universe, frame.source_name, frame.priority
                );
            }
        }

        self.snapshots.insert(
            frame.universe,
            UniverseSnapshot {
                payload: frame.payload,
                priority: frame.priority,
                last_received_at: now,
                sender_name: frame.source_name,
            },
        );
        true
    }

    pub fn snapshot(&self, universe: UniverseId) -> Option<&UniverseSnapshot> {
        self.snapshots.get(&universe)
    }

    /// Current payloads for the requested universes; universes with no
    /// input yet are skipped
    pub fn payloads(&self, universes: &[UniverseId]) -> Vec<(UniverseId, DmxValues)> {
        universes
            .iter()
            .filter_map(|u| self.snapshots.get(u).map(|s| (*u, s.payload.clone())))
            .collect()
    }
}
