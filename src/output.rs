use std::time::{Duration, Instant};

use log::{error, info};

use crate::{
    live_input::LiveInputTracker,
    mixer::{mix_universe, MixedUniverse},
    scenes::scene::{Scene, UniverseId},
    settings::CHANNELS_PER_UNIVERSE,
};

/// Anything that can put a universe of DMX on the wire
pub trait DmxTransmitter {
    fn transmit(
        &mut self,
        universe: UniverseId,
        slots: &[u8],
        priority: u8,
        source_name: &str,
    ) -> anyhow::Result<()>;
}

/// Round the mix into wire slots; channel `c` goes to slot `c - 1`
pub fn to_slots(mixed: &MixedUniverse) -> Vec<u8> {
    let mut slots = vec![0u8; CHANNELS_PER_UNIVERSE as usize];
    for (channel, value) in mixed {
        if (1..=CHANNELS_PER_UNIVERSE).contains(channel) {
            slots[*channel as usize - 1] = value.round().clamp(0.0, 255.0) as u8;
        }
    }
    slots
}

/// Drives the mixer at a fixed period. Start/stop only affect future ticks;
/// input tracking carries on regardless.
pub struct OutputLoop {
    transmitter: Box<dyn DmxTransmitter>,
    universes: Vec<UniverseId>,
    source_name: String,
    priority: u8,
    period: Duration,
    passthrough: bool,
    running: bool,
    next_tick: Instant,
}

impl OutputLoop {
    pub fn new(
        transmitter: Box<dyn DmxTransmitter>,
        universes: &[UniverseId],
        source_name: &str,
        priority: u8,
        period: Duration,
        passthrough: bool,
    ) -> Self {
        OutputLoop {
            transmitter,
            universes: universes.to_vec(),
            source_name: String::from(source_name),
            priority,
            period,
            passthrough,
            running: false,
            next_tick: Instant::now(),
        }
    }

    pub fn start(&mut self) {
        if !self.running {
            info!(
                "Output started: universes {:?} every {}ms",
                self.universes,
                self.period.as_millis()
            );
            self.running = true;
            self.next_tick = Instant::now();
        }
    }

    pub fn stop(&mut self) {
        if self.running {
            info!("Output stopped");
            self.running = false;
        }
    }

    pub fn is_running(&self) -> bool {
        self.running
    }

    /// When the next tick is due, if running
    pub fn next_deadline(&self) -> Option<Instant> {
        self.running.then_some(self.next_tick)
    }

    /// Transmit if a tick is due at `instant`; returns true if it did
    pub fn tick(
        &mut self,
        scenes: &[Scene],
        live_input: &LiveInputTracker,
        now: i64,
        instant: Instant,
    ) -> bool {
        if !self.running || instant < self.next_tick {
            return false;
        }

        self.send_once(scenes, live_input, now);

        self.next_tick += self.period;
        if self.next_tick < instant {
            // fell behind; don't burst to catch up
            self.next_tick = instant + self.period;
        }
        true
    }

    /// Mix and transmit every universe right now. A failing universe is
    /// logged and the rest are still sent.
    pub fn send_once(&mut self, scenes: &[Scene], live_input: &LiveInputTracker, now: i64) {
        for universe in &self.universes {
            let input = if self.passthrough {
                live_input.snapshot(*universe)
            } else {
                None
            };
            let mixed = mix_universe(scenes, input, *universe, now);
            let slots = to_slots(&mixed);
            if let Err(e) =
                self.transmitter
                    .transmit(*universe, &slots, self.priority, &self.source_name)
            {
                error!("Failed to transmit universe {}: {:#}", universe, e);
            }
        }
    }
}

#[cfg(test)]
pub mod tests {
    use std::{
        cell::RefCell,
        rc::Rc,
    };

    use anyhow::anyhow;

    use super::*;
    use crate::{live_input::DmxFrame, scenes::scene::DmxValues};

    pub type Sent = Rc<RefCell<Vec<(UniverseId, Vec<u8>, u8, String)>>>;

    /// Records what would have been transmitted; fails for `fail_universe`
    pub struct RecordingTransmitter {
        pub sent: Sent,
        pub fail_universe: Option<UniverseId>,
    }

    impl DmxTransmitter for RecordingTransmitter {
        fn transmit(
            &mut self,
            universe: UniverseId,
            slots: &[u8],
            priority: u8,
            source_name: &str,
        ) -> anyhow::Result<()> {
            if self.fail_universe == Some(universe) {
                return Err(anyhow!("unreachable"));
            }
            self.sent
                .borrow_mut()
                .push((universe, slots.to_vec(), priority, source_name.into()));
            Ok(())
        }
    }

    pub fn recording_loop(universes: &[UniverseId], fail_universe: Option<UniverseId>) -> (OutputLoop, Sent) {
        let sent: Sent = Rc::new(RefCell::new(Vec::new()));
        let transmitter = RecordingTransmitter {
            sent: sent.clone(),
            fail_universe,
        };
        let output = OutputLoop::new(
            Box::new(transmitter),
            universes,
            "Recorder",
            90,
            Duration::from_millis(65),
            false,
        );
        (output, sent)
    }

    fn lit_scene() -> Scene {
        let mut scene = Scene::new("a".into(), "A".into(), 0);
        scene
            .dmx_data
            .insert(1, [(1, 255), (3, 100)].into_iter().collect::<DmxValues>());
        scene.enabled = true;
        scene
    }

    #[test]
    fn slots_are_rounded_and_clamped() {
        let mixed: MixedUniverse = [(1, 127.5), (2, 300.0), (512, 1.2), (513, 50.0)]
            .into_iter()
            .collect();
        let slots = to_slots(&mixed);
        assert_eq!(slots.len(), 512);
        assert_eq!(slots[0], 128);
        assert_eq!(slots[1], 255);
        assert_eq!(slots[511], 1);
    }

    #[test]
    fn send_once_transmits_every_universe() {
        let (mut output, sent) = recording_loop(&[1, 2], None);
        let tracker = LiveInputTracker::new(&[1, 2], "Recorder");
        output.send_once(&[lit_scene()], &tracker, 0);

        let sent = sent.borrow();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].0, 1);
        assert_eq!(sent[0].1[0], 255);
        assert_eq!(sent[0].1[2], 100);
        assert_eq!(sent[0].2, 90);
        assert_eq!(sent[0].3, "Recorder");
        assert!(sent[1].1.iter().all(|v| *v == 0));
    }

    #[test]
    fn failing_universe_does_not_stop_others() {
        let (mut output, sent) = recording_loop(&[1, 2, 3], Some(2));
        let tracker = LiveInputTracker::new(&[1, 2, 3], "Recorder");
        output.send_once(&[lit_scene()], &tracker, 0);
        let universes: Vec<u16> = sent.borrow().iter().map(|s| s.0).collect();
        assert_eq!(universes, vec![1, 3]);
    }

    #[test]
    fn ticks_only_while_running() {
        let (mut output, sent) = recording_loop(&[1], None);
        let tracker = LiveInputTracker::new(&[1], "Recorder");
        let now = Instant::now();

        assert!(!output.tick(&[], &tracker, 0, now));
        assert_eq!(output.next_deadline(), None);

        output.start();
        output.start();
        let start = output.next_deadline().unwrap();
        assert!(output.tick(&[], &tracker, 0, start));
        assert!(!output.tick(&[], &tracker, 0, start + Duration::from_millis(10)));
        assert!(output.tick(&[], &tracker, 0, start + Duration::from_millis(65)));
        assert_eq!(sent.borrow().len(), 2);

        output.stop();
        output.stop();
        assert!(!output.tick(&[], &tracker, 0, start + Duration::from_secs(10)));
        assert_eq!(sent.borrow().len(), 2);
    }

    #[test]
    fn passthrough_includes_live_input() {
        let sent: Sent = Rc::new(RefCell::new(Vec::new()));
        let mut output = OutputLoop::new(
            Box::new(RecordingTransmitter {
                sent: sent.clone(),
                fail_universe: None,
            }),
            &[1],
            "Recorder",
            90,
            Duration::from_millis(65),
            true,
        );
        let mut tracker = LiveInputTracker::new(&[1], "Recorder");
        tracker.receive(
            DmxFrame {
                universe: 1,
                priority: 100,
                source_name: "desk".into(),
                payload: [(5, 77)].into_iter().collect(),
            },
            0,
        );
        output.send_once(&[], &tracker, 0);
        assert_eq!(sent.borrow()[0].1[4], 77);
    }
}
