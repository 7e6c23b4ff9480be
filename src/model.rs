use std::{
    sync::mpsc::{Receiver, RecvTimeoutError},
    time::{Duration, Instant, SystemTime, UNIX_EPOCH},
};

use log::{debug, info, trace};

use crate::{
    commands::handle_command,
    live_input::{DmxFrame, LiveInputTracker},
    notifier::ChangeNotifier,
    output::OutputLoop,
    scenes::SceneStore,
    tether_interface::{handle_bus_message, BusMessage},
    ui_channel::Subscriber,
};

/// Longest the loop sleeps when nothing is scheduled
const IDLE_WAIT: Duration = Duration::from_millis(250);

/// Everything the model reacts to. Producers live on their own threads;
/// only the model touches the store.
pub enum ModelEvent {
    Frame(DmxFrame),
    UiCommand(String),
    UiConnected(Subscriber),
    Bus(BusMessage),
    Shutdown,
}

/// Wall-clock milliseconds since the epoch
pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}

pub struct Model {
    pub store: SceneStore,
    pub live_input: LiveInputTracker,
    pub output: OutputLoop,
    pub notifier: ChangeNotifier,
    events: Receiver<ModelEvent>,
    should_quit: bool,
}

impl Model {
    pub fn new(
        store: SceneStore,
        live_input: LiveInputTracker,
        output: OutputLoop,
        notifier: ChangeNotifier,
        events: Receiver<ModelEvent>,
    ) -> Model {
        Model {
            store,
            live_input,
            output,
            notifier,
            events,
            should_quit: false,
        }
    }

    #[cfg(test)]
    pub fn should_quit(&self) -> bool {
        self.should_quit
    }

    pub fn run(&mut self) {
        info!("Model loop running; Ctrl+C to quit");
        while !self.should_quit {
            self.update();
        }
        info!("Model loop end");
    }

    /// Wait for the next event or deadline, then handle everything pending
    pub fn update(&mut self) {
        let instant = Instant::now();
        let deadline = [self.output.next_deadline(), self.notifier.next_deadline()]
            .into_iter()
            .flatten()
            .min();
        let wait = deadline
            .map(|d| d.saturating_duration_since(instant))
            .unwrap_or(IDLE_WAIT);

        match self.events.recv_timeout(wait) {
            Ok(event) => {
                self.handle_event(event);
                while let Ok(event) = self.events.try_recv() {
                    self.handle_event(event);
                }
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => {
                debug!("All event producers gone");
                self.should_quit = true;
            }
        }

        let now = now_ms();
        let instant = Instant::now();
        self.process(now, instant);
    }

    /// Fan out store changes, then run whatever is due
    pub fn process(&mut self, now: i64, instant: Instant) {
        self.notifier.observe(
            &self.store,
            &mut self.output,
            &self.live_input,
            now,
            instant,
        );
        self.output
            .tick(self.store.scenes(), &self.live_input, now, instant);
        self.notifier.poll(&self.store, instant);
    }

    pub fn handle_event(&mut self, event: ModelEvent) {
        let now = now_ms();
        self.handle_event_at(event, now);
    }

    fn handle_event_at(&mut self, event: ModelEvent, now: i64) {
        match event {
            ModelEvent::Frame(frame) => {
                let universe = frame.universe;
                if self.live_input.receive(frame, now) {
                    trace!("Live input updated for universe {}", universe);
                }
            }
            ModelEvent::UiCommand(text) => {
                handle_command(&text, &mut self.store, &self.live_input, now);
            }
            ModelEvent::UiConnected(subscriber) => {
                self.notifier.add_subscriber(subscriber, &self.store);
            }
            ModelEvent::Bus(message) => {
                if handle_bus_message(message, &mut self.store, now) {
                    self.notifier.publish_status(&self.store);
                }
            }
            ModelEvent::Shutdown => {
                info!("Shutdown requested");
                self.output.stop();
                self.should_quit = true;
            }
        }
    }
}
