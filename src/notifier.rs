use std::{
    sync::mpsc::Sender,
    time::{Duration, Instant},
};

use log::{debug, error, warn};

use crate::{
    live_input::LiveInputTracker,
    output::OutputLoop,
    scenes::{scene::Scene, SceneStore},
    tether_interface::{toggle_topics, BusRequest},
    ui_channel::{Subscriber, Subscribers},
};

/// Fans out every store change: immediate output resend, UI broadcast,
/// debounced bus status and an asynchronous full write to storage.
///
/// Changes are detected by store revision, so several mutations handled in
/// one pass of the model loop are announced once.
pub struct ChangeNotifier {
    last_revision: u64,
    subscribers: Subscribers,
    storage: Option<Sender<Vec<Scene>>>,
    bus: Option<Sender<BusRequest>>,
    debounce: Duration,
    status_due: Option<Instant>,
    watched_topics: Vec<String>,
}

impl ChangeNotifier {
    pub fn new(
        store: &SceneStore,
        storage: Option<Sender<Vec<Scene>>>,
        bus: Option<Sender<BusRequest>>,
        debounce: Duration,
    ) -> Self {
        let mut notifier = ChangeNotifier {
            last_revision: store.revision(),
            subscribers: Subscribers::new(),
            storage,
            bus,
            debounce,
            status_due: None,
            watched_topics: Vec::new(),
        };
        notifier.refresh_toggle_topics(store);
        notifier
    }

    /// Fan out if the store changed since last time; returns true if it did
    pub fn observe(
        &mut self,
        store: &SceneStore,
        output: &mut OutputLoop,
        live_input: &LiveInputTracker,
        now: i64,
        instant: Instant,
    ) -> bool {
        if store.revision() == self.last_revision {
            return false;
        }
        self.last_revision = store.revision();
        debug!("Scene store revision {}", self.last_revision);

        if output.is_running() {
            output.send_once(store.scenes(), live_input, now);
        }

        self.subscribers.broadcast(store);

        if self.bus.is_some() {
            self.status_due = Some(instant + self.debounce);
            self.refresh_toggle_topics(store);
        }

        if let Some(storage) = &self.storage {
            if storage.send(store.scenes().to_vec()).is_err() {
                error!("Storage writer has stopped; scenes not persisted");
            }
        }

        true
    }

    pub fn add_subscriber(&mut self, subscriber: Subscriber, store: &SceneStore) {
        self.subscribers.welcome(subscriber, store);
    }

    /// When the pending debounced status push is due
    pub fn next_deadline(&self) -> Option<Instant> {
        self.status_due
    }

    /// Push the debounced status if its window has passed
    pub fn poll(&mut self, store: &SceneStore, instant: Instant) {
        if self.status_due.is_some_and(|due| instant >= due) {
            self.status_due = None;
            self.publish_status(store);
        }
    }

    pub fn publish_status(&mut self, store: &SceneStore) {
        if let Some(bus) = &self.bus {
            if bus.send(BusRequest::PublishStatus(store.status())).is_err() {
                warn!("Bus is not running; status not published");
                self.bus = None;
            }
        }
    }

    fn refresh_toggle_topics(&mut self, store: &SceneStore) {
        let topics = toggle_topics(store.scenes());
        if topics == self.watched_topics {
            return;
        }
        if let Some(bus) = &self.bus {
            if bus.send(BusRequest::WatchToggleTopics(topics.clone())).is_err() {
                warn!("Bus is not running; toggle topics not watched");
                self.bus = None;
                return;
            }
        }
        self.watched_topics = topics;
    }
}
