//! Publish/subscribe decoupling of the session state machine and heading stream from whoever
//! consumes their events (console, logger, tests).
//!
//! The bus only keeps `Weak` references. It never extends a subscriber's lifetime: once the last
//! `Arc` of a subscriber is dropped, it stops receiving events, even in the middle of a dispatch.

use std::sync::{Arc, Mutex, Weak};
use futures::channel::mpsc::{unbounded, UnboundedReceiver, UnboundedSender};
use log::debug;

use crate::device::types::DeviceEvent;

pub trait Subscriber: Send + Sync {
    fn on_event(&self, event: &DeviceEvent);
}

fn same_subscriber(registered: &Weak<dyn Subscriber>, subscriber: &Arc<dyn Subscriber>) -> bool {
    // compare the data pointers only, vtable pointers are not guaranteed to be unique
    registered.as_ptr() as *const () == Arc::as_ptr(subscriber) as *const ()
}

#[derive(Default)]
pub struct EventBus {
    subscribers: Mutex<Vec<Weak<dyn Subscriber>>>,
}

impl EventBus {
    pub fn new() -> Self {
        EventBus::default()
    }

    /// Registers `subscriber` at the end of the dispatch order. Subscribing twice has no effect.
    pub fn subscribe(&self, subscriber: &Arc<dyn Subscriber>) {
        let mut subscribers = self.subscribers.lock().expect("Failed to lock EventBus subscribers");

        if subscribers.iter().any(|registered| same_subscriber(registered, subscriber)) {
            return;
        }

        subscribers.push(Arc::downgrade(subscriber));
    }

    /// Unsubscribing something that is not subscribed has no effect.
    pub fn unsubscribe(&self, subscriber: &Arc<dyn Subscriber>) {
        let mut subscribers = self.subscribers.lock().expect("Failed to lock EventBus subscribers");
        subscribers.retain(|registered| !same_subscriber(registered, subscriber));
    }

    /// Drops every registration.
    pub fn clear(&self) {
        self.subscribers.lock().expect("Failed to lock EventBus subscribers").clear();
    }

    /// Number of registrations whose subscriber is still alive.
    pub fn len(&self) -> usize {
        let subscribers = self.subscribers.lock().expect("Failed to lock EventBus subscribers");
        subscribers.iter().filter(|registered| registered.strong_count() > 0).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn is_registered(&self, subscriber: &Weak<dyn Subscriber>) -> bool {
        let subscribers = self.subscribers.lock().expect("Failed to lock EventBus subscribers");
        subscribers.iter().any(|registered| registered.ptr_eq(subscriber))
    }

    /// Notifies every live subscriber in subscription order.
    ///
    /// The registry lock is not held while a subscriber runs, so subscribers may (un)subscribe
    /// from within `on_event`. A subscriber that is unsubscribed or dropped during a dispatch is
    /// not called after that point.
    pub fn dispatch(&self, event: &DeviceEvent) {
        let snapshot: Vec<Weak<dyn Subscriber>> = self.subscribers
            .lock()
            .expect("Failed to lock EventBus subscribers")
            .clone();

        let mut found_dead = false;

        for registered in &snapshot {
            let Some(subscriber) = registered.upgrade() else {
                found_dead = true;
                continue;
            };

            if !self.is_registered(registered) {
                continue;
            }

            subscriber.on_event(event);
        }

        if found_dead {
            let mut subscribers = self.subscribers.lock().expect("Failed to lock EventBus subscribers");
            let before = subscribers.len();
            subscribers.retain(|registered| registered.strong_count() > 0);
            debug!("Pruned {} dropped subscriber(s)", before - subscribers.len());
        }
    }
}

/// Adapts a closure into a [`Subscriber`].
pub struct FnSubscriber<F> {
    callback: F,
}

impl<F> FnSubscriber<F>
where
    F: Fn(&DeviceEvent) + Send + Sync + 'static,
{
    pub fn new(callback: F) -> Arc<dyn Subscriber> {
        Arc::new(FnSubscriber { callback })
    }
}

impl<F> Subscriber for FnSubscriber<F>
where
    F: Fn(&DeviceEvent) + Send + Sync,
{
    fn on_event(&self, event: &DeviceEvent) {
        (self.callback)(event)
    }
}

/**
 * Forwards events into a channel, so that a consumer can handle them on its own task/schedule.
 * Headings are forwarded only when asked for; consumers that only need the freshest heading should
 * use a HeadingReceiver instead.
 */
pub struct ChannelSubscriber {
    sender: UnboundedSender<DeviceEvent>,
    headings: bool,
}

impl ChannelSubscriber {
    pub fn new(headings: bool) -> (Arc<ChannelSubscriber>, UnboundedReceiver<DeviceEvent>) {
        let (sender, receiver) = unbounded();
        (Arc::new(ChannelSubscriber { sender, headings }), receiver)
    }
}

impl Subscriber for ChannelSubscriber {
    fn on_event(&self, event: &DeviceEvent) {
        if !self.headings && matches!(event, DeviceEvent::Heading(_)) {
            return;
        }

        if self.sender.unbounded_send(event.clone()).is_err() {
            debug!("Channel subscriber receiver is gone, dropping {:?}", event);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use futures::StreamExt;
    use crate::device::types::RadioState;

    struct Recorder {
        name: &'static str,
        log: Arc<Mutex<Vec<&'static str>>>,
    }

    impl Subscriber for Recorder {
        fn on_event(&self, _event: &DeviceEvent) {
            self.log.lock().unwrap().push(self.name);
        }
    }

    fn recorder(name: &'static str, log: &Arc<Mutex<Vec<&'static str>>>) -> Arc<dyn Subscriber> {
        Arc::new(Recorder { name, log: log.clone() })
    }

    fn event() -> DeviceEvent {
        DeviceEvent::RadioState(RadioState::PoweredOn)
    }

    #[test]
    fn dispatches_in_subscription_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let bus = EventBus::new();
        let a = recorder("a", &log);
        let b = recorder("b", &log);
        let c = recorder("c", &log);

        bus.subscribe(&b);
        bus.subscribe(&a);
        bus.subscribe(&c);
        bus.dispatch(&event());

        assert_eq!(*log.lock().unwrap(), vec!["b", "a", "c"]);
    }

    #[test]
    fn subscribe_and_unsubscribe_are_idempotent() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let bus = EventBus::new();
        let a = recorder("a", &log);

        bus.subscribe(&a);
        bus.subscribe(&a);
        assert_eq!(bus.len(), 1);
        bus.dispatch(&event());
        assert_eq!(*log.lock().unwrap(), vec!["a"]);

        bus.unsubscribe(&a);
        bus.unsubscribe(&a);
        assert!(bus.is_empty());
        bus.dispatch(&event());
        assert_eq!(*log.lock().unwrap(), vec!["a"]);
    }

    #[test]
    fn does_not_extend_subscriber_lifetime() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let bus = EventBus::new();
        let a = recorder("a", &log);
        let weak = Arc::downgrade(&a);

        bus.subscribe(&a);
        drop(a);

        assert!(weak.upgrade().is_none());
        bus.dispatch(&event());
        assert!(log.lock().unwrap().is_empty());
        assert!(bus.is_empty());
    }

    struct Dropper {
        victim: Mutex<Option<Arc<dyn Subscriber>>>,
        bus: Arc<EventBus>,
        unsubscribe: bool,
    }

    impl Subscriber for Dropper {
        fn on_event(&self, _event: &DeviceEvent) {
            if let Some(victim) = self.victim.lock().unwrap().take() {
                if self.unsubscribe {
                    self.bus.unsubscribe(&victim);
                }
                // the last strong reference goes away here
                drop(victim);
            }
        }
    }

    #[test]
    fn subscriber_dropped_mid_dispatch_is_not_notified() {
        for unsubscribe in [false, true] {
            let log = Arc::new(Mutex::new(Vec::new()));
            let bus = Arc::new(EventBus::new());
            let victim = recorder("victim", &log);
            let dropper: Arc<dyn Subscriber> = Arc::new(Dropper {
                victim: Mutex::new(Some(victim.clone())),
                bus: bus.clone(),
                unsubscribe,
            });

            bus.subscribe(&dropper);
            bus.subscribe(&victim);
            drop(victim);

            bus.dispatch(&event());
            bus.dispatch(&event());

            assert!(log.lock().unwrap().is_empty());
            assert_eq!(bus.len(), 1);
        }
    }

    #[test]
    fn clear_releases_everything() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let bus = EventBus::new();
        let a = recorder("a", &log);
        bus.subscribe(&a);

        bus.clear();
        bus.dispatch(&event());

        assert!(log.lock().unwrap().is_empty());
        assert_eq!(Arc::weak_count(&a), 0);
    }

    #[tokio::test]
    async fn channel_subscriber_filters_headings() {
        let bus = EventBus::new();
        let (subscriber, mut receiver) = ChannelSubscriber::new(false);
        let subscriber: Arc<dyn Subscriber> = subscriber;
        bus.subscribe(&subscriber);

        bus.dispatch(&DeviceEvent::Heading(crate::device::types::HeadingSample::new(
            1.0,
            tokio::time::Instant::now(),
        )));
        bus.dispatch(&event());

        assert_eq!(receiver.next().await, Some(event()));
    }
}
