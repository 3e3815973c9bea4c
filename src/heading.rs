//! Latest-value-wins delivery of heading samples.
//!
//! There is no queue between the producer and a [`HeadingReceiver`]: a new sample overwrites the
//! previous one, whether or not it has been read. A receiver that is slower than the headset only
//! ever observes the freshest sample, so consumers can not assume that they see every sample.
//! Samples are never reordered.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use log::debug;
use tokio::sync::watch;

use crate::bus::EventBus;
use crate::device::types::{DeviceEvent, HeadingSample};

pub struct HeadingStream {
    slot: watch::Sender<Option<HeadingSample>>,
    replay: Mutex<VecDeque<HeadingSample>>,
    replay_capacity: usize,
    bus: Arc<EventBus>,
}

impl HeadingStream {
    /// A `replay_capacity` of 0 disables the replay log.
    pub fn new(bus: Arc<EventBus>, replay_capacity: usize) -> Self {
        let (slot, _) = watch::channel(None);

        HeadingStream {
            slot,
            replay: Mutex::new(VecDeque::with_capacity(replay_capacity)),
            replay_capacity,
            bus,
        }
    }

    /// Stores `sample` as the latest one and notifies bus subscribers. Returns false if the sample
    /// was dropped because it is older than the current one.
    pub fn publish(&self, sample: HeadingSample) -> bool {
        let mut stale = false;

        self.slot.send_if_modified(|latest| {
            if let Some(current) = latest.as_ref() {
                if sample.timestamp < current.timestamp {
                    stale = true;
                    return false;
                }
            }
            *latest = Some(sample.clone());
            true
        });

        if stale {
            debug!("Dropping out of order heading sample {:?}", sample);
            return false;
        }

        if self.replay_capacity > 0 {
            let mut replay = self.replay.lock().expect("Failed to lock heading replay log");
            if replay.len() == self.replay_capacity {
                replay.pop_front();
            }
            replay.push_back(sample.clone());
        }

        self.bus.dispatch(&DeviceEvent::Heading(sample));
        true
    }

    pub fn latest(&self) -> Option<HeadingSample> {
        self.slot.borrow().clone()
    }

    /// A receiver that starts out having seen the current sample.
    pub fn subscribe(&self) -> HeadingReceiver {
        HeadingReceiver { receiver: self.slot.subscribe() }
    }

    /// The retained samples, oldest first. Always empty when the replay log is disabled.
    pub fn replay(&self) -> Vec<HeadingSample> {
        self.replay.lock().expect("Failed to lock heading replay log").iter().cloned().collect()
    }
}

#[derive(Clone)]
pub struct HeadingReceiver {
    receiver: watch::Receiver<Option<HeadingSample>>,
}

impl HeadingReceiver {
    /// Waits until a sample newer than the last one seen by this receiver is available and returns
    /// it. Returns `None` once the stream is gone.
    pub async fn changed(&mut self) -> Option<HeadingSample> {
        loop {
            if self.receiver.changed().await.is_err() {
                return None;
            }

            if let Some(sample) = self.receiver.borrow_and_update().clone() {
                return Some(sample);
            }
        }
    }

    pub fn has_changed(&self) -> bool {
        self.receiver.has_changed().unwrap_or(false)
    }

    pub fn latest(&self) -> Option<HeadingSample> {
        self.receiver.borrow().clone()
    }
}
