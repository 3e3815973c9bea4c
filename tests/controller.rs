use std::sync::{Arc, Mutex};
use std::time::Duration;
use futures::SinkExt;
use futures::channel::mpsc::{channel, Sender};
use tokio::task::JoinHandle;
use tokio::time::{sleep, Instant};
use tokio_util::sync::CancellationToken;

use headset_link::bus::{FnSubscriber, Subscriber};
use headset_link::config::types::Config;
use headset_link::device::controller::{spawn_session_controller, SessionHandle};
use headset_link::device::transport::Transport;
use headset_link::device::types::{DeviceEvent, DeviceId, HeadingSample, RadioState, SessionId, SessionState, TransportEvent};
use headset_link::error::{DeviceError, SessionError};

#[derive(Debug, Clone, PartialEq)]
enum Call {
    StartScan(SessionId),
    Connect(SessionId, DeviceId),
    Disconnect,
}

// reports Disconnected for the current link on disconnect(), like BtleTransport does
#[derive(Clone)]
struct FakeTransport {
    calls: Arc<Mutex<Vec<Call>>>,
    radio: Arc<Mutex<RadioState>>,
    link: Arc<Mutex<Option<SessionId>>>,
    reports: Sender<TransportEvent>,
}

impl Transport for FakeTransport {
    fn radio_state(&self) -> RadioState {
        *self.radio.lock().unwrap()
    }

    fn start_scan(&mut self, session: SessionId) -> Result<(), DeviceError> {
        let radio = self.radio_state();
        if !radio.is_powered_on() {
            return Err(DeviceError::TransportUnavailable(radio));
        }
        self.calls.lock().unwrap().push(Call::StartScan(session));
        *self.link.lock().unwrap() = Some(session);
        Ok(())
    }

    fn connect(&mut self, session: SessionId, device: &DeviceId) {
        self.calls.lock().unwrap().push(Call::Connect(session, device.clone()));
        *self.link.lock().unwrap() = Some(session);
    }

    fn disconnect(&mut self) {
        self.calls.lock().unwrap().push(Call::Disconnect);
        let link = self.link.lock().unwrap().take();
        if let Some(session) = link {
            // the receiver is gone once the controller has stopped
            let _ = self.reports.try_send(TransportEvent::Disconnected { session });
        }
    }
}

struct Fixture {
    handle: SessionHandle,
    controller: JoinHandle<()>,
    radio: Sender<TransportEvent>,
    transport: FakeTransport,
    events: Arc<Mutex<Vec<DeviceEvent>>>,
    subscriber: Arc<dyn Subscriber>,
    cancel: CancellationToken,
}

impl Fixture {
    fn new(config: Config) -> Self {
        let (sender, receiver) = channel::<TransportEvent>(64);
        let transport = FakeTransport {
            calls: Arc::new(Mutex::new(Vec::new())),
            radio: Arc::new(Mutex::new(RadioState::PoweredOn)),
            link: Arc::new(Mutex::new(None)),
            reports: sender.clone(),
        };
        let cancel = CancellationToken::new();
        let (handle, controller) = spawn_session_controller(cancel.clone(), transport.clone(), receiver, &config);

        let events = Arc::new(Mutex::new(Vec::new()));
        let events2 = events.clone();
        let subscriber = FnSubscriber::new(move |event| events2.lock().unwrap().push(event.clone()));
        handle.subscribe(&subscriber);

        Fixture { handle, controller, radio: sender, transport, events, subscriber, cancel }
    }

    async fn feed(&mut self, event: TransportEvent) {
        self.radio.send(event).await.unwrap();
        settle().await;
    }

    async fn session(&self) -> SessionId {
        self.handle.session().await.unwrap().id
    }

    async fn connected(&mut self, device: &str) {
        self.handle.connect().await.unwrap();
        let session = self.session().await;
        self.feed(TransportEvent::Discovered { session, candidates: [DeviceId::new(device)].into_iter().collect() }).await;
        self.feed(TransportEvent::Connected { session, device: DeviceId::new(device) }).await;
        assert_eq!(self.handle.state().await.unwrap(), SessionState::Connected);
    }

    fn states(&self) -> Vec<SessionState> {
        self.events.lock().unwrap().iter().filter_map(|event| match event {
            DeviceEvent::StateChange(change) => Some(change.state),
            _ => None,
        }).collect()
    }

    fn calls(&self) -> Vec<Call> {
        self.transport.calls.lock().unwrap().clone()
    }

    fn count(&self, state: SessionState) -> usize {
        self.states().into_iter().filter(|s| *s == state).count()
    }
}

// lets the controller task drain everything that is queued
async fn settle() {
    sleep(Duration::from_millis(1)).await;
}

#[tokio::test(start_paused = true)]
async fn connects_through_ambiguous_selection() {
    let mut f = Fixture::new(Config::default());

    f.handle.connect().await.unwrap();
    let session = f.session().await;
    let candidates = [DeviceId::new("A"), DeviceId::new("B")].into_iter().collect();
    f.feed(TransportEvent::Discovered { session, candidates }).await;

    assert_eq!(f.handle.state().await.unwrap(), SessionState::Discovering);
    assert!(f.events.lock().unwrap().contains(&DeviceEvent::AmbiguousDevices(vec![DeviceId::new("A"), DeviceId::new("B")])));

    f.handle.select_device(DeviceId::new("B")).await.unwrap();
    let current = f.handle.session().await.unwrap();
    assert_eq!(current.state, SessionState::Connecting);
    assert_eq!(current.selected_device, Some(DeviceId::new("B")));

    f.feed(TransportEvent::Connected { session, device: DeviceId::new("B") }).await;
    assert_eq!(f.states(), vec![SessionState::Discovering, SessionState::Connecting, SessionState::Connected]);
    assert_eq!(f.calls(), vec![Call::StartScan(session), Call::Connect(session, DeviceId::new("B"))]);
}

#[tokio::test(start_paused = true)]
async fn requests_report_the_machine_verdict() {
    let f = Fixture::new(Config::default());

    assert_eq!(f.handle.select_device(DeviceId::new("A")).await, Err(SessionError::NotAwaitingSelection));
    f.handle.connect().await.unwrap();
    assert_eq!(f.handle.connect().await, Err(SessionError::SessionActive(SessionState::Discovering)));
}

#[tokio::test(start_paused = true)]
async fn disconnect_before_the_link_is_up_suppresses_connected() {
    let mut f = Fixture::new(Config::default());

    f.handle.connect().await.unwrap();
    let session = f.session().await;
    f.feed(TransportEvent::Discovered { session, candidates: [DeviceId::new("X")].into_iter().collect() }).await;
    f.handle.disconnect().await.unwrap();
    f.handle.disconnect().await.unwrap();
    f.feed(TransportEvent::Connected { session, device: DeviceId::new("X") }).await;

    assert_eq!(f.handle.state().await.unwrap(), SessionState::Disconnected);
    assert!(!f.states().contains(&SessionState::Connected));
    assert_eq!(f.count(SessionState::Disconnected), 1);
}

#[tokio::test(start_paused = true)]
async fn transport_disconnect_report_is_absorbed() {
    for stage in 0..3 {
        let mut f = Fixture::new(Config::default());

        f.handle.connect().await.unwrap();
        let session = f.session().await;
        if stage >= 1 {
            f.feed(TransportEvent::Discovered { session, candidates: [DeviceId::new("A")].into_iter().collect() }).await;
        }
        if stage >= 2 {
            f.feed(TransportEvent::Connected { session, device: DeviceId::new("A") }).await;
        }

        f.handle.disconnect().await.unwrap();
        settle().await;

        assert!(f.transport.link.lock().unwrap().is_none(), "stage {}", stage);
        assert_eq!(f.handle.state().await.unwrap(), SessionState::Disconnected, "stage {}", stage);
        assert_eq!(f.count(SessionState::Disconnected), 1, "stage {}", stage);
        assert_eq!(f.count(SessionState::ConnectionFailed), 0, "stage {}", stage);
    }
}

#[tokio::test(start_paused = true)]
async fn slow_heading_consumer_gets_latest() {
    let mut f = Fixture::new(Config::default());
    let mut headings = f.handle.headings();
    f.connected("A").await;

    let session = f.session().await;
    let start = Instant::now();
    for (i, angle) in [10.0, 12.5, 9.9].into_iter().enumerate() {
        let sample = HeadingSample::new(angle, start + Duration::from_millis(i as u64));
        f.feed(TransportEvent::Heading { session, sample }).await;
    }

    assert_eq!(headings.changed().await.map(|sample| sample.angle_degrees), Some(9.9));
    assert!(!headings.has_changed());
    assert_eq!(headings.latest().map(|sample| sample.angle_degrees), Some(9.9));

    let on_bus: Vec<f32> = f.events.lock().unwrap().iter().filter_map(|event| match event {
        DeviceEvent::Heading(sample) => Some(sample.angle_degrees),
        _ => None,
    }).collect();
    assert_eq!(on_bus, vec![10.0, 12.5, 9.9]);
}

#[tokio::test(start_paused = true)]
async fn replay_log_is_available_from_the_handle() {
    let mut f = Fixture::new(Config { heading_replay_capacity: 2, ..Config::default() });
    f.connected("A").await;

    let session = f.session().await;
    for angle in [1.0, 2.0, 3.0] {
        f.feed(TransportEvent::Heading { session, sample: HeadingSample::new(angle, Instant::now()) }).await;
    }

    let replay: Vec<f32> = f.handle.heading_replay().iter().map(|sample| sample.angle_degrees).collect();
    assert_eq!(replay, vec![2.0, 3.0]);
}

#[tokio::test(start_paused = true)]
async fn quiet_headset_lingers() {
    let mut f = Fixture::new(Config { linger_timeout_ms: 1000, ..Config::default() });
    f.connected("A").await;

    sleep(Duration::from_millis(600)).await;
    assert_eq!(f.handle.state().await.unwrap(), SessionState::Connected);

    sleep(Duration::from_millis(700)).await;
    assert_eq!(f.handle.state().await.unwrap(), SessionState::Lingering);

    let session = f.session().await;
    f.feed(TransportEvent::Heading { session, sample: HeadingSample::new(5.0, Instant::now()) }).await;
    assert_eq!(f.handle.state().await.unwrap(), SessionState::Connected);
    assert_eq!(
        f.states(),
        vec![SessionState::Discovering, SessionState::Connecting, SessionState::Connected, SessionState::Lingering, SessionState::Connected],
    );
}

#[tokio::test(start_paused = true)]
async fn radio_off_requires_a_new_connect() {
    let mut f = Fixture::new(Config::default());
    f.connected("A").await;

    *f.transport.radio.lock().unwrap() = RadioState::PoweredOff;
    f.feed(TransportEvent::RadioStateChanged(RadioState::PoweredOff)).await;
    assert_eq!(f.handle.state().await.unwrap(), SessionState::BluetoothOff);

    assert_eq!(f.handle.connect().await, Err(SessionError::TransportUnavailable(RadioState::PoweredOff)));

    *f.transport.radio.lock().unwrap() = RadioState::PoweredOn;
    f.feed(TransportEvent::RadioStateChanged(RadioState::PoweredOn)).await;
    sleep(Duration::from_secs(10)).await;
    assert_eq!(f.handle.state().await.unwrap(), SessionState::BluetoothOff);
    assert_eq!(f.calls().iter().filter(|call| matches!(call, Call::StartScan(_))).count(), 1);

    f.handle.connect().await.unwrap();
    let session = f.handle.session().await.unwrap();
    assert_eq!(session.state, SessionState::Discovering);
    assert_eq!(session.id, SessionId(2));
}

#[tokio::test(start_paused = true)]
async fn shutdown_tears_down() {
    let mut f = Fixture::new(Config::default());
    f.connected("A").await;

    f.handle.shutdown().await.unwrap();
    (&mut f.controller).await.unwrap();

    assert_eq!(f.calls().last(), Some(&Call::Disconnect));
    assert_eq!(f.states().last(), Some(&SessionState::Disconnected));
    assert_eq!(Arc::weak_count(&f.subscriber), 0);
    assert_eq!(f.handle.connect().await, Err(SessionError::ControllerStopped));
}

#[tokio::test(start_paused = true)]
async fn cancel_token_stops_the_controller() {
    let mut f = Fixture::new(Config::default());
    f.handle.connect().await.unwrap();

    f.cancel.cancel();
    (&mut f.controller).await.unwrap();

    assert_eq!(f.calls().last(), Some(&Call::Disconnect));
    assert_eq!(f.handle.state().await, Err(SessionError::ControllerStopped));
}

#[tokio::test(start_paused = true)]
async fn dropping_every_handle_stops_the_controller() {
    let f = Fixture::new(Config::default());
    let Fixture { handle, controller, transport, .. } = f;

    drop(handle);
    controller.await.unwrap();

    assert_eq!(transport.calls.lock().unwrap().last(), Some(&Call::Disconnect));
}
