use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use futures::{SinkExt, StreamExt};
use futures::channel::mpsc::Sender;
use btleplug::api::{Central, CentralEvent, CentralState, Characteristic, Manager as _, Peripheral as _, ScanFilter};
use btleplug::platform::{Adapter, Manager, Peripheral, PeripheralId};
use indexmap::IndexSet;
use log::{debug, info, warn};
use tokio::spawn;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Duration, Instant};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::types::Config;
use crate::device::constants::{CONNECT_DEADLINE, DISCONNECT_DEADLINE};
use crate::device::frame::decode_heading_frame;
use crate::device::transport::Transport;
use crate::device::types::{DeviceId, FailureReason, HeadingSample, RadioState, SessionId, TransportEvent};
use crate::error::DeviceError;

fn radio_state_from(state: CentralState) -> RadioState {
    match state {
        CentralState::PoweredOn => RadioState::PoweredOn,
        CentralState::PoweredOff => RadioState::PoweredOff,
        _ => RadioState::Unknown,
    }
}

#[derive(Debug, Clone)]
struct BtleSettings {
    service_uuid: Uuid,
    heading_uuid: Uuid,
    scan_window: Duration,
}

/// What the transport is currently doing on behalf of a session.
struct Link {
    session: SessionId,
    cancel: CancellationToken,
}

/// The peripheral that is connected right now, used to attribute adapter level disconnects.
type ConnectedPeripheral = Arc<Mutex<Option<(SessionId, PeripheralId)>>>;

/**
 * Transport on top of btleplug, using the first bluetooth adapter of the system.
 *
 * Every scan/connect runs on its own task, tied to a CancellationToken for the session it was
 * started for. disconnect() cancels that token; the task then stops scanning or drops the link on
 * its own, so a link that completes after a disconnect request is torn down instead of reported.
 */
pub struct BtleTransport {
    adapter: Adapter,
    settings: BtleSettings,
    events: Sender<TransportEvent>,
    radio: Arc<Mutex<RadioState>>,
    peripherals: Arc<Mutex<HashMap<DeviceId, Peripheral>>>,
    connected: ConnectedPeripheral,
    link: Option<Link>,
    cancel: CancellationToken,
    watcher: JoinHandle<()>,
}

impl BtleTransport {
    pub async fn new(cancel: CancellationToken, config: &Config, events: Sender<TransportEvent>) -> Result<Self, DeviceError> {
        let manager = Manager::new().await?;
        let adapter = manager.adapters().await?.into_iter().next().ok_or(DeviceError::NoAdapter)?;
        info!("Using adapter {}", adapter.adapter_info().await.unwrap_or("UNKNOWN".to_string()));

        let radio = match adapter.adapter_state().await {
            Ok(state) => radio_state_from(state),
            Err(err) => {
                warn!("Could not query adapter state: {:?}", err);
                RadioState::Unknown
            },
        };
        info!("Radio is {}", radio);

        let radio = Arc::new(Mutex::new(radio));
        let connected: ConnectedPeripheral = Arc::new(Mutex::new(None));
        let central_events = adapter.events().await?;
        let watcher = watch_adapter_task(cancel.clone(), central_events, radio.clone(), connected.clone(), events.clone());

        Ok(BtleTransport {
            adapter,
            settings: BtleSettings {
                service_uuid: config.service_uuid,
                heading_uuid: config.heading_characteristic_uuid,
                scan_window: Duration::from_millis(config.scan_window_ms),
            },
            events,
            radio,
            peripherals: Arc::new(Mutex::new(HashMap::new())),
            connected,
            link: None,
            cancel,
            watcher,
        })
    }

    // a scan and the connect that follows it share one token
    fn link_for(&mut self, session: SessionId) -> CancellationToken {
        if let Some(link) = &self.link {
            if link.session == session {
                return link.cancel.clone();
            }
        }

        self.disconnect();
        let cancel = self.cancel.child_token();
        self.link = Some(Link { session, cancel: cancel.clone() });
        cancel
    }

    fn report_now(&mut self, event: TransportEvent) {
        if let Err(err) = self.events.try_send(event) {
            warn!("Failed to report transport event: {:?}", err);
        }
    }
}

impl Drop for BtleTransport {
    fn drop(&mut self) {
        self.disconnect();
        self.watcher.abort();
    }
}

async fn report(events: &mut Sender<TransportEvent>, event: TransportEvent) {
    if events.send(event).await.is_err() {
        debug!("Transport event receiver is gone");
    }
}

fn watch_adapter_task(
    cancel: CancellationToken,
    mut central_events: std::pin::Pin<Box<dyn futures::Stream<Item = CentralEvent> + Send>>,
    radio: Arc<Mutex<RadioState>>,
    connected: ConnectedPeripheral,
    mut events: Sender<TransportEvent>,
) -> JoinHandle<()> {
    spawn(async move {
        'mainloop: loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    break 'mainloop;
                },
                event = central_events.next() => match event {
                    None => {
                        warn!("Adapter event stream ended");
                        break 'mainloop;
                    },
                    Some(CentralEvent::StateUpdate(state)) => {
                        let state = radio_state_from(state);
                        *radio.lock().expect("Failed to lock radio state") = state;
                        report(&mut events, TransportEvent::RadioStateChanged(state)).await;
                    },
                    Some(CentralEvent::DeviceDisconnected(id)) => {
                        let session = match &*connected.lock().expect("Failed to lock connected peripheral") {
                            Some((session, connected_id)) if *connected_id == id => Some(*session),
                            _ => None,
                        };

                        if let Some(session) = session {
                            info!("Peripheral disconnected by the adapter");
                            report(&mut events, TransportEvent::Disconnected { session }).await;
                        }
                    },
                    Some(_) => {},
                },
            }
        }
    })
}

async fn find_peripherals(adapter: &Adapter, service_uuid: Uuid) -> Result<Vec<(DeviceId, Peripheral)>, DeviceError> {
    let mut found = Vec::new();

    for peripheral in adapter.peripherals().await? {
        match peripheral.properties().await {
            Err(err) => {
                warn!("Could not query peripheral for properties: {:?}", err);
            },
            Ok(None) => {
                warn!("Peripheral has no properties");
            },
            Ok(Some(properties)) => {
                // Some environments ignore the filter, so make sure to check the service uuid again
                if !properties.services.contains(&service_uuid) {
                    continue;
                }

                // macOS does not expose addresses, fall back to the platform id
                let address = properties.address.to_string();
                let id = if address == "00:00:00:00:00:00" {
                    DeviceId::new(format!("{:?}", peripheral.id()))
                } else {
                    DeviceId::new(address)
                };

                info!(
                    "Found headset {} {}",
                    id,
                    properties.local_name.unwrap_or(String::from("NONE")),
                );
                found.push((id, peripheral));
            },
        }
    }

    Ok(found)
}

fn scan_task(
    cancel: CancellationToken,
    adapter: Adapter,
    settings: BtleSettings,
    session: SessionId,
    peripherals: Arc<Mutex<HashMap<DeviceId, Peripheral>>>,
    mut events: Sender<TransportEvent>,
) {
    spawn(async move {
        let filter = ScanFilter {
            services: vec![settings.service_uuid],
        };

        info!("Scanning for {:?}...", settings.scan_window);
        if let Err(err) = adapter.start_scan(filter).await {
            warn!("Scanning failed {:?}", err);
            let reason = FailureReason::ScanFailed(err.to_string());
            report(&mut events, TransportEvent::ConnectionFailed { session, reason }).await;
            return;
        }

        let cancelled = tokio::select! {
            _ = cancel.cancelled() => true,
            _ = sleep(settings.scan_window) => false,
        };

        if let Err(err) = adapter.stop_scan().await {
            warn!("Failed to stop scanning: {:?}", err);
        }

        if cancelled {
            debug!("Scan for session {} cancelled", session);
            report(&mut events, TransportEvent::Disconnected { session }).await;
            return;
        }

        match find_peripherals(&adapter, settings.service_uuid).await {
            Ok(found) => {
                let candidates = {
                    let mut candidates = IndexSet::new();
                    let mut known = peripherals.lock().expect("Failed to lock peripherals");
                    for (id, peripheral) in found {
                        candidates.insert(id.clone());
                        known.insert(id, peripheral);
                    }
                    candidates
                };

                report(&mut events, TransportEvent::Discovered { session, candidates }).await;
            },
            Err(err) => {
                warn!("Finding peripherals failed: {:?}", err);
                let reason = FailureReason::ScanFailed(err.to_string());
                report(&mut events, TransportEvent::ConnectionFailed { session, reason }).await;
            },
        }
    });
}

async fn connect_peripheral(peripheral: &Peripheral, service_uuid: Uuid, heading_uuid: Uuid) -> Result<Characteristic, DeviceError> {
    info!("Connecting to peripheral...");
    peripheral.connect().await?;

    info!("Connected; Discovering services...");
    peripheral.discover_services().await?;

    for service in peripheral.services() {
        if service.uuid != service_uuid {
            continue;
        }

        for characteristic in &service.characteristics {
            if characteristic.uuid != heading_uuid {
                continue;
            }

            info!("Subscribing to characteristic {:?} {:?}", service.uuid, characteristic.uuid);
            peripheral.subscribe(characteristic).await?;
            return Ok(characteristic.clone());
        }
    }

    Err(DeviceError::MissingCharacteristic)
}

async fn disconnect_peripheral(peripheral: &Peripheral) {
    match timeout(Duration::from_millis(DISCONNECT_DEADLINE), peripheral.disconnect()).await {
        Err(_) => warn!("Disconnecting took too long"),
        Ok(Err(err)) => warn!("Failed to disconnect peripheral: {:?}", err),
        Ok(Ok(())) => info!("Peripheral disconnected"),
    }
}

fn link_task(
    cancel: CancellationToken,
    settings: BtleSettings,
    session: SessionId,
    device: DeviceId,
    peripheral: Peripheral,
    connected: ConnectedPeripheral,
    mut events: Sender<TransportEvent>,
) {
    spawn(async move {
        let fut = timeout(
            Duration::from_millis(CONNECT_DEADLINE),
            connect_peripheral(&peripheral, settings.service_uuid, settings.heading_uuid),
        );

        let result = tokio::select! {
            _ = cancel.cancelled() => {
                info!("Connect to {} cancelled", device);
                disconnect_peripheral(&peripheral).await;
                report(&mut events, TransportEvent::Disconnected { session }).await;
                return;
            },
            result = fut => result,
        };

        let data_char = match result {
            Ok(Ok(data_char)) => data_char,
            Ok(Err(err)) => {
                warn!("Connecting to peripheral failed: {:?}", err);
                disconnect_peripheral(&peripheral).await;
                let reason = FailureReason::LinkFailed(err.to_string());
                report(&mut events, TransportEvent::ConnectionFailed { session, reason }).await;
                return;
            },
            Err(_) => {
                warn!("Connecting to peripheral took too long");
                disconnect_peripheral(&peripheral).await;
                let reason = FailureReason::LinkFailed(String::from("timed out"));
                report(&mut events, TransportEvent::ConnectionFailed { session, reason }).await;
                return;
            },
        };

        let mut notification_stream = match peripheral.notifications().await {
            Ok(stream) => stream,
            Err(err) => {
                warn!("Failed to open notification stream: {:?}", err);
                disconnect_peripheral(&peripheral).await;
                let reason = FailureReason::LinkFailed(err.to_string());
                report(&mut events, TransportEvent::ConnectionFailed { session, reason }).await;
                return;
            },
        };

        *connected.lock().expect("Failed to lock connected peripheral") = Some((session, peripheral.id()));
        info!("Peripheral ready");
        report(&mut events, TransportEvent::Connected { session, device }).await;

        'mainloop: loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    break 'mainloop;
                },
                notification = notification_stream.next() => match notification {
                    None => {
                        warn!("Notification stream ended");
                        break 'mainloop;
                    },
                    Some(data) if data.uuid == data_char.uuid => {
                        match decode_heading_frame(&data.value) {
                            Err(err) => warn!("Failed to decode heading {:?}", err),
                            Ok(angle_degrees) => {
                                let sample = HeadingSample::new(angle_degrees, Instant::now());
                                report(&mut events, TransportEvent::Heading { session, sample }).await;
                            },
                        }
                    },
                    Some(_) => {},
                },
            }
        }

        *connected.lock().expect("Failed to lock connected peripheral") = None;
        disconnect_peripheral(&peripheral).await;
        report(&mut events, TransportEvent::Disconnected { session }).await;
    });
}

impl Transport for BtleTransport {
    fn radio_state(&self) -> RadioState {
        *self.radio.lock().expect("Failed to lock radio state")
    }

    fn start_scan(&mut self, session: SessionId) -> Result<(), DeviceError> {
        let radio = self.radio_state();
        if !radio.is_powered_on() {
            return Err(DeviceError::TransportUnavailable(radio));
        }

        let cancel = self.link_for(session);
        scan_task(cancel, self.adapter.clone(), self.settings.clone(), session, self.peripherals.clone(), self.events.clone());
        Ok(())
    }

    fn connect(&mut self, session: SessionId, device: &DeviceId) {
        let peripheral = self.peripherals.lock().expect("Failed to lock peripherals").get(device).cloned();

        let Some(peripheral) = peripheral else {
            warn!("Asked to connect to unknown peripheral {}", device);
            let reason = FailureReason::LinkFailed(DeviceError::UnknownDevice(device.clone()).to_string());
            self.report_now(TransportEvent::ConnectionFailed { session, reason });
            return;
        };

        let cancel = self.link_for(session);
        link_task(cancel, self.settings.clone(), session, device.clone(), peripheral, self.connected.clone(), self.events.clone());
    }

    fn disconnect(&mut self) {
        if let Some(link) = self.link.take() {
            debug!("Cancelling link of session {}", link.session);
            link.cancel.cancel();
        }
    }
}
