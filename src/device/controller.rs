use std::sync::Arc;
use std::time::Duration;
use futures::{SinkExt, StreamExt};
use futures::channel::mpsc::{channel, Receiver, Sender};
use futures::channel::oneshot;
use log::{debug, info};
use tokio::spawn;
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::bus::{EventBus, Subscriber};
use crate::config::types::Config;
use crate::device::constants::MIN_LINGER_CHECK_PERIOD;
use crate::device::session::{DeviceSession, SessionMachine};
use crate::device::transport::Transport;
use crate::device::types::{DeviceId, HeadingSample, SessionState, TransportEvent};
use crate::error::SessionError;
use crate::heading::{HeadingReceiver, HeadingStream};

enum Command {
    Connect(oneshot::Sender<Result<(), SessionError>>),
    Disconnect(oneshot::Sender<()>),
    Select(DeviceId, oneshot::Sender<Result<(), SessionError>>),
    Session(oneshot::Sender<DeviceSession>),
    Shutdown,
}

/**
 * Cheap to clone handle to a running session controller. Requests are queued to the controller
 * task and answered with the verdict of the state machine; the outcome of a connect (or
 * disconnect) itself is published on the event bus.
 */
#[derive(Clone)]
pub struct SessionHandle {
    commands: Sender<Command>,
    bus: Arc<EventBus>,
    headings: Arc<HeadingStream>,
}

impl SessionHandle {
    async fn send(&self, command: Command) -> Result<(), SessionError> {
        let mut commands = self.commands.clone();
        commands.send(command).await.map_err(|_| SessionError::ControllerStopped)
    }

    pub async fn connect(&self) -> Result<(), SessionError> {
        let (reply, response) = oneshot::channel();
        self.send(Command::Connect(reply)).await?;
        response.await.map_err(|_| SessionError::ControllerStopped)?
    }

    pub async fn disconnect(&self) -> Result<(), SessionError> {
        let (reply, response) = oneshot::channel();
        self.send(Command::Disconnect(reply)).await?;
        response.await.map_err(|_| SessionError::ControllerStopped)
    }

    pub async fn select_device(&self, device: DeviceId) -> Result<(), SessionError> {
        let (reply, response) = oneshot::channel();
        self.send(Command::Select(device, reply)).await?;
        response.await.map_err(|_| SessionError::ControllerStopped)?
    }

    /// A snapshot of the current session.
    pub async fn session(&self) -> Result<DeviceSession, SessionError> {
        let (reply, response) = oneshot::channel();
        self.send(Command::Session(reply)).await?;
        response.await.map_err(|_| SessionError::ControllerStopped)
    }

    pub async fn state(&self) -> Result<SessionState, SessionError> {
        Ok(self.session().await?.state)
    }

    /// Tears the session down and stops the controller task, after every request queued before it.
    pub async fn shutdown(&self) -> Result<(), SessionError> {
        self.send(Command::Shutdown).await
    }

    pub fn subscribe(&self, subscriber: &Arc<dyn Subscriber>) {
        self.bus.subscribe(subscriber);
    }

    pub fn unsubscribe(&self, subscriber: &Arc<dyn Subscriber>) {
        self.bus.unsubscribe(subscriber);
    }

    pub fn headings(&self) -> HeadingReceiver {
        self.headings.subscribe()
    }

    pub fn heading_replay(&self) -> Vec<HeadingSample> {
        self.headings.replay()
    }
}

fn linger_check_period(linger_timeout: Duration) -> Duration {
    (linger_timeout / 4).max(Duration::from_millis(MIN_LINGER_CHECK_PERIOD))
}

/**
 * Runs a SessionMachine on its own task. This task is the only place where the session is mutated,
 * so requests, transport facts and linger checks are applied strictly one after the other.
 *
 * The task ends, tearing the session down, when `cancel` is cancelled, on SessionHandle::shutdown,
 * or when every SessionHandle has been dropped.
 */
pub fn spawn_session_controller<T>(
    cancel: CancellationToken,
    transport: T,
    mut transport_events: Receiver<TransportEvent>,
    config: &Config,
) -> (SessionHandle, JoinHandle<()>)
where
    T: Transport + 'static,
{
    let (command_sender, mut command_receiver) = channel::<Command>(16);
    let bus = Arc::new(EventBus::new());
    let headings = Arc::new(HeadingStream::new(bus.clone(), config.heading_replay_capacity));
    let linger_timeout = config.linger_timeout();

    let mut machine = SessionMachine::new(transport, bus.clone(), headings.clone(), linger_timeout, Instant::now());

    let handle = spawn(async move {
        let mut linger_check = interval(linger_check_period(linger_timeout));
        linger_check.set_missed_tick_behavior(MissedTickBehavior::Delay);

        'mainloop: loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => {
                    break 'mainloop;
                },
                command = command_receiver.next() => {
                    match command {
                        Some(Command::Connect(reply)) => {
                            let _ = reply.send(machine.connect(Instant::now()));
                        },
                        Some(Command::Disconnect(reply)) => {
                            machine.disconnect();
                            let _ = reply.send(());
                        },
                        Some(Command::Select(device, reply)) => {
                            let _ = reply.send(machine.select_device(device));
                        },
                        Some(Command::Session(reply)) => {
                            let _ = reply.send(machine.session().clone());
                        },
                        Some(Command::Shutdown) => {
                            info!("Session controller shutdown requested");
                            break 'mainloop;
                        },
                        None => {
                            debug!("Every session handle is gone");
                            break 'mainloop;
                        },
                    }
                },
                Some(event) = transport_events.next() => {
                    machine.handle_transport_event(event, Instant::now());
                },
                _ = linger_check.tick() => {
                    machine.tick(Instant::now());
                },
            }
        }

        machine.teardown();
    });

    (SessionHandle { commands: command_sender, bus, headings }, handle)
}
