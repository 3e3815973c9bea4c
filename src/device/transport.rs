use crate::device::types::{DeviceId, RadioState, SessionId};
use crate::error::DeviceError;

/**
 * The radio side of a device session.
 *
 * A transport never owns session state. Commands return immediately; their outcome is reported
 * later as TransportEvents on the channel the transport was created with, which is the only
 * consumer of those events. Every fact about a session is tagged with the SessionId that was
 * passed in with the command that caused it.
 */
pub trait Transport: Send {
    /// The last radio state the transport knows about.
    fn radio_state(&self) -> RadioState;

    /// Starts looking for headsets. Eventually reports `Discovered` or `ConnectionFailed`.
    /// Fails right away with `TransportUnavailable` if the radio is not powered on.
    fn start_scan(&mut self, session: SessionId) -> Result<(), DeviceError>;

    /// Starts connecting to `device`. Eventually reports `Connected` or `ConnectionFailed`.
    fn connect(&mut self, session: SessionId, device: &DeviceId);

    /// Drops the scan/link of the current session, if any, and eventually reports `Disconnected`
    /// for it. Calling this when there is nothing to disconnect is fine.
    fn disconnect(&mut self);
}

impl<T: Transport + ?Sized> Transport for Box<T> {
    fn radio_state(&self) -> RadioState {
        (**self).radio_state()
    }

    fn start_scan(&mut self, session: SessionId) -> Result<(), DeviceError> {
        (**self).start_scan(session)
    }

    fn connect(&mut self, session: SessionId, device: &DeviceId) {
        (**self).connect(session, device)
    }

    fn disconnect(&mut self) {
        (**self).disconnect()
    }
}
