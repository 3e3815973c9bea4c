use uuid::Uuid;

/**
 * Default time (milliseconds) without headset data before a connected session lingers.
 */
pub const DEFAULT_LINGER_TIMEOUT: u64 = 3000;

/**
 * Default time (milliseconds) to scan before reporting the headsets found.
 */
pub const DEFAULT_SCAN_WINDOW: u64 = 4000;

/**
 * Lower bound (milliseconds) on the linger timeout.
 */
pub const MIN_LINGER_TIMEOUT: u64 = 250;

/**
 * Lower bound (milliseconds) on how often the controller checks for a lingering headset.
 */
pub const MIN_LINGER_CHECK_PERIOD: u64 = 50;

/**
 * How long (milliseconds) establishing the link, including service discovery, may take.
 */
pub const CONNECT_DEADLINE: u64 = 10000;

/**
 * How long (milliseconds) disconnecting a peripheral may take.
 */
pub const DISCONNECT_DEADLINE: u64 = 2000;

/**
 * The UUID of the headset's head tracking GATT service.
 */
pub const HEADSET_SERVICE: &str = "6e4a1b20-3c5d-4f1e-9a7b-2d8c0e5f4a10";

/**
 * The UUID of the characteristic that notifies the fused heading.
 */
pub const HEADING_CHARACTERISTIC: &str = "6e4a1b21-3c5d-4f1e-9a7b-2d8c0e5f4a10";

/**
 * A heading frame is a little endian u16 carrying tenths of a degree.
 * - 0 is north
 * - HEADING_TENTHS_RANGE (360.0 degrees) is out of range, the largest value is 3599 (359.9 degrees)
 */
pub const HEADING_FRAME_LEN: usize = 2;
pub const HEADING_TENTHS_RANGE: u16 = 3600;

pub fn make_headset_service_uuid() -> Uuid {
    Uuid::parse_str(HEADSET_SERVICE).unwrap()
}

pub fn make_heading_characteristic_uuid() -> Uuid {
    Uuid::parse_str(HEADING_CHARACTERISTIC).unwrap()
}
