use crate::device::constants::{HEADING_FRAME_LEN, HEADING_TENTHS_RANGE};
use crate::error::DeviceError;

/// Decodes a heading notification into degrees in [0, 360).
pub fn decode_heading_frame(data: &[u8]) -> Result<f32, DeviceError> {
    let bytes: [u8; HEADING_FRAME_LEN] = data
        .try_into()
        .map_err(|_| DeviceError::MalformedHeadingFrame { len: data.len() })?;

    let tenths = u16::from_le_bytes(bytes);
    if tenths >= HEADING_TENTHS_RANGE {
        return Err(DeviceError::HeadingOutOfRange { tenths });
    }

    Ok(f32::from(tenths) / 10.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_tenths_of_a_degree() {
        assert_eq!(decode_heading_frame(&[0x00, 0x00]).unwrap(), 0.0);
        assert_eq!(decode_heading_frame(&[0x7d, 0x00]).unwrap(), 12.5);
        assert_eq!(decode_heading_frame(&[0x0f, 0x0e]).unwrap(), 359.9);
    }

    #[test]
    fn rejects_bad_frames() {
        assert!(matches!(decode_heading_frame(&[]), Err(DeviceError::MalformedHeadingFrame { len: 0 })));
        assert!(matches!(decode_heading_frame(&[1, 2, 3]), Err(DeviceError::MalformedHeadingFrame { len: 3 })));
        assert!(matches!(decode_heading_frame(&[0x10, 0x0e]), Err(DeviceError::HeadingOutOfRange { tenths: 3600 })));
    }
}
