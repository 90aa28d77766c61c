//! VP8 bitstream helpers
//!
//! Only the uncompressed data chunk at the start of each frame is inspected:
//! a 3-byte frame tag, followed on key frames by the start code and the
//! 14-bit width/height fields (RFC 6386, section 9.1).

/// Start code present in every key frame header
const KEYFRAME_START_CODE: [u8; 3] = [0x9d, 0x01, 0x2a];

/// Bytes needed to read the key frame dimensions
const KEYFRAME_HEADER_LEN: usize = 10;

/// Whether an encoded VP8 frame is a key frame (bit 0 of the frame tag is clear)
pub fn is_keyframe(data: &[u8]) -> bool {
    data.first().map(|tag| tag & 0x01 == 0).unwrap_or(false)
}

/// Encoded width and height of a key frame, `None` for inter frames or
/// truncated headers
pub fn keyframe_dimensions(data: &[u8]) -> Option<(u16, u16)> {
    if !is_keyframe(data) || data.len() < KEYFRAME_HEADER_LEN {
        return None;
    }
    if data[3..6] != KEYFRAME_START_CODE {
        return None;
    }

    let raw = u32::from_le_bytes([data[6], data[7], data[8], data[9]]);
    // Upper two bits of each half carry the scaling mode
    let width = (raw & 0x3FFF) as u16;
    let height = ((raw >> 16) & 0x3FFF) as u16;

    if width == 0 || height == 0 {
        return None;
    }
    Some((width, height))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{vp8_interframe, vp8_keyframe};

    #[test]
    fn test_keyframe_flag() {
        assert!(is_keyframe(&vp8_keyframe(1280, 720)));
        assert!(!is_keyframe(&vp8_interframe()));
        assert!(!is_keyframe(&[]));
    }

    #[test]
    fn test_keyframe_dimensions() {
        assert_eq!(keyframe_dimensions(&vp8_keyframe(1280, 720)), Some((1280, 720)));
        assert_eq!(keyframe_dimensions(&vp8_keyframe(640, 480)), Some((640, 480)));
        assert_eq!(keyframe_dimensions(&vp8_interframe()), None);
    }

    #[test]
    fn test_scaling_bits_are_ignored() {
        let mut frame = vp8_keyframe(1280, 720).to_vec();
        // Horizontal and vertical scale = 2
        frame[7] |= 0x80;
        frame[9] |= 0x80;
        assert_eq!(keyframe_dimensions(&frame), Some((1280, 720)));
    }

    #[test]
    fn test_truncated_or_corrupt_header() {
        let frame = vp8_keyframe(1280, 720);
        assert_eq!(keyframe_dimensions(&frame[..8]), None);

        let mut bad_start = frame.to_vec();
        bad_start[4] = 0x00;
        assert_eq!(keyframe_dimensions(&bad_start), None);
    }
}
