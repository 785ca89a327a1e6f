//! AMC message frames.
//!
//! Every message on the bus is exactly 64 bytes: a 16-byte header holding
//! the source and destination service-name pointers, then a 48-byte body.
//! Larger logical messages are carried as an initial frame plus a trailing
//! payload agreed on by sender and recipient (typically via a shared or
//! kernel-mapped buffer).
//!
//! The body is interpreted by convention as one of three shapes: a charlist
//! (length-prefixed bytes), a command (u32 id + opaque data), or a command
//! with a pointer value. The first u32 doubles as the event id for the
//! core command protocol.

use core::mem::size_of;

/// Total wire size of one frame.
pub const AMC_MESSAGE_SIZE: usize = 64;

/// Service names are at most 64 bytes including the NUL.
pub const AMC_MAX_SERVICE_NAME_LEN: usize = 64;

/// Frame header: two name pointers. The pointers reference the kernel's
/// interned service-name strings, which live in the shared kernel half and
/// stay valid for the life of the system.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct AmcMessageHeader {
    pub source: u64,
    /// Null for broadcast frames.
    pub dest: u64,
}

/// Bytes of body in every frame.
pub const AMC_MESSAGE_PAYLOAD_SIZE: usize = AMC_MESSAGE_SIZE - size_of::<AmcMessageHeader>();

/// One 64-byte message frame.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct AmcMessage {
    pub header: AmcMessageHeader,
    pub body: [u8; AMC_MESSAGE_PAYLOAD_SIZE],
}

impl AmcMessage {
    /// Build a frame, copying `body` (at most the payload size) and zero
    /// filling the rest.
    pub fn new(source: u64, dest: u64, body: &[u8]) -> Self {
        debug_assert!(body.len() <= AMC_MESSAGE_PAYLOAD_SIZE);
        let mut payload = [0u8; AMC_MESSAGE_PAYLOAD_SIZE];
        let len = body.len().min(AMC_MESSAGE_PAYLOAD_SIZE);
        payload[..len].copy_from_slice(&body[..len]);
        Self {
            header: AmcMessageHeader { source, dest },
            body: payload,
        }
    }

    /// First u32 of the body, the event id of command-shaped messages.
    pub fn event(&self) -> u32 {
        u32::from_le_bytes([self.body[0], self.body[1], self.body[2], self.body[3]])
    }

    /// View the body as a charlist: a 1-byte length plus opaque data.
    pub fn charlist(&self) -> &[u8] {
        let len = (self.body[0] as usize).min(AMC_MESSAGE_PAYLOAD_SIZE - 1);
        &self.body[1..1 + len]
    }

    /// The raw 64 bytes of the frame.
    pub fn as_bytes(&self) -> &[u8; AMC_MESSAGE_SIZE] {
        // SAFETY: AmcMessage is repr(C) with size 64 and no padding
        // (16-byte header + 48-byte array).
        unsafe { &*(self as *const AmcMessage as *const [u8; AMC_MESSAGE_SIZE]) }
    }
}

/// Build a command-shaped body: u32 event id followed by `data`.
pub fn command_body(event: u32, data: &[u8]) -> [u8; AMC_MESSAGE_PAYLOAD_SIZE] {
    debug_assert!(data.len() <= AMC_MESSAGE_PAYLOAD_SIZE - 4);
    let mut body = [0u8; AMC_MESSAGE_PAYLOAD_SIZE];
    body[..4].copy_from_slice(&event.to_le_bytes());
    let len = data.len().min(AMC_MESSAGE_PAYLOAD_SIZE - 4);
    body[4..4 + len].copy_from_slice(&data[..len]);
    body
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test_case]
    fn test_frame_is_exactly_64_bytes() {
        assert_eq!(size_of::<AmcMessage>(), AMC_MESSAGE_SIZE);
        assert_eq!(size_of::<AmcMessageHeader>(), 16);
        assert_eq!(AMC_MESSAGE_PAYLOAD_SIZE, 48);
    }

    #[test_case]
    fn test_event_id_is_first_u32() {
        let body = command_body(1 << 4, &[0xAA, 0xBB]);
        let msg = AmcMessage::new(0, 0, &body);
        assert_eq!(msg.event(), 1 << 4);
        assert_eq!(msg.body[4], 0xAA);
        assert_eq!(msg.body[5], 0xBB);
    }

    #[test_case]
    fn test_charlist_view() {
        let mut body = [0u8; AMC_MESSAGE_PAYLOAD_SIZE];
        body[0] = 3;
        body[1..4].copy_from_slice(b"abc");
        let msg = AmcMessage::new(0, 0, &body);
        assert_eq!(msg.charlist(), b"abc");
    }

    #[test_case]
    fn test_short_body_zero_filled() {
        let msg = AmcMessage::new(0, 0, &[1, 2, 3]);
        assert_eq!(&msg.body[..3], &[1, 2, 3]);
        assert!(msg.body[3..].iter().all(|&b| b == 0));
    }
}
