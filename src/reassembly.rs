//! Reassembly of fragmented notification streams.
//!
//! A BLE notification carries around 20 bytes, so the OBU splits each
//! message across several notifications. Byte 0 of a fragment counts the
//! fragments still to come (0 marks the last one), byte 1 is reserved for
//! the transport, and the rest is payload. The counts of one message form a
//! strictly descending run `k, k-1, .., 1, 0`; a fragment that breaks the
//! run means a notification was dropped or reordered, and the message in
//! progress cannot be trusted.

use crate::error::ReassemblyError;

/// Which logical channel a decoded message belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageSource {
    /// Position reports from the on-board unit.
    ObuPosition,
    /// ITS application messages received over the air.
    ItsMessage,
}

/// One complete reassembled transmission. The payload is opaque at this
/// layer; `source` says which stream it belongs on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub source: MessageSource,
    pub payload: Vec<u8>,
}

/// Payload starts after the remaining-count byte and the reserved byte.
const PAYLOAD_OFFSET: usize = 2;

struct Pending {
    payload: Vec<u8>,
    /// Remaining count of the last accepted fragment, always > 0 here: a
    /// count of 0 completes the message and clears this state.
    expected_remaining: u8,
}

/// Rebuilds messages from an ordered fragment stream.
///
/// Pure state machine: no I/O, one in-flight message at most. Feed it every
/// notification from one characteristic via
/// [`enqueue_fragment`](MessageReassembler::enqueue_fragment); it hands back a [`Message`] each
/// time a fragment with remaining count 0 completes one. Any error discards
/// the message in progress, so the fragment after an error always starts
/// fresh, whatever its count.
pub struct MessageReassembler {
    source: MessageSource,
    max_message_len: usize,
    pending: Option<Pending>,
}

impl MessageReassembler {
    pub fn new(source: MessageSource, max_message_len: usize) -> Self {
        Self {
            source,
            max_message_len,
            pending: None,
        }
    }

    /// Consume one notification's bytes.
    ///
    /// Returns `Ok(Some(message))` when this fragment completed a message,
    /// `Ok(None)` when more fragments are awaited.
    pub fn enqueue_fragment(
        &mut self,
        fragment: &[u8],
    ) -> Result<Option<Message>, ReassemblyError> {
        let Some(&remaining) = fragment.first() else {
            self.pending = None;
            return Err(ReassemblyError::EmptyFragment);
        };

        // Taking the state up front means every error path below leaves the
        // reassembler empty, ready for a fresh message.
        let mut payload = match self.pending.take() {
            Some(pending) => {
                let expected = pending.expected_remaining - 1;
                if remaining != expected {
                    return Err(ReassemblyError::FragmentSkipped {
                        expected,
                        got: remaining,
                    });
                }
                pending.payload
            }
            None => Vec::new(),
        };

        payload.extend_from_slice(fragment.get(PAYLOAD_OFFSET..).unwrap_or(&[]));
        if payload.len() > self.max_message_len {
            return Err(ReassemblyError::MessageTooLarge {
                limit: self.max_message_len,
            });
        }

        if remaining == 0 {
            return Ok(Some(Message {
                source: self.source,
                payload,
            }));
        }

        self.pending = Some(Pending {
            payload,
            expected_remaining: remaining,
        });
        Ok(None)
    }

    /// True when no message is in progress.
    pub fn is_idle(&self) -> bool {
        self.pending.is_none()
    }
}

#[cfg(test)]
fn reassembler() -> MessageReassembler {
    MessageReassembler::new(MessageSource::ItsMessage, 4096)
}

#[test]
fn test_three_fragment_message() {
    let mut r = reassembler();
    assert_eq!(r.enqueue_fragment(&[0x02, 0x00, b'A', b'B']), Ok(None));
    assert_eq!(r.enqueue_fragment(&[0x01, 0x00, b'C', b'D']), Ok(None));
    let message = r.enqueue_fragment(&[0x00, 0x00, b'E', b'F']).unwrap().unwrap();
    assert_eq!(message.payload, b"ABCDEF");
    assert_eq!(message.source, MessageSource::ItsMessage);
    assert!(r.is_idle());
}

#[test]
fn test_single_fragment_message() {
    let mut r = reassembler();
    let message = r.enqueue_fragment(&[0x00, 0x07, 0xde, 0xad]).unwrap().unwrap();
    assert_eq!(message.payload, vec![0xde, 0xad]);
    assert!(r.is_idle());
}

#[test]
fn test_skipped_fragment_is_an_error() {
    let mut r = reassembler();
    assert_eq!(r.enqueue_fragment(&[0x02, 0x00, b'A', b'B']), Ok(None));
    let result = r.enqueue_fragment(&[0x00, 0x00, b'X', b'Y']);
    assert_eq!(
        result,
        Err(ReassemblyError::FragmentSkipped { expected: 1, got: 0 })
    );
    assert!(r.is_idle());
}

#[test]
fn test_fresh_start_after_error_accepts_any_count() {
    let mut r = reassembler();
    r.enqueue_fragment(&[0x05, 0x00, b'A']).unwrap();
    r.enqueue_fragment(&[0x02, 0x00, b'B']).unwrap_err();
    // No ordering constraint applies once the buffer was discarded.
    assert_eq!(r.enqueue_fragment(&[0x01, 0x00, b'C']), Ok(None));
    let message = r.enqueue_fragment(&[0x00, 0x00, b'D']).unwrap().unwrap();
    assert_eq!(message.payload, b"CD");
}

#[test]
fn test_state_empty_after_completion() {
    let mut r = reassembler();
    r.enqueue_fragment(&[0x01, 0x00, b'A']).unwrap();
    r.enqueue_fragment(&[0x00, 0x00, b'B']).unwrap();
    assert!(r.is_idle());
    // The next message is unaffected by the previous one.
    let message = r.enqueue_fragment(&[0x00, 0x00, b'Z']).unwrap().unwrap();
    assert_eq!(message.payload, b"Z");
}

#[test]
fn test_reserved_byte_is_ignored() {
    let mut r = reassembler();
    r.enqueue_fragment(&[0x01, 0xff, b'A']).unwrap();
    let message = r.enqueue_fragment(&[0x00, 0x13, b'B']).unwrap().unwrap();
    assert_eq!(message.payload, b"AB");
}

#[test]
fn test_header_only_fragment_has_empty_payload() {
    let mut r = reassembler();
    let message = r.enqueue_fragment(&[0x00]).unwrap().unwrap();
    assert!(message.payload.is_empty());
}

#[test]
fn test_empty_fragment_is_an_error() {
    let mut r = reassembler();
    r.enqueue_fragment(&[0x02, 0x00, b'A']).unwrap();
    assert_eq!(r.enqueue_fragment(&[]), Err(ReassemblyError::EmptyFragment));
    assert!(r.is_idle());
}

#[test]
fn test_oversized_message_is_an_error() {
    let mut r = MessageReassembler::new(MessageSource::ObuPosition, 4);
    assert_eq!(r.enqueue_fragment(&[0x01, 0x00, b'A', b'B', b'C']), Ok(None));
    let result = r.enqueue_fragment(&[0x00, 0x00, b'D', b'E']);
    assert_eq!(result, Err(ReassemblyError::MessageTooLarge { limit: 4 }));
    assert!(r.is_idle());
}
