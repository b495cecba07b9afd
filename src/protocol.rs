//! Wire framing for the rendezvous socket.
//!
//! One connection carries exactly one item: the master writes the JSON
//! encoding of the tuple in full and closes, the worker reads to EOF and
//! decodes. Connection close is the only framing; there is no length
//! prefix and no protocol state to desynchronize.

use crate::error::{DivvyError, Result};
use crate::task::WorkItem;

/// Maximum size of one serialized work item, in bytes.
///
/// Oversized items are rejected in the master before any hand-off, so a
/// worker never observes a truncated frame.
pub const MAX_FRAME_SIZE: usize = 16384;

/// Serialize an item for hand-off.
pub fn encode(item: &WorkItem) -> Result<Vec<u8>> {
    let data = serde_json::to_vec(&item.0)?;
    if data.len() > MAX_FRAME_SIZE {
        return Err(DivvyError::FrameTooLarge {
            size: data.len(),
            limit: MAX_FRAME_SIZE,
        });
    }
    Ok(data)
}

/// Decode one received frame back into an item.
pub fn decode(data: &[u8]) -> Result<WorkItem> {
    if data.len() > MAX_FRAME_SIZE {
        return Err(DivvyError::FrameTooLarge {
            size: data.len(),
            limit: MAX_FRAME_SIZE,
        });
    }
    let fields = serde_json::from_slice(data)?;
    Ok(WorkItem(fields))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_encode_decode_heterogeneous_tuple() {
        let item = WorkItem::new(vec![json!(7), json!("seven"), json!(null), json!([1, 2])]);
        let frame = encode(&item).unwrap();
        assert_eq!(decode(&frame).unwrap(), item);
    }

    #[test]
    fn test_encode_rejects_oversized_item() {
        let item = WorkItem::new(vec![json!("x".repeat(MAX_FRAME_SIZE))]);
        match encode(&item) {
            Err(DivvyError::FrameTooLarge { size, limit }) => {
                assert!(size > limit);
                assert_eq!(limit, MAX_FRAME_SIZE);
            }
            other => panic!("expected FrameTooLarge, got {:?}", other),
        }
    }

    #[test]
    fn test_encode_accepts_item_at_limit() {
        // 16384 bytes total: the quotes and brackets cost 4 bytes.
        let item = WorkItem::new(vec![json!("x".repeat(MAX_FRAME_SIZE - 4))]);
        let frame = encode(&item).unwrap();
        assert_eq!(frame.len(), MAX_FRAME_SIZE);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(decode(b"not json at all").is_err());
        assert!(decode(br#"{"an":"object"}"#).is_err()); // items are arrays
    }

    #[test]
    fn test_decode_empty_tuple() {
        let item = decode(b"[]").unwrap();
        assert!(item.is_empty());
    }
}
