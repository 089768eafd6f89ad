//! Vector-id codec.
//!
//! The index stores one 64-bit id per vector: the high half is the
//! per-segment document id, the low half a caller-supplied tag (by default
//! the vector's position within the document). Both halves must fit in 32
//! bits.

use crate::error::{Error, Result};

const HALF_MAX: u64 = u32::MAX as u64;

pub fn encode_vector_id(doc_id: u64, tag: u64) -> Result<u64> {
    if doc_id > HALF_MAX || tag > HALF_MAX {
        return Err(Error::VidOverflow { doc_id, tag });
    }
    Ok((doc_id << 32) | tag)
}

pub fn decode_vector_id(vid: u64) -> (u64, u64) {
    (vid >> 32, vid & 0xFFFF_FFFF)
}
