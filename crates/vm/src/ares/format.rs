//! Persisted-state stream format.
//!
//! A stream opens with a four-byte magic tag, a version byte, and the
//! expected permanents-table size, then carries one typed root value.
//! Every value is a one-byte kind discriminator plus a per-kind payload;
//! collectable objects are indexed in order of first appearance and
//! repeats are written as back-references, which is also what makes
//! cyclic graphs and shared identities round-trip.

use crate::error::{VmError, VmResult};
use crate::heap::Heap;
use crate::userdata::Userdata;

/// Magic tag opening every persisted stream.
pub const STREAM_MAGIC: [u8; 4] = *b"ARES";

/// Stream format version.
pub const STREAM_VERSION: u8 = 1;

/// Value kind discriminators.
pub mod tag {
    pub const NIL: u8 = 0;
    pub const FALSE: u8 = 1;
    pub const TRUE: u8 = 2;
    pub const NUMBER: u8 = 3;
    pub const VECTOR: u8 = 4;
    pub const LIGHT_USERDATA: u8 = 5;
    pub const PERMANENT: u8 = 6;
    pub const BACKREF: u8 = 7;
    pub const STRING: u8 = 8;
    pub const TABLE: u8 = 9;
    pub const SCRIPT_CLOSURE: u8 = 10;
    pub const NATIVE_CLOSURE: u8 = 11;
    pub const THREAD: u8 = 12;
    pub const USERDATA: u8 = 13;
    pub const BUFFER: u8 = 14;
    pub const UPVALUE: u8 = 15;
    pub const PROTO: u8 = 16;
}

/// Userdata payload encodings.
pub mod payload {
    pub const RAW: u8 = 0;
    pub const EVENT_MANAGER: u8 = 1;
    pub const TIMER_MANAGER: u8 = 2;
    pub const CUSTOM: u8 = 3;
}

/// Thread status encodings. Running and errored tasks are not
/// serializable.
pub mod status {
    pub const FRESH: u8 = 0;
    pub const SUSPENDED: u8 = 1;
    pub const BREAK_SUSPENDED: u8 = 2;
    pub const FINISHED: u8 = 3;
}

/// Frame awaiting-state encodings.
pub mod awaiting {
    pub const NONE: u8 = 0;
    pub const RESUME: u8 = 1;
    pub const CALL: u8 = 2;
}

/// Embedder-registered byte codec for one userdata tag.
pub type UserdataEncodeFn = fn(&Heap, &Userdata) -> VmResult<Vec<u8>>;
/// Inverse of [`UserdataEncodeFn`].
pub type UserdataDecodeFn = fn(u8, Vec<u8>) -> VmResult<Userdata>;

/// A per-tag userdata codec pair.
#[derive(Clone, Copy)]
pub struct UserdataCodec {
    pub encode: UserdataEncodeFn,
    pub decode: UserdataDecodeFn,
}

/// Maps an upvalue/iteration-order style signed entry into its wire form:
/// `-1` becomes 0, slot `n` becomes `n + 1`.
pub fn encode_order_entry(entry: i32) -> VmResult<u32> {
    if entry < -1 {
        return Err(VmError::persist("iteration order entry below -1"));
    }
    Ok((entry + 1) as u32)
}

/// Inverse of [`encode_order_entry`].
pub fn decode_order_entry(raw: u32) -> i32 {
    raw as i32 - 1
}
