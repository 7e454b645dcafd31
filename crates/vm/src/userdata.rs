//! Userdata objects and the reserved tag space.
//!
//! A userdata is a tagged blob with an optional metatable. Most tags carry
//! raw bytes; the reserved tags below carry typed payloads owned by the
//! runtime and surfaced to scripts as opaque values.

use crate::events::EventManager;
use crate::timers::TimerManager;
use crate::value::TableRef;

/// Reserved userdata tags. Values are implementation constants; only their
/// distinctness matters.
pub mod tags {
    /// 4-float quaternion.
    pub const QUATERNION: u8 = 1;
    /// 16-byte binary UUID with a compressed flag.
    pub const COMPRESSED_UUID: u8 = 2;
    /// Transient per-dispatch event context; valid only inside a handler.
    pub const EVENT_CONTEXT: u8 = 3;
    /// Per-instance event manager singleton.
    pub const EVENT_MANAGER: u8 = 4;
    /// Per-instance timer manager singleton.
    pub const TIMER_MANAGER: u8 = 5;
    /// First tag available to embedders.
    pub const FIRST_EMBEDDER: u8 = 64;
}

/// Payload of a userdata object.
#[derive(Debug, Clone)]
pub enum UserdataPayload {
    /// Embedder-defined bytes.
    Raw(Vec<u8>),
    /// The event dispatch singleton of a script instance.
    EventManager(EventManager),
    /// The timer wheel singleton of a script instance.
    TimerManager(TimerManager),
}

/// A userdata object: destructor tag, payload, optional metatable.
#[derive(Debug, Clone)]
pub struct Userdata {
    pub tag: u8,
    pub payload: UserdataPayload,
    pub metatable: Option<TableRef>,
}

impl Userdata {
    /// Creates a raw userdata.
    pub fn raw(tag: u8, bytes: Vec<u8>) -> Self {
        Userdata {
            tag,
            payload: UserdataPayload::Raw(bytes),
            metatable: None,
        }
    }

    /// Returns the raw bytes, if this is a raw payload.
    pub fn raw_bytes(&self) -> Option<&[u8]> {
        match &self.payload {
            UserdataPayload::Raw(bytes) => Some(bytes),
            _ => None,
        }
    }

    /// Returns the event manager, if this userdata wraps one.
    pub fn event_manager(&self) -> Option<&EventManager> {
        match &self.payload {
            UserdataPayload::EventManager(m) => Some(m),
            _ => None,
        }
    }

    /// Returns the event manager mutably, if this userdata wraps one.
    pub fn event_manager_mut(&mut self) -> Option<&mut EventManager> {
        match &mut self.payload {
            UserdataPayload::EventManager(m) => Some(m),
            _ => None,
        }
    }

    /// Returns the timer manager, if this userdata wraps one.
    pub fn timer_manager(&self) -> Option<&TimerManager> {
        match &self.payload {
            UserdataPayload::TimerManager(m) => Some(m),
            _ => None,
        }
    }

    /// Returns the timer manager mutably, if this userdata wraps one.
    pub fn timer_manager_mut(&mut self) -> Option<&mut TimerManager> {
        match &mut self.payload {
            UserdataPayload::TimerManager(m) => Some(m),
            _ => None,
        }
    }

    pub(crate) fn byte_size(&self) -> usize {
        std::mem::size_of::<Userdata>()
            + match &self.payload {
                UserdataPayload::Raw(bytes) => bytes.capacity(),
                UserdataPayload::EventManager(m) => m.byte_size(),
                UserdataPayload::TimerManager(m) => m.byte_size(),
            }
    }
}
