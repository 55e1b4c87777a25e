//! Wire protocol shared by the tamer servers and clients.
//!
//! `frame` owns the envelope (length, type, checksum). `packets` owns the
//! type ids and the typed payload bodies that travel inside it.

pub mod frame;
pub mod packets;

pub use frame::{
    checksum, split_frames, Frame, FrameError, CHECKSUM_CONSTANT, MAX_FRAME_LEN, MIN_FRAME_LEN,
};
pub use packets::{types, MapKey, MapKind, Payload};

/// Plaintext line written to a throttled socket before it is closed.
pub const THROTTLE_NOTICE: &str = "Too many connection attempts. Try again later.\n";
