//! Space Keys
//!
//! Sender-key group encryption for spaces: every member owns one outbound
//! ratchet per space and distributes its seed to the other members, who keep
//! one inbound ratchet per sender. Key material is rotated on a schedule and
//! whenever the roster changes.

pub mod crypto;
pub mod identity;
pub mod protocol;
pub mod rotation;
pub mod space;
pub mod storage;
pub mod utils;
