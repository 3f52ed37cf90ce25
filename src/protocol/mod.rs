mod address;
mod distribution_id;
mod group_cipher;
mod sender_key;
mod store;

pub use address::{ProtocolAddress, DEFAULT_DEVICE_ID};
pub use distribution_id::derive_distribution_id;
pub use group_cipher::{
    create_sender_key_distribution_message, new_sender_key_record,
    process_sender_key_distribution_message, rotate_sender_key, GroupCipher,
};
pub use sender_key::{
    SenderKeyDistributionMessage, SenderKeyError, SenderKeyMessage, SenderKeyRecord,
    SenderKeyState, MAX_FORWARD_JUMPS, MAX_MESSAGE_KEYS, SENDER_KEY_VERSION,
};
pub use store::{ProtocolStore, SenderKeyStore};

/*
 * Sender-key group protocol
 *
 * One symmetric chain per (sender, distribution id). The owner advances it on
 * every encrypt; receivers hold a copy seeded from the owner's distribution
 * message and advance it on decrypt. Messages are signed by a per-chain key.
 */
