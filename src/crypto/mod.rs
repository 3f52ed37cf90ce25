mod keys;
pub mod kdf;
pub mod signing;
pub mod envelope;

pub use keys::{KeyError, KeyPair, PublicKey, SecretKey, KEY_LENGTH};
pub use signing::{SignatureError, SigningKeyPair};
pub use envelope::{seal, open, EnvelopeError, SealedBox};

/*
 * Cryptographic primitives for Space Keys
 *
 * This module provides the narrow primitive layer the session code consumes:
 * - Identity key pairs (Ed25519 + X25519) and key agreement
 * - HMAC/HKDF key derivation
 * - Signatures for sender chains and signed pre-keys
 * - Sealing distributions to a single recipient
 */
