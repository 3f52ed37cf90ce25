mod material;
mod prekey;

pub use material::{IdentityMaterial, IdentityMaterialManager, MaterialError, MemberKeys};
pub use prekey::{PreKeyError, PreKeyRecord, SignedPreKeyRecord};

/*
 * Identity & pre-key material for Space Keys
 *
 * Loads a member's long-term identity key pair, signed pre-key and one-time
 * pre-keys from the account data source and hands them to session
 * construction. Partial material is never returned.
 */
