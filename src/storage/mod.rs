mod database;
mod key_record_store;

pub use database::{Database, DatabaseError};
pub use key_record_store::{KeyRecordStore, KeyRecordStoreError, SenderKeyEntity};
