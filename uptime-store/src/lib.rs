/*!
File-backed record store.

Every record is one JSON document stored under a `(collection, key)` pair.
Collections are plain directories below the store root and every record is a
single `<key>.json` file inside its collection directory.
*/

mod error;
mod file_store;
mod record_store;

pub use error::{StoreError, StoreResult};
pub use file_store::FileStore;
pub use record_store::{RecordStore, RecordStoreExt};
