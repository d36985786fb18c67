mod shim;
mod sqlite;

pub use shim::{StorageEntry, StorageShim};
pub use sqlite::{HostStore, StorageError};
