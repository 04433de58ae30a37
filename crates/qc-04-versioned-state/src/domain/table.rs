use serde::de::DeserializeOwned;
use serde::Serialize;

/// A typed row stored in a named table.
pub trait StateObject: Serialize + DeserializeOwned {
    /// Table name; also the snapshot section suffix.
    const TABLE: &'static str;

    /// Primary key bytes. Singletons use an empty key.
    fn primary_key(&self) -> Vec<u8>;
}
