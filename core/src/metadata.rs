//! Key/value metadata store used for duplicate detection.

use crate::BoxFuture;
use crate::group_store::StoreError;

/// Small key/value store with an atomic put-if-absent.
pub trait MetadataStore: Send + Sync {
    /// Store `value` under `key` unless the key is present.
    ///
    /// Returns the existing value when the key was already present, `None`
    /// when this call stored the value. The check and the insert are atomic.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] if the storage cannot be written.
    fn put_if_absent<'a>(
        &'a self,
        key: &'a str,
        value: &'a str,
    ) -> BoxFuture<'a, Result<Option<String>, StoreError>>;

    /// Overwrite the value for `key`.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] if the storage cannot be written.
    fn put<'a>(&'a self, key: &'a str, value: &'a str) -> BoxFuture<'a, Result<(), StoreError>>;

    /// Read the value for `key`.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] if the storage cannot be read.
    fn get<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Option<String>, StoreError>>;

    /// Remove `key`, returning its value.
    ///
    /// # Errors
    ///
    /// Returns a [`StoreError`] if the storage cannot be written.
    fn remove<'a>(&'a self, key: &'a str) -> BoxFuture<'a, Result<Option<String>, StoreError>>;
}
