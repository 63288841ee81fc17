//! The persistence seam of the record services.

use futures::future::BoxFuture;

/// An external key-value store.
///
/// All operations are asynchronous and may fail. `get` resolves to `None` when there is no
/// record for the key.
pub trait Storage<K, V>: Send + Sync + 'static {
    /// Reads the record of `key`.
    fn get<'a>(&'a self, key: &'a K) -> BoxFuture<'a, anyhow::Result<Option<V>>>;

    /// Writes `value` as the record of `key`.
    fn put(&self, key: K, value: V) -> BoxFuture<'_, anyhow::Result<()>>;

    /// Deletes the record of `key`, if there is one.
    fn delete<'a>(&'a self, key: &'a K) -> BoxFuture<'a, anyhow::Result<()>>;
}
