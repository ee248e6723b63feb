//! Null storage: every operation is a no-op.
//!
//! Used for fully stateless deployments where the caller carries state bundles
//! out-of-band. Reads always miss, so any flow relying on a saved bundle will
//! fail with "unable to determine state".

use crate::{StorageFuture, TokenStorage};

#[derive(Debug, Default, Clone)]
pub struct NullStorage;

impl NullStorage {
    pub fn new() -> Self {
        Self
    }
}

impl TokenStorage for NullStorage {
    fn id(&self) -> &str {
        "null"
    }

    fn put<'a>(&'a self, _key: &'a str, _value: &'a str) -> StorageFuture<'a, ()> {
        Box::pin(async { Ok(()) })
    }

    fn get<'a>(&'a self, _key: &'a str) -> StorageFuture<'a, Option<String>> {
        Box::pin(async { Ok(None) })
    }

    fn forget<'a>(&'a self, _key: &'a str) -> StorageFuture<'a, ()> {
        Box::pin(async { Ok(()) })
    }

    fn commit(&self) -> StorageFuture<'_, ()> {
        Box::pin(async { Ok(()) })
    }
}
