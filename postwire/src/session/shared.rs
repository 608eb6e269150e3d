//! State published by the driver for read-only observation.
use std::{
    collections::BTreeMap,
    sync::{
        Mutex,
        atomic::{AtomicBool, AtomicI32, AtomicU32, AtomicU64, AtomicUsize, Ordering},
    },
};

use crate::postgres::BackendKeyData;

/// Cross-task snapshot of the session, updated by the driver.
#[derive(Default)]
pub(crate) struct Shared {
    process_id: AtomicI32,
    secret_key: AtomicI32,
    has_key: AtomicBool,
    pub(crate) queue_len: AtomicUsize,
    /// id of the active query, zero when idle
    pub(crate) active_query: AtomicU64,
    pub(crate) server_version_num: AtomicU32,
    parameters: Mutex<BTreeMap<String, String>>,
}

impl Shared {
    /// `processID` and `secretKey` are write-once.
    pub(crate) fn set_key(&self, key: BackendKeyData) {
        if !self.has_key.swap(true, Ordering::AcqRel) {
            self.process_id.store(key.process_id, Ordering::Release);
            self.secret_key.store(key.secret_key, Ordering::Release);
        }
    }

    pub(crate) fn key(&self) -> Option<(i32, i32)> {
        self.has_key.load(Ordering::Acquire).then(|| {
            (
                self.process_id.load(Ordering::Acquire),
                self.secret_key.load(Ordering::Acquire),
            )
        })
    }

    pub(crate) fn set_parameters(&self, parameters: BTreeMap<String, String>) {
        *self.lock_parameters() = parameters;
    }

    pub(crate) fn set_parameter(&self, name: String, value: String) {
        self.lock_parameters().insert(name, value);
    }

    pub(crate) fn parameter(&self, name: &str) -> Option<String> {
        self.lock_parameters().get(name).cloned()
    }

    pub(crate) fn parameters(&self) -> BTreeMap<String, String> {
        self.lock_parameters().clone()
    }

    fn lock_parameters(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, String>> {
        match self.parameters.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}
