// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Shared helpers for the crate's tests.

use std::collections::HashMap;
use std::sync::{LazyLock, Mutex};

static LIVE: LazyLock<Mutex<HashMap<&'static str, usize>>> = LazyLock::new(|| Mutex::new(HashMap::new()));

/// Counts live instances per label so tests can observe construction and
/// destruction through the erased pool paths.
pub(crate) struct LiveCounted {
    label: &'static str,
}

impl LiveCounted {
    pub(crate) fn new(label: &'static str) -> Self {
        *LIVE.lock().expect("not poisoned").entry(label).or_insert(0) += 1;
        Self { label }
    }

    pub(crate) fn count(label: &'static str) -> usize {
        LIVE.lock().expect("not poisoned").get(label).copied().unwrap_or(0)
    }
}

impl Drop for LiveCounted {
    fn drop(&mut self) {
        let mut live = LIVE.lock().expect("not poisoned");
        let count = live.get_mut(self.label).expect("dropping an instance that was never counted");
        *count -= 1;
    }
}
