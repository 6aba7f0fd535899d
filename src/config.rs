//! Controller configuration, fixed at startup.

use std::time::Duration;

use crate::selector::Selector;

/// Process-wide configuration. There is no hot reload; changing anything here
/// requires a restart.
#[derive(Clone, Debug)]
pub struct SweeperConfig {
    /// Namespace to watch. `None` watches all namespaces.
    pub namespace: Option<String>,
    /// StatefulSets must match this selector to be managed.
    pub selector: Selector,
    /// Replace claim deletions with a log statement.
    pub dry_run: bool,
    /// Re-add keys whose sync failed, with per-key exponential backoff. The
    /// upstream behavior of waiting for the next watch event is available by
    /// turning this off.
    pub requeue_on_error: bool,
    /// How long to wait for the initial cache sync before startup fails.
    pub cache_sync_timeout: Duration,
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            namespace: None,
            selector: Selector::default(),
            dry_run: false,
            requeue_on_error: true,
            cache_sync_timeout: Duration::from_secs(300),
        }
    }
}
