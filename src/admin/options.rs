use std::time::Duration;

use crate::persist::{CollectLimits, CLIENT_MAX_INACTIVE};

/// Common options used when opening a data directory for administrative commands.
#[derive(Clone, Debug)]
pub struct AdminOpenOptions {
    /// Whether to create the store if it doesn't exist.
    pub create_if_missing: bool,
}

impl Default for AdminOpenOptions {
    fn default() -> Self {
        Self {
            create_if_missing: false,
        }
    }
}

/// Knobs for [`gc`](super::gc).
#[derive(Clone, Copy, Debug)]
pub struct AdminGcOptions {
    /// Clients whose last heartbeat is older than this are removed.
    pub client_max_inactive: Duration,
    /// Also drop idle stores listed in the database registry.
    pub collect_databases: bool,
    /// Age limits used when `collect_databases` is set.
    pub collect_limits: CollectLimits,
}

impl Default for AdminGcOptions {
    fn default() -> Self {
        Self {
            client_max_inactive: CLIENT_MAX_INACTIVE,
            collect_databases: false,
            collect_limits: CollectLimits::default(),
        }
    }
}
