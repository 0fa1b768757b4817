//! Server event notifications.
//!
//! A [`ServerListener`] is told when a refresh changes what the server
//! reports. All methods default to no-ops so listeners implement only what
//! they care about. Callbacks run on the refreshing task and must not block.

use std::collections::BTreeSet;

use crate::address::Address;
use crate::description::Description;
use crate::error::Error;

pub trait ServerListener: Send + Sync {
    /// `host` appeared in the member list reported by `server`.
    fn host_added(&self, _server: &Address, _host: &Address) {}

    /// `host` disappeared from the member list reported by `server`.
    fn host_removed(&self, _server: &Address, _host: &Address) {}

    fn description_changed(&self, _server: &Address, _previous: &Description, _current: &Description) {}

    /// A background refresh failed. The previous description stays current.
    fn refresh_failed(&self, _server: &Address, _error: &Error) {}
}

/// Listener that ignores every event.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopListener;

impl ServerListener for NoopListener {}

/// Members gained and lost between two descriptions.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct HostChanges {
    pub added: Vec<Address>,
    pub removed: Vec<Address>,
}

impl HostChanges {
    pub fn between(previous: &Description, current: &Description) -> Self {
        let before: BTreeSet<Address> = previous.servers();
        let after: BTreeSet<Address> = current.servers();
        Self {
            added: after.difference(&before).cloned().collect(),
            removed: before.difference(&after).cloned().collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

/// Tell `listener` how `current` differs from `previous`.
pub(crate) fn notify(listener: &dyn ServerListener, server: &Address, previous: &Description, current: &Description) {
    let changes = HostChanges::between(previous, current);
    for host in &changes.added {
        listener.host_added(server, host);
    }
    for host in &changes.removed {
        listener.host_removed(server, host);
    }
    if previous.document() != current.document() {
        listener.description_changed(server, previous, current);
    }
}
