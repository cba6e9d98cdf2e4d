// Worker-side view of live proxy state.

use parking_lot::RwLock;
use std::collections::HashMap;

use crate::proxy::{PROXY_TYPE_TCP, PROXY_TYPE_UDP};

/// Live state of one proxy inside the worker's runtime.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkingStatus {
    pub kind: String,
    pub phase: String,
    pub error: String,
    pub remote_addr: String,
}

/// Lookup into the worker's live proxy table. Must not block on a miss.
#[cfg_attr(test, mockall::automock)]
pub trait StatusSource: Send + Sync {
    fn lookup(&self, name: &str) -> Option<WorkingStatus>;
}

/// Map-backed status source the worker runtime writes into.
#[derive(Debug, Default)]
pub struct StatusTable {
    entries: RwLock<HashMap<String, WorkingStatus>>,
}

impl StatusTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&self, name: impl Into<String>, status: WorkingStatus) {
        self.entries.write().insert(name.into(), status);
    }

    pub fn remove(&self, name: &str) -> Option<WorkingStatus> {
        self.entries.write().remove(name)
    }

    pub fn clear(&self) {
        self.entries.write().clear();
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl StatusSource for StatusTable {
    fn lookup(&self, name: &str) -> Option<WorkingStatus> {
        self.entries.read().get(name).cloned()
    }
}

/// Adapts a raw frp status source to the names and addresses the GUI shows.
///
/// frp registers proxies as `user.name` when a user is configured, and
/// reports remote ports without the server host for tcp/udp proxies.
pub struct ClientStatusView<S> {
    inner: S,
    user: String,
    server_addr: String,
}

impl<S: StatusSource> ClientStatusView<S> {
    pub fn new(inner: S, user: impl Into<String>, server_addr: impl Into<String>) -> Self {
        Self {
            inner,
            user: user.into(),
            server_addr: server_addr.into(),
        }
    }
}

impl<S: StatusSource> StatusSource for ClientStatusView<S> {
    fn lookup(&self, name: &str) -> Option<WorkingStatus> {
        let mut status = if self.user.is_empty() {
            self.inner.lookup(name)?
        } else {
            self.inner.lookup(&format!("{}.{}", self.user, name))?
        };

        if status.error.is_empty() {
            if status.kind == PROXY_TYPE_TCP || status.kind == PROXY_TYPE_UDP {
                status.remote_addr = format!("{}{}", self.server_addr, status.remote_addr);
            }
        } else {
            status.remote_addr.clear();
        }
        Some(status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockall::predicate::eq;

    fn working(kind: &str, phase: &str, error: &str, remote: &str) -> WorkingStatus {
        WorkingStatus {
            kind: kind.to_string(),
            phase: phase.to_string(),
            error: error.to_string(),
            remote_addr: remote.to_string(),
        }
    }

    #[test]
    fn test_status_table_lookup_and_remove() {
        let table = StatusTable::new();
        table.update("web", working("http", "running", "", ""));
        assert_eq!(table.len(), 1);
        assert_eq!(table.lookup("web").unwrap().phase, "running");
        assert!(table.lookup("ssh").is_none());

        table.remove("web");
        assert!(table.is_empty());
    }

    #[test]
    fn test_view_prefixes_user_and_prepends_server_for_tcp() {
        let mut inner = MockStatusSource::new();
        inner
            .expect_lookup()
            .with(eq("alice.ssh"))
            .returning(|_| Some(working("tcp", "running", "", ":6000")));

        let view = ClientStatusView::new(inner, "alice", "frp.example.com");
        let status = view.lookup("ssh").unwrap();

        assert_eq!(status.remote_addr, "frp.example.com:6000");
    }

    #[test]
    fn test_view_leaves_http_remote_addr_alone() {
        let mut inner = MockStatusSource::new();
        inner
            .expect_lookup()
            .with(eq("web"))
            .returning(|_| Some(working("http", "running", "", "web.example.com")));

        let view = ClientStatusView::new(inner, "", "frp.example.com");
        assert_eq!(view.lookup("web").unwrap().remote_addr, "web.example.com");
    }

    #[test]
    fn test_view_clears_remote_addr_on_error() {
        let mut inner = MockStatusSource::new();
        inner
            .expect_lookup()
            .returning(|_| Some(working("udp", "start error", "port unavailable", ":53")));

        let view = ClientStatusView::new(inner, "", "frp.example.com");
        let status = view.lookup("dns").unwrap();

        assert_eq!(status.error, "port unavailable");
        assert!(status.remote_addr.is_empty());
    }

    #[test]
    fn test_view_passes_misses_through() {
        let mut inner = MockStatusSource::new();
        inner.expect_lookup().returning(|_| None);

        let view = ClientStatusView::new(inner, "bob", "frp.example.com");
        assert!(view.lookup("nothing").is_none());
    }
}
