// Client-side proxy model: user-visible proxies, their wire aliases and the
// coarse state shown in the proxy list.

pub mod cache;
pub mod range;
pub mod tracker;

pub use cache::AliasCache;
pub use range::{parse_range_numbers, RangeError};
pub use tracker::ProxyTracker;

use serde::{Deserialize, Serialize};

use crate::ipc::ProxyMessage;

pub const PROXY_TYPE_TCP: &str = "tcp";
pub const PROXY_TYPE_UDP: &str = "udp";

/// Name prefix marking a proxy that expands into one alias per local port.
pub const RANGE_PREFIX: &str = "range:";

pub const PHASE_RUNNING: &str = "running";
pub const PHASE_START_ERROR: &str = "start error";
pub const PHASE_CHECK_FAILED: &str = "check failed";
pub const PHASE_CLOSED: &str = "closed";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProxyState {
    #[default]
    Unknown,
    Running,
    Error,
}

impl ProxyState {
    /// Merge priority. The most severe state wins.
    pub fn priority(self) -> u8 {
        match self {
            ProxyState::Error => 2,
            ProxyState::Unknown => 1,
            ProxyState::Running => 0,
        }
    }
}

pub fn phase_to_state(phase: &str) -> ProxyState {
    match phase {
        PHASE_RUNNING => ProxyState::Running,
        PHASE_START_ERROR | PHASE_CHECK_FAILED | PHASE_CLOSED => ProxyState::Error,
        _ => ProxyState::Unknown,
    }
}

/// Merged status of one logical proxy.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyStatusInfo {
    pub state: ProxyState,
    pub error: String,
    /// Alias whose record produced this status.
    pub source: String,
    pub remote_addr: String,
}

impl ProxyStatusInfo {
    pub fn from_message(message: &ProxyMessage) -> Self {
        Self {
            state: phase_to_state(&message.phase),
            error: message.error.clone(),
            source: message.name.clone(),
            remote_addr: message.remote_addr.clone(),
        }
    }

    /// Port part of the remote address, for the "remote port" column.
    pub fn remote_port(&self) -> Option<&str> {
        let (_, port) = self.remote_addr.rsplit_once(':')?;
        (!port.is_empty()).then_some(port)
    }
}

/// A proxy entry as configured by the user.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogicalProxy {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub local_port: String,
    #[serde(default)]
    pub disabled: bool,
    #[serde(skip)]
    pub status: ProxyStatusInfo,
}

impl LogicalProxy {
    pub fn new(name: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: kind.into(),
            ..Default::default()
        }
    }

    pub fn with_local_port(mut self, local_port: impl Into<String>) -> Self {
        self.local_port = local_port.into();
        self
    }

    pub fn with_disabled(mut self, disabled: bool) -> Self {
        self.disabled = disabled;
        self
    }

    pub fn is_range(&self) -> bool {
        self.name.starts_with(RANGE_PREFIX)
    }

    /// Wire-level names frp registers for this proxy.
    ///
    /// A `range:` proxy becomes `<prefix>_<i>` for each expanded local port.
    /// If the port spec does not parse, the raw name is the only alias.
    pub fn aliases(&self) -> Vec<String> {
        let Some(prefix) = self.name.strip_prefix(RANGE_PREFIX) else {
            return vec![self.name.clone()];
        };
        let prefix = prefix.trim();

        match parse_range_numbers(&self.local_port) {
            Ok(ports) => (0..ports.len())
                .map(|i| format!("{}_{}", prefix, i))
                .collect(),
            Err(e) => {
                log::debug!("Proxy {} has an unusable port range: {}", self.name, e);
                vec![self.name.clone()]
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_phase_classification() {
        assert_eq!(phase_to_state("running"), ProxyState::Running);
        assert_eq!(phase_to_state("start error"), ProxyState::Error);
        assert_eq!(phase_to_state("check failed"), ProxyState::Error);
        assert_eq!(phase_to_state("closed"), ProxyState::Error);
        assert_eq!(phase_to_state("wait start"), ProxyState::Unknown);
        assert_eq!(phase_to_state(""), ProxyState::Unknown);
    }

    #[test]
    fn test_priority_order() {
        assert!(ProxyState::Error.priority() > ProxyState::Unknown.priority());
        assert!(ProxyState::Unknown.priority() > ProxyState::Running.priority());
    }

    #[test]
    fn test_simple_proxy_has_its_name_as_alias() {
        let proxy = LogicalProxy::new("web", "http");
        assert!(!proxy.is_range());
        assert_eq!(proxy.aliases(), vec!["web"]);
    }

    #[test]
    fn test_range_proxy_expands_per_port() {
        let proxy = LogicalProxy::new("range:game", "tcp").with_local_port("6000-6006,6007");
        let aliases = proxy.aliases();

        assert!(proxy.is_range());
        assert_eq!(aliases.len(), 8);
        assert_eq!(aliases[0], "game_0");
        assert_eq!(aliases[7], "game_7");
    }

    #[test]
    fn test_range_proxy_with_bad_ports_falls_back_to_name() {
        let proxy = LogicalProxy::new("range: game", "tcp").with_local_port("80-");
        assert_eq!(proxy.aliases(), vec!["range: game"]);
    }

    #[test]
    fn test_remote_port_extraction() {
        let mut info = ProxyStatusInfo {
            remote_addr: "frp.example.com:6000".to_string(),
            ..Default::default()
        };
        assert_eq!(info.remote_port(), Some("6000"));

        info.remote_addr = "web.example.com".to_string();
        assert_eq!(info.remote_port(), None);

        info.remote_addr.clear();
        assert_eq!(info.remote_port(), None);
    }

    #[test]
    fn test_status_from_message() {
        let message = ProxyMessage {
            name: "game_3".to_string(),
            kind: "tcp".to_string(),
            phase: "start error".to_string(),
            error: "port already used".to_string(),
            remote_addr: String::new(),
        };
        let info = ProxyStatusInfo::from_message(&message);

        assert_eq!(info.state, ProxyState::Error);
        assert_eq!(info.source, "game_3");
        assert_eq!(info.error, "port already used");
    }
}
