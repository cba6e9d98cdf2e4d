// OS service side of a configuration: lifecycle states, a thin service
// control manager abstraction and the tracker that watches it.

pub mod memory;
pub mod tracker;
#[cfg(windows)]
pub mod windows;

pub use memory::MemoryServiceManager;
pub use tracker::ServiceTracker;
#[cfg(windows)]
pub use windows::WindowsServiceManager;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc::UnboundedReceiver;

pub const SERVICE_NAME_PREFIX: &str = "frpwatch_";

/// Lifecycle of the service wrapping one configuration, as shown in the GUI.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConfigState {
    #[default]
    Unknown,
    Starting,
    Started,
    Stopping,
    Stopped,
}

/// Run state reported by a direct status query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Stopped,
    StartPending,
    StopPending,
    Running,
    ContinuePending,
    PausePending,
    Paused,
}

impl RunState {
    pub fn to_config_state(self) -> ConfigState {
        match self {
            RunState::Stopped => ConfigState::Stopped,
            RunState::StartPending => ConfigState::Starting,
            RunState::StopPending => ConfigState::Stopping,
            RunState::Running => ConfigState::Started,
            _ => ConfigState::Unknown,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartType {
    Auto,
    Demand,
    Disabled,
}

/// Bit mask carried by a per-service status notification. Values match the
/// Windows `SERVICE_NOTIFY_*` flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NotifyMask(pub u32);

impl NotifyMask {
    pub const STOPPED: u32 = 0x0000_0001;
    pub const START_PENDING: u32 = 0x0000_0002;
    pub const STOP_PENDING: u32 = 0x0000_0004;
    pub const RUNNING: u32 = 0x0000_0008;
    pub const CONTINUE_PENDING: u32 = 0x0000_0010;
    pub const PAUSE_PENDING: u32 = 0x0000_0020;
    pub const PAUSED: u32 = 0x0000_0040;
    pub const CREATED: u32 = 0x0000_0080;
    pub const DELETED: u32 = 0x0000_0100;
    pub const DELETE_PENDING: u32 = 0x0000_0200;

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn contains(self, bits: u32) -> bool {
        self.0 & bits != 0
    }

    /// State implied by the mask, or `None` when the mask is empty and the
    /// service has to be queried directly.
    pub fn to_state(self) -> Option<ConfigState> {
        if self.is_empty() {
            return None;
        }
        let state = if self.contains(Self::STOPPED | Self::DELETED | Self::DELETE_PENDING) {
            ConfigState::Stopped
        } else if self.contains(Self::STOP_PENDING) {
            ConfigState::Stopping
        } else if self.contains(Self::RUNNING) {
            ConfigState::Started
        } else if self.contains(Self::START_PENDING) {
            ConfigState::Starting
        } else {
            ConfigState::Unknown
        };
        Some(state)
    }
}

impl From<RunState> for NotifyMask {
    fn from(state: RunState) -> Self {
        NotifyMask(match state {
            RunState::Stopped => Self::STOPPED,
            RunState::StartPending => Self::START_PENDING,
            RunState::StopPending => Self::STOP_PENDING,
            RunState::Running => Self::RUNNING,
            RunState::ContinuePending => Self::CONTINUE_PENDING,
            RunState::PausePending => Self::PAUSE_PENDING,
            RunState::Paused => Self::PAUSED,
        })
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ServiceError {
    #[error("Service not found: {0}")]
    NotFound(String),

    #[error("Change notifications denied for {0}")]
    SubscriptionDenied(String),

    #[error("Access denied: {0}")]
    AccessDenied(String),

    #[error("Service manager error: {0}")]
    Os(String),
}

pub type ServiceResult<T> = Result<T, ServiceError>;

/// Connection to the service control manager.
pub trait ServiceControl: Send + Sync {
    fn open_service(&self, name: &str) -> ServiceResult<Arc<dyn ServiceHandle>>;

    /// Fires whenever services are created, deleted or reconfigured.
    /// Dropping the receiver ends the subscription.
    fn subscribe_database(&self) -> ServiceResult<UnboundedReceiver<()>>;
}

/// An opened service.
pub trait ServiceHandle: Send + Sync {
    fn name(&self) -> &str;

    fn query_status(&self) -> ServiceResult<RunState>;

    fn start_type(&self) -> ServiceResult<StartType>;

    /// Status change notifications. Dropping the receiver unsubscribes.
    fn subscribe_status(&self) -> ServiceResult<UnboundedReceiver<NotifyMask>>;

    fn stop(&self) -> ServiceResult<()>;
}

/// Name of the service (and status endpoint) for a configuration file.
/// Only the file stem counts, so moving the file keeps the name.
pub fn service_name_of_client(config_path: &Path) -> String {
    let stem = config_path
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_default();

    let digest = Sha256::digest(stem.as_bytes());
    let hex: String = digest.iter().map(|b| format!("{:02x}", b)).collect();
    format!("{}{}", SERVICE_NAME_PREFIX, &hex[..32])
}
