// src/lib.rs
// Live proxy status and service tracking for frp client managers.
//
// The GUI side runs a `ProxyTracker` per open configuration and one
// `ServiceTracker` for all of them. The worker side answers status queries
// with a `PipeServer`.

pub mod config;
pub mod ipc;
pub mod proxy;
pub mod service;
pub mod shutdown;

pub use config::{ConfigError, WatchConfig};
pub use ipc::{
    ClientState, ClientStatusView, Endpoint, IpcError, PipeClient, PipeServer, ProbeHandle,
    ProxyMessage, ServerHandle, StatusSource, StatusTable, WorkingStatus,
};
pub use proxy::{LogicalProxy, ProxyState, ProxyStatusInfo, ProxyTracker};
pub use service::{
    service_name_of_client, ConfigState, MemoryServiceManager, ServiceControl, ServiceError,
    ServiceHandle, ServiceTracker,
};

#[cfg(windows)]
pub use service::WindowsServiceManager;
