// Status query protocol between the GUI (client role) and a worker process
// (server role) that owns live proxy state.

pub mod backoff;
pub mod client;
pub mod codec;
pub mod server;
pub mod status;
pub mod transport;

pub use backoff::BackoffSchedule;
pub use client::{ClientState, PipeClient, ProbeHandle};
pub use server::{PipeServer, ServerHandle};
pub use status::{ClientStatusView, StatusSource, StatusTable, WorkingStatus};
pub use transport::Endpoint;

use serde::{Deserialize, Serialize};

/// Status of one wire-level proxy alias, as reported by the worker.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProxyMessage {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub phase: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub remote_addr: String,
}

/// A request is the list of alias names to report on.
pub type StatusRequest = Vec<String>;

/// A response carries one record per alias with live information.
pub type StatusResponse = Vec<ProxyMessage>;

#[derive(Debug, thiserror::Error)]
pub enum IpcError {
    #[error("Failed to bind endpoint {endpoint}: {source}")]
    Bind {
        endpoint: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Endpoint {endpoint} is unavailable: {source}")]
    TransportUnavailable {
        endpoint: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Connection closed by peer")]
    Closed,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type IpcResult<T> = Result<T, IpcError>;
