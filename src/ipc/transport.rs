// Local duplex endpoints: a named pipe on Windows, a Unix domain socket
// elsewhere. Both ends derive the address from the configuration identity.

use std::path::{Path, PathBuf};
use tokio::io::{AsyncRead, AsyncWrite};

use super::{IpcError, IpcResult};
use crate::config::WatchConfig;
use crate::service::service_name_of_client;
use crate::shutdown::Shutdown;

#[cfg(unix)]
use std::fs;
#[cfg(unix)]
use std::os::unix::fs::PermissionsExt;
#[cfg(unix)]
use tokio::net::{UnixListener, UnixStream};

#[cfg(windows)]
use std::time::Duration;
#[cfg(windows)]
use tokio::net::windows::named_pipe::{ClientOptions, NamedPipeServer, ServerOptions};

#[cfg(windows)]
const ERROR_PIPE_BUSY: i32 = 231;
#[cfg(windows)]
const PIPE_BUSY_RETRY: Duration = Duration::from_millis(50);

pub trait Duplex: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> Duplex for T {}

/// An established connection, independent of the platform transport.
pub type Connection = Box<dyn Duplex>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    name: String,
    address: PathBuf,
}

impl Endpoint {
    /// Endpoint for a bare name, placed where this platform keeps local endpoints.
    pub fn named(name: &str, config: &WatchConfig) -> Self {
        #[cfg(windows)]
        let address = {
            let _ = config;
            PathBuf::from(format!(r"\\.\pipe\{}", name))
        };

        #[cfg(not(windows))]
        let address = config.resolved_runtime_dir().join(format!("{}.sock", name));

        Self {
            name: name.to_string(),
            address,
        }
    }

    /// Endpoint both the GUI and the worker use for one configuration file.
    pub fn for_config(config_path: &Path, config: &WatchConfig) -> Self {
        Self::named(&service_name_of_client(config_path), config)
    }

    /// Endpoint at an explicit address.
    pub fn at(address: impl Into<PathBuf>) -> Self {
        let address = address.into();
        let name = address
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_default();
        Self { name, address }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn address(&self) -> &Path {
        &self.address
    }

    fn label(&self) -> String {
        self.address.display().to_string()
    }
}

pub struct Listener {
    endpoint: Endpoint,
    #[cfg(unix)]
    inner: UnixListener,
    #[cfg(windows)]
    next: NamedPipeServer,
    #[cfg(windows)]
    buffer_size: u32,
}

impl Listener {
    #[cfg(unix)]
    pub fn bind(endpoint: &Endpoint, _config: &WatchConfig) -> IpcResult<Self> {
        let path = endpoint.address();
        let bind_error = |source| IpcError::Bind {
            endpoint: endpoint.label(),
            source,
        };

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(bind_error)?;
        }

        if path.exists() {
            // A live listener answers; a leftover socket file does not.
            if std::os::unix::net::UnixStream::connect(path).is_ok() {
                return Err(bind_error(std::io::Error::new(
                    std::io::ErrorKind::AddrInUse,
                    "endpoint is already served by another process",
                )));
            }
            let _ = fs::remove_file(path);
        }

        let inner = UnixListener::bind(path).map_err(bind_error)?;
        let _ = fs::set_permissions(path, fs::Permissions::from_mode(0o600));

        log::debug!("Listening on {}", endpoint.label());
        Ok(Self {
            endpoint: endpoint.clone(),
            inner,
        })
    }

    #[cfg(windows)]
    pub fn bind(endpoint: &Endpoint, config: &WatchConfig) -> IpcResult<Self> {
        let next = pipe_options(config.pipe_buffer_size)
            .first_pipe_instance(true)
            .create(endpoint.address())
            .map_err(|source| IpcError::Bind {
                endpoint: endpoint.label(),
                source,
            })?;

        log::debug!("Listening on {}", endpoint.label());
        Ok(Self {
            endpoint: endpoint.clone(),
            next,
            buffer_size: config.pipe_buffer_size,
        })
    }

    #[cfg(unix)]
    pub async fn accept(&mut self) -> IpcResult<Connection> {
        let (stream, _) = self.inner.accept().await?;
        Ok(Box::new(stream))
    }

    #[cfg(windows)]
    pub async fn accept(&mut self) -> IpcResult<Connection> {
        self.next.connect().await?;
        // Create the next instance before handing this one out so clients
        // never observe a missing pipe.
        let fresh = pipe_options(self.buffer_size).create(self.endpoint.address())?;
        let connected = std::mem::replace(&mut self.next, fresh);
        Ok(Box::new(connected))
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }
}

#[cfg(unix)]
impl Drop for Listener {
    fn drop(&mut self) {
        let _ = fs::remove_file(self.endpoint.address());
    }
}

#[cfg(windows)]
fn pipe_options(buffer_size: u32) -> ServerOptions {
    let mut options = ServerOptions::new();
    options
        .in_buffer_size(buffer_size)
        .out_buffer_size(buffer_size);
    options
}

/// Connect once. Failure means the worker is not running.
#[cfg(unix)]
pub async fn dial(endpoint: &Endpoint, mut shutdown: Shutdown) -> IpcResult<Connection> {
    tokio::select! {
        result = UnixStream::connect(endpoint.address()) => match result {
            Ok(stream) => Ok(Box::new(stream) as Connection),
            Err(source) => Err(IpcError::TransportUnavailable {
                endpoint: endpoint.label(),
                source,
            }),
        },
        _ = shutdown.wait() => Err(cancelled(endpoint)),
    }
}

/// Connect once. A busy pipe is retried until it frees up or the dial is
/// cancelled; any other failure means the worker is not running.
#[cfg(windows)]
pub async fn dial(endpoint: &Endpoint, mut shutdown: Shutdown) -> IpcResult<Connection> {
    loop {
        match ClientOptions::new().open(endpoint.address()) {
            Ok(client) => return Ok(Box::new(client)),
            Err(e) if e.raw_os_error() == Some(ERROR_PIPE_BUSY) => {}
            Err(source) => {
                return Err(IpcError::TransportUnavailable {
                    endpoint: endpoint.label(),
                    source,
                })
            }
        }

        tokio::select! {
            _ = tokio::time::sleep(PIPE_BUSY_RETRY) => {}
            _ = shutdown.wait() => return Err(cancelled(endpoint)),
        }
    }
}

fn cancelled(endpoint: &Endpoint) -> IpcError {
    IpcError::TransportUnavailable {
        endpoint: endpoint.label(),
        source: std::io::Error::new(std::io::ErrorKind::Interrupted, "dial cancelled"),
    }
}
