// Pipe client running inside the GUI process.
//
// One connection, one in-flight query at a time. Queries fire on a backoff
// timer or on an explicit probe; the connection is never re-dialed.

use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, watch};
use tokio::time::sleep;

use super::backoff::BackoffSchedule;
use super::codec::FrameCodec;
use super::transport::{self, Endpoint};
use super::{IpcError, IpcResult, StatusResponse};
use crate::config::{ConfigError, WatchConfig};
use crate::shutdown::Shutdown;

pub type StatusCallback = Arc<dyn Fn(StatusResponse) + Send + Sync>;
pub type AliasSource = Arc<dyn Fn() -> Vec<String> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Connecting,
    Active,
    Terminated,
}

/// Requests an immediate query. Never blocks: while a probe is already
/// pending, further probes are dropped.
#[derive(Debug, Clone)]
pub struct ProbeHandle {
    tx: mpsc::Sender<()>,
}

impl ProbeHandle {
    /// Returns false when the probe was dropped.
    pub fn probe(&self) -> bool {
        self.tx.try_send(()).is_ok()
    }
}

pub struct PipeClient {
    endpoint: Endpoint,
    payload: AliasSource,
    callback: Option<StatusCallback>,
    schedule: BackoffSchedule,
    codec: FrameCodec,
    probe_tx: mpsc::Sender<()>,
    probe_rx: mpsc::Receiver<()>,
    state: watch::Sender<ClientState>,
}

impl PipeClient {
    /// `payload` is called before every query so requests always carry the
    /// current alias list.
    pub fn new<F>(endpoint: Endpoint, payload: F) -> Self
    where
        F: Fn() -> Vec<String> + Send + Sync + 'static,
    {
        let (probe_tx, probe_rx) = mpsc::channel(1);
        let (state, _) = watch::channel(ClientState::Connecting);

        Self {
            endpoint,
            payload: Arc::new(payload),
            callback: None,
            schedule: BackoffSchedule::default(),
            codec: FrameCodec::default(),
            probe_tx,
            probe_rx,
            state,
        }
    }

    pub fn with_config(mut self, config: &WatchConfig) -> Result<Self, ConfigError> {
        self.schedule = config.backoff_schedule()?;
        self.codec = FrameCodec::new(config.max_frame_bytes);
        Ok(self)
    }

    pub fn with_schedule(mut self, schedule: BackoffSchedule) -> Self {
        self.schedule = schedule;
        self
    }

    pub fn set_callback<F>(&mut self, callback: F)
    where
        F: Fn(StatusResponse) + Send + Sync + 'static,
    {
        self.callback = Some(Arc::new(callback));
    }

    pub fn probe_handle(&self) -> ProbeHandle {
        ProbeHandle {
            tx: self.probe_tx.clone(),
        }
    }

    pub fn state(&self) -> watch::Receiver<ClientState> {
        self.state.subscribe()
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    /// Dial once, then poll until cancelled or the connection breaks.
    /// A failed dial is returned as `TransportUnavailable` and is not retried.
    pub async fn run(self, shutdown: Shutdown) -> IpcResult<()> {
        self.state.send_replace(ClientState::Connecting);

        let conn = match transport::dial(&self.endpoint, shutdown.clone()).await {
            Ok(conn) => conn,
            Err(e) => {
                log::debug!("Status endpoint not reachable: {}", e);
                self.state.send_replace(ClientState::Terminated);
                return Err(e);
            }
        };

        self.drive(conn, shutdown).await;
        Ok(())
    }

    pub(crate) async fn drive<S>(mut self, mut conn: S, mut shutdown: Shutdown)
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        self.state.send_replace(ClientState::Active);
        log::debug!("Status client connected to {}", self.endpoint.address().display());

        if self.query(&mut conn, &mut shutdown).await {
            loop {
                let wait = self.schedule.current();
                tokio::select! {
                    biased;
                    _ = shutdown.wait() => break,
                    Some(()) = self.probe_rx.recv() => {
                        self.schedule.reset();
                        if !self.query(&mut conn, &mut shutdown).await {
                            break;
                        }
                    }
                    _ = sleep(wait) => {
                        let usable = self.query(&mut conn, &mut shutdown).await;
                        self.schedule.advance();
                        if !usable {
                            break;
                        }
                    }
                }
            }
        }

        self.state.send_replace(ClientState::Terminated);
        log::debug!("Status client for {} terminated", self.endpoint.address().display());
    }

    /// Run one request/response exchange. Returns whether the connection is
    /// still usable. Any failure, including a reply that does not decode,
    /// ends the connection; errors are logged, never surfaced.
    async fn query<S>(&self, conn: &mut S, shutdown: &mut Shutdown) -> bool
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let names = (self.payload)();
        let codec = self.codec;
        let exchange = async {
            match codec.write(conn, &names).await {
                Ok(()) => codec.read::<_, StatusResponse>(conn).await,
                Err(e) => Err(e),
            }
        };

        tokio::select! {
            _ = shutdown.wait() => false,
            result = exchange => match result {
                Ok(records) => {
                    if let Some(callback) = &self.callback {
                        callback(records);
                    }
                    true
                }
                Err(IpcError::Protocol(e)) => {
                    log::warn!("Dropping status connection after bad reply: {}", e);
                    false
                }
                Err(e) => {
                    log::debug!("Status connection lost: {}", e);
                    false
                }
            },
        }
    }
}
