// Pipe server running inside the worker process.

use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};

use super::codec::FrameCodec;
use super::status::StatusSource;
use super::transport::{Endpoint, Listener};
use super::{IpcError, IpcResult, ProxyMessage, StatusRequest, StatusResponse};
use crate::config::WatchConfig;
use crate::shutdown::{self, ShutdownTrigger};

/// Answers status queries from any number of GUI connections.
pub struct PipeServer {
    listener: Listener,
    source: Arc<dyn StatusSource>,
    codec: FrameCodec,
    trigger: Arc<ShutdownTrigger>,
}

/// Clonable handle for closing a server that is busy in `serve`.
#[derive(Clone)]
pub struct ServerHandle {
    trigger: Arc<ShutdownTrigger>,
}

impl ServerHandle {
    pub fn close(&self) {
        self.trigger.trigger();
    }

    pub fn is_closed(&self) -> bool {
        self.trigger.is_triggered()
    }
}

impl PipeServer {
    pub fn listen(
        endpoint: &Endpoint,
        source: Arc<dyn StatusSource>,
        config: &WatchConfig,
    ) -> IpcResult<Self> {
        let listener = Listener::bind(endpoint, config)?;
        let (trigger, _) = shutdown::channel();

        log::info!("Status server listening on {}", endpoint.address().display());
        Ok(Self {
            listener,
            source,
            codec: FrameCodec::new(config.max_frame_bytes),
            trigger: Arc::new(trigger),
        })
    }

    pub fn handle(&self) -> ServerHandle {
        ServerHandle {
            trigger: self.trigger.clone(),
        }
    }

    pub fn endpoint(&self) -> &Endpoint {
        self.listener.endpoint()
    }

    /// Accept loop. Returns when the server is closed or accepting fails.
    pub async fn serve(mut self) {
        let mut shutdown = self.trigger.subscribe();

        loop {
            tokio::select! {
                _ = shutdown.wait() => {
                    log::info!("Status server on {} closed", self.listener.endpoint().address().display());
                    break;
                }
                accepted = self.listener.accept() => match accepted {
                    Ok(conn) => {
                        log::debug!("Accepted status connection");
                        let source = self.source.clone();
                        let codec = self.codec;
                        tokio::spawn(async move {
                            serve_connection(conn, source, codec).await;
                        });
                    }
                    Err(e) => {
                        log::warn!("Status server stopped accepting: {}", e);
                        break;
                    }
                },
            }
        }
    }

    /// Stop accepting. Connections already accepted keep being answered until
    /// their client hangs up.
    pub fn close(&self) {
        self.trigger.trigger();
    }
}

/// Request/response loop for one connection. Any read or write failure ends
/// this connection only.
pub(crate) async fn serve_connection<S>(
    mut stream: S,
    source: Arc<dyn StatusSource>,
    codec: FrameCodec,
) where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        let names: StatusRequest = match codec.read(&mut stream).await {
            Ok(names) => names,
            Err(IpcError::Closed) => {
                log::debug!("Status client disconnected");
                break;
            }
            Err(e) => {
                log::warn!("Dropping status connection: {}", e);
                break;
            }
        };

        let response = build_response(source.as_ref(), &names);
        if let Err(e) = codec.write(&mut stream, &response).await {
            log::debug!("Failed to send status response: {}", e);
            break;
        }
    }
}

/// One record per requested name the source knows about, in request order.
pub(crate) fn build_response(source: &dyn StatusSource, names: &[String]) -> StatusResponse {
    names
        .iter()
        .filter_map(|name| {
            source.lookup(name).map(|status| ProxyMessage {
                name: name.clone(),
                kind: status.kind,
                phase: status.phase,
                error: status.error,
                remote_addr: status.remote_addr,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ipc::status::{StatusTable, WorkingStatus};
    use std::time::Duration;
    use tokio::io::{duplex, AsyncWriteExt};

    fn table() -> Arc<StatusTable> {
        let table = StatusTable::new();
        table.update(
            "web",
            WorkingStatus {
                kind: "http".to_string(),
                phase: "running".to_string(),
                ..Default::default()
            },
        );
        table.update(
            "ssh",
            WorkingStatus {
                kind: "tcp".to_string(),
                phase: "start error".to_string(),
                error: "port already used".to_string(),
                ..Default::default()
            },
        );
        Arc::new(table)
    }

    #[test]
    fn test_build_response_omits_misses_and_keeps_order() {
        let source = table();
        let names = vec![
            "ssh".to_string(),
            "missing".to_string(),
            "web".to_string(),
        ];

        let response = build_response(source.as_ref(), &names);

        let reported: Vec<&str> = response.iter().map(|m| m.name.as_str()).collect();
        assert_eq!(reported, vec!["ssh", "web"]);
        assert_eq!(response[0].error, "port already used");
    }

    #[test]
    fn test_build_response_for_empty_request_is_empty() {
        let source = table();
        assert!(build_response(source.as_ref(), &[]).is_empty());
    }

    #[tokio::test]
    async fn test_connection_answers_each_request_in_turn() {
        let codec = FrameCodec::default();
        let (mut client, server) = duplex(4096);
        let task = tokio::spawn(serve_connection(server, table(), codec));

        codec.write(&mut client, &vec!["web".to_string()]).await.unwrap();
        let first: StatusResponse = codec.read(&mut client).await.unwrap();
        assert_eq!(first.len(), 1);
        assert_eq!(first[0].phase, "running");

        codec
            .write(&mut client, &vec!["nope".to_string()])
            .await
            .unwrap();
        let second: StatusResponse = codec.read(&mut client).await.unwrap();
        assert!(second.is_empty());

        drop(client);
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("handler exits when the client goes away")
            .unwrap();
    }

    #[tokio::test]
    async fn test_malformed_request_ends_only_that_connection() {
        let codec = FrameCodec::default();
        let (mut client, server) = duplex(4096);
        let task = tokio::spawn(serve_connection(server, table(), codec));

        client.write_u32(3).await.unwrap();
        client.write_all(b"{{{").await.unwrap();

        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("handler gives up on garbage")
            .unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_server_serves_concurrent_clients_and_survives_a_bad_one() {
        use crate::ipc::transport::dial;

        let dir = tempfile::tempdir().unwrap();
        let endpoint = Endpoint::at(dir.path().join("server.sock"));
        let config = WatchConfig::default();
        let server = PipeServer::listen(&endpoint, table(), &config).unwrap();
        let handle = server.handle();
        let serving = tokio::spawn(server.serve());

        let (_trigger, shutdown) = shutdown::channel();
        let codec = FrameCodec::default();

        let mut bad = dial(&endpoint, shutdown.clone()).await.unwrap();
        bad.write_u32(2).await.unwrap();
        bad.write_all(b"!!").await.unwrap();

        let mut a = dial(&endpoint, shutdown.clone()).await.unwrap();
        let mut b = dial(&endpoint, shutdown.clone()).await.unwrap();
        codec.write(&mut a, &vec!["web".to_string()]).await.unwrap();
        codec.write(&mut b, &vec!["ssh".to_string()]).await.unwrap();
        let from_a: StatusResponse = codec.read(&mut a).await.unwrap();
        let from_b: StatusResponse = codec.read(&mut b).await.unwrap();

        assert_eq!(from_a[0].name, "web");
        assert_eq!(from_b[0].name, "ssh");

        handle.close();
        tokio::time::timeout(Duration::from_secs(1), serving)
            .await
            .expect("serve returns after close")
            .unwrap();
        assert!(handle.is_closed());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_close_keeps_answering_accepted_connections() {
        use crate::ipc::transport::dial;

        let dir = tempfile::tempdir().unwrap();
        let endpoint = Endpoint::at(dir.path().join("draining.sock"));
        let config = WatchConfig::default();
        let server = PipeServer::listen(&endpoint, table(), &config).unwrap();
        let handle = server.handle();
        let serving = tokio::spawn(server.serve());

        let (_trigger, shutdown) = shutdown::channel();
        let codec = FrameCodec::default();
        let mut conn = dial(&endpoint, shutdown.clone()).await.unwrap();
        codec.write(&mut conn, &vec!["web".to_string()]).await.unwrap();
        let before: StatusResponse = codec.read(&mut conn).await.unwrap();
        assert_eq!(before[0].name, "web");

        handle.close();
        tokio::time::timeout(Duration::from_secs(1), serving)
            .await
            .expect("serve returns after close")
            .unwrap();

        codec.write(&mut conn, &vec!["ssh".to_string()]).await.unwrap();
        let after: StatusResponse = tokio::time::timeout(Duration::from_secs(1), codec.read(&mut conn))
            .await
            .expect("accepted connection is still served")
            .unwrap();
        assert_eq!(after.len(), 1);
        assert_eq!(after[0].name, "ssh");
    }
}
