// src/proxy/tracker.rs
//
// Keeps the proxy list of one configuration in sync with its worker process:
// owns the alias cache, feeds its alias names to a pipe client and folds the
// replies back into row statuses.

use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::cache::AliasCache;
use super::{LogicalProxy, ProxyStatusInfo};
use crate::config::{ConfigError, WatchConfig};
use crate::ipc::{ClientState, Endpoint, PipeClient, ProbeHandle};
use crate::shutdown::{self, Shutdown, ShutdownTrigger};

/// Receives the indices of rows whose status changed.
pub type RowsChanged = Arc<dyn Fn(Vec<usize>) + Send + Sync>;

pub struct ProxyTracker {
    cache: Arc<Mutex<AliasCache>>,
    probe: ProbeHandle,
    client_state: watch::Receiver<ClientState>,
    on_rows_changed: RowsChanged,
    refresh_task: Arc<Mutex<Option<JoinHandle<()>>>>,
    trigger: ShutdownTrigger,
}

impl ProxyTracker {
    /// Build the cache and start polling `endpoint`. Must be called inside a
    /// tokio runtime.
    pub fn start<F>(
        endpoint: Endpoint,
        proxies: Vec<LogicalProxy>,
        config: &WatchConfig,
        on_rows_changed: F,
    ) -> Result<Self, ConfigError>
    where
        F: Fn(Vec<usize>) + Send + Sync + 'static,
    {
        let on_rows_changed: RowsChanged = Arc::new(on_rows_changed);
        let cache = Arc::new(Mutex::new(AliasCache::build(proxies)));
        let refresh_task: Arc<Mutex<Option<JoinHandle<()>>>> = Arc::new(Mutex::new(None));
        let (trigger, shutdown) = shutdown::channel();

        let names_cache = cache.clone();
        let mut client = PipeClient::new(endpoint, move || names_cache.lock().alias_names())
            .with_config(config)?;

        {
            let cache = cache.clone();
            let refresh_task = refresh_task.clone();
            let on_rows_changed = on_rows_changed.clone();
            let shutdown = shutdown.clone();
            client.set_callback(move |records| {
                if shutdown.is_triggered() {
                    return;
                }
                let changed = cache.lock().merge(&records);
                if changed.is_empty() {
                    return;
                }
                if let Some(task) = refresh_task.lock().take() {
                    task.abort();
                }
                on_rows_changed(changed);
            });
        }

        let probe = client.probe_handle();
        let client_state = client.state();

        log::info!(
            "Tracking proxy status via {}",
            client.endpoint().address().display()
        );
        // The refresh task must be in place before the first reply can cancel it.
        if config.initial_refresh_ms > 0 {
            let task = tokio::spawn(initial_refresh(
                cache.clone(),
                on_rows_changed.clone(),
                config.initial_refresh(),
                shutdown.clone(),
            ));
            *refresh_task.lock() = Some(task);
        }

        tokio::spawn(async move {
            if let Err(e) = client.run(shutdown).await {
                log::debug!("Proxy status unavailable: {}", e);
            }
        });

        Ok(Self {
            cache,
            probe,
            client_state,
            on_rows_changed,
            refresh_task,
            trigger,
        })
    }

    pub fn insert(&self, index: usize, proxy: LogicalProxy) -> usize {
        let index = self.cache.lock().insert(index, proxy);
        self.probe();
        index
    }

    pub fn remove(&self, index: usize) -> Option<LogicalProxy> {
        let removed = self.cache.lock().remove(index);
        if removed.is_some() {
            self.probe();
        }
        removed
    }

    pub fn rename(&self, index: usize, name: impl Into<String>) -> bool {
        let renamed = self.cache.lock().rename(index, name);
        if renamed {
            self.probe();
        }
        renamed
    }

    /// Apply an edited proxy. Edits always re-probe, since settings other
    /// than the alias set also change what the worker reports.
    pub fn update(&self, index: usize, proxy: LogicalProxy) {
        self.cache.lock().update(index, proxy);
        self.probe();
    }

    pub fn set_disabled(&self, index: usize, disabled: bool) -> bool {
        let changed = self.cache.lock().set_disabled(index, disabled);
        if changed {
            if disabled {
                (self.on_rows_changed)(vec![index]);
            }
            self.probe();
        }
        changed
    }

    /// Replace the whole proxy list, e.g. after the configuration was reloaded.
    pub fn reset(&self, proxies: Vec<LogicalProxy>) {
        self.cache.lock().reset(proxies);
        self.probe();
    }

    pub fn snapshot(&self) -> Vec<LogicalProxy> {
        self.cache.lock().proxies().cloned().collect()
    }

    pub fn status(&self, index: usize) -> Option<ProxyStatusInfo> {
        self.cache.lock().get(index).map(|proxy| proxy.status.clone())
    }

    pub fn alias_names(&self) -> Vec<String> {
        self.cache.lock().alias_names()
    }

    /// Ask for an immediate refresh. Returns false if one is already pending.
    pub fn probe(&self) -> bool {
        self.probe.probe()
    }

    pub fn client_state(&self) -> ClientState {
        *self.client_state.borrow()
    }

    /// Stop polling. No callback fires after this returns, except one
    /// already running on the client task.
    pub fn close(&self) {
        if self.trigger.is_triggered() {
            return;
        }
        self.trigger.trigger();
        if let Some(task) = self.refresh_task.lock().take() {
            task.abort();
        }
        log::debug!("Proxy tracker closed");
    }
}

impl Drop for ProxyTracker {
    fn drop(&mut self) {
        self.close();
    }
}

/// Refresh every row once if no status change arrived in time, so the UI
/// can draw its initial state icons.
async fn initial_refresh(
    cache: Arc<Mutex<AliasCache>>,
    on_rows_changed: RowsChanged,
    delay: std::time::Duration,
    mut shutdown: Shutdown,
) {
    tokio::select! {
        _ = shutdown.wait() => {}
        _ = tokio::time::sleep(delay) => {
            let rows = cache.lock().len();
            if rows > 0 && !shutdown.is_triggered() {
                on_rows_changed((0..rows).collect());
            }
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::ipc::{PipeServer, ServerHandle, StatusTable, WorkingStatus};
    use crate::proxy::ProxyState;
    use std::time::Duration;
    use tokio::sync::mpsc;

    struct Fixture {
        _dir: tempfile::TempDir,
        config: WatchConfig,
        endpoint: Endpoint,
        table: Arc<StatusTable>,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            let config = WatchConfig {
                runtime_dir: Some(dir.path().to_path_buf()),
                backoff_ms: vec![60_000],
                initial_refresh_ms: 60_000,
                ..Default::default()
            };
            let endpoint = Endpoint::named("tracker", &config);
            Self {
                _dir: dir,
                config,
                endpoint,
                table: Arc::new(StatusTable::new()),
            }
        }

        fn serve(&self) -> ServerHandle {
            let server = PipeServer::listen(&self.endpoint, self.table.clone(), &self.config).unwrap();
            let handle = server.handle();
            tokio::spawn(server.serve());
            handle
        }

        fn set(&self, name: &str, phase: &str, error: &str) {
            self.table.update(
                name,
                WorkingStatus {
                    kind: "tcp".to_string(),
                    phase: phase.to_string(),
                    error: error.to_string(),
                    remote_addr: String::new(),
                },
            );
        }

        fn start(
            &self,
            proxies: Vec<LogicalProxy>,
        ) -> (ProxyTracker, mpsc::UnboundedReceiver<Vec<usize>>) {
            let (tx, rx) = mpsc::unbounded_channel();
            let tracker = ProxyTracker::start(self.endpoint.clone(), proxies, &self.config, move |rows| {
                let _ = tx.send(rows);
            })
            .unwrap();
            (tracker, rx)
        }
    }

    fn proxies() -> Vec<LogicalProxy> {
        vec![
            LogicalProxy::new("web", "http"),
            LogicalProxy::new("range:range_tcp", "tcp").with_local_port("6000-6001"),
        ]
    }

    async fn next_rows(rx: &mut mpsc::UnboundedReceiver<Vec<usize>>) -> Vec<usize> {
        tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("rows changed in time")
            .expect("callback still alive")
    }

    #[tokio::test]
    async fn test_first_reply_updates_merged_rows() {
        let fixture = Fixture::new();
        fixture.set("web", "running", "");
        fixture.set("range_tcp_0", "running", "");
        fixture.set("range_tcp_1", "start error", "dial refused");
        let server = fixture.serve();

        let (tracker, mut rows) = fixture.start(proxies());

        assert_eq!(next_rows(&mut rows).await, vec![0, 1]);
        assert_eq!(tracker.status(0).unwrap().state, ProxyState::Running);
        let range = tracker.status(1).unwrap();
        assert_eq!(range.state, ProxyState::Error);
        assert_eq!(range.error, "dial refused");

        tracker.close();
        server.close();
    }

    #[tokio::test]
    async fn test_structural_change_probes_immediately() {
        let fixture = Fixture::new();
        fixture.set("web", "running", "");
        fixture.set("ssh", "running", "");
        let server = fixture.serve();

        let (tracker, mut rows) = fixture.start(vec![LogicalProxy::new("web", "http")]);
        assert_eq!(next_rows(&mut rows).await, vec![0]);

        // The schedule is parked at a one minute interval, so only a probe
        // can deliver this in time.
        tracker.insert(1, LogicalProxy::new("ssh", "tcp"));
        assert_eq!(next_rows(&mut rows).await, vec![1]);
        assert_eq!(tracker.alias_names(), vec!["ssh", "web"]);

        tracker.close();
        server.close();
    }

    #[tokio::test]
    async fn test_disable_reports_row_and_drops_aliases() {
        let fixture = Fixture::new();
        fixture.set("web", "running", "");
        fixture.set("range_tcp_0", "running", "");
        let server = fixture.serve();

        let (tracker, mut rows) = fixture.start(proxies());
        assert_eq!(next_rows(&mut rows).await, vec![0, 1]);

        assert!(tracker.set_disabled(1, true));
        assert_eq!(next_rows(&mut rows).await, vec![1]);
        assert_eq!(tracker.status(1), Some(ProxyStatusInfo::default()));
        assert_eq!(tracker.alias_names(), vec!["web"]);
        assert!(!tracker.set_disabled(1, true));

        tracker.close();
        server.close();
    }

    #[tokio::test]
    async fn test_initial_refresh_without_worker() {
        let mut fixture = Fixture::new();
        fixture.config.initial_refresh_ms = 50;

        let (tracker, mut rows) = fixture.start(proxies());

        assert_eq!(next_rows(&mut rows).await, vec![0, 1]);
        assert_eq!(tracker.client_state(), ClientState::Terminated);
        assert!(tracker.snapshot().iter().all(|p| p.status.state == ProxyState::Unknown));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_first_reply_cancels_initial_refresh() {
        let mut fixture = Fixture::new();
        fixture.config.initial_refresh_ms = 300;
        fixture.set("web", "running", "");
        let server = fixture.serve();

        let (tracker, mut rows) =
            fixture.start(vec![LogicalProxy::new("web", "http"), LogicalProxy::new("ssh", "tcp")]);

        assert_eq!(next_rows(&mut rows).await, vec![0]);
        tokio::time::sleep(Duration::from_millis(600)).await;
        assert!(rows.try_recv().is_err(), "no full refresh after a real change");

        tracker.close();
        server.close();
    }

    #[tokio::test]
    async fn test_close_stops_the_client() {
        let fixture = Fixture::new();
        fixture.set("web", "running", "");
        let server = fixture.serve();

        let (tracker, mut rows) = fixture.start(vec![LogicalProxy::new("web", "http")]);
        next_rows(&mut rows).await;

        tracker.close();
        tokio::time::timeout(Duration::from_secs(2), async {
            while tracker.client_state() != ClientState::Terminated {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("client terminates after close");

        server.close();
    }
}
