// src/service/tracker.rs
//
// Watches the services behind a changing set of configuration files and
// reports de-duplicated lifecycle transitions per configuration.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use super::{
    service_name_of_client, ConfigState, RunState, ServiceControl, ServiceHandle, ServiceResult,
    StartType,
};
use crate::shutdown::{self, ShutdownTrigger};

/// Receives `(config path, new state)`. Calls for one path are ordered and
/// never repeat a state. Must not call back into the tracker.
pub type StateCallback = Arc<dyn Fn(&Path, ConfigState) + Send + Sync>;

pub type PathSource = Arc<dyn Fn() -> Vec<PathBuf> + Send + Sync>;

/// Per-watcher stop flag and last reported state.
struct WatchState {
    stopped: AtomicBool,
    wake: Notify,
    last: Mutex<ConfigState>,
}

impl WatchState {
    fn new() -> Self {
        Self {
            stopped: AtomicBool::new(false),
            wake: Notify::new(),
            last: Mutex::new(ConfigState::Unknown),
        }
    }

    /// Returns true for the one caller that actually stopped the watcher.
    fn stop(&self) -> bool {
        let won = self
            .stopped
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok();
        if won {
            self.wake.notify_one();
        }
        won
    }

    fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    async fn wait(&self) {
        loop {
            let notified = self.wake.notified();
            if self.is_stopped() {
                return;
            }
            notified.await;
        }
    }

    fn report(&self, path: &Path, state: ConfigState, callback: &StateCallback) {
        let mut last = self.last.lock();
        if self.is_stopped() || *last == state {
            return;
        }
        *last = state;
        callback(path, state);
    }

    /// Stop the watcher and report `Stopped` unless that was the last state
    /// already reported. Only the first caller gets through.
    fn force_stopped(&self, path: &Path, callback: &StateCallback) -> bool {
        if !self.stop() {
            return false;
        }
        let mut last = self.last.lock();
        if *last != ConfigState::Stopped {
            *last = ConfigState::Stopped;
            callback(path, ConfigState::Stopped);
        }
        true
    }
}

struct Watcher {
    handle: Arc<dyn ServiceHandle>,
    state: Arc<WatchState>,
    task: Option<JoinHandle<()>>,
}

struct Shared {
    scm: Arc<dyn ServiceControl>,
    paths: PathSource,
    callback: StateCallback,
    watchers: Mutex<HashMap<PathBuf, Watcher>>,
    closed: AtomicBool,
}

pub struct ServiceTracker {
    shared: Arc<Shared>,
    database_task: Mutex<Option<JoinHandle<()>>>,
    database_stop: ShutdownTrigger,
}

impl ServiceTracker {
    /// Subscribe to service database changes, track every configuration
    /// whose service exists, and keep re-scanning `paths` on each change.
    /// Must be called inside a tokio runtime.
    pub fn watch<P, C>(scm: Arc<dyn ServiceControl>, paths: P, callback: C) -> ServiceResult<Self>
    where
        P: Fn() -> Vec<PathBuf> + Send + Sync + 'static,
        C: Fn(&Path, ConfigState) + Send + Sync + 'static,
    {
        let mut changes = scm.subscribe_database()?;
        let shared = Arc::new(Shared {
            scm,
            paths: Arc::new(paths),
            callback: Arc::new(callback),
            watchers: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        });

        scan(&shared);

        let (database_stop, mut stopped) = shutdown::channel();
        let loop_shared = shared.clone();
        let database_task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = stopped.wait() => break,
                    change = changes.recv() => match change {
                        Some(()) => {
                            // Service manager calls block.
                            let shared = loop_shared.clone();
                            if let Err(e) = tokio::task::spawn_blocking(move || scan(&shared)).await {
                                log::warn!("Service scan failed: {}", e);
                            }
                        }
                        None => {
                            log::warn!("Service database notifications ended");
                            break;
                        }
                    },
                }
            }
        });

        Ok(Self {
            shared,
            database_task: Mutex::new(Some(database_task)),
            database_stop,
        })
    }

    /// Re-scan the configuration list now.
    pub fn scan(&self) {
        scan(&self.shared);
    }

    pub fn is_tracked(&self, path: &Path) -> bool {
        self.shared.watchers.lock().contains_key(path)
    }

    pub fn tracked_paths(&self) -> Vec<PathBuf> {
        let mut paths: Vec<PathBuf> = self.shared.watchers.lock().keys().cloned().collect();
        paths.sort();
        paths
    }

    /// Stop every watcher and wait for all of them to finish. No callback
    /// fires once this returns.
    pub async fn close(&self) {
        self.shared.closed.store(true, Ordering::Release);
        self.database_stop.trigger();

        let database_task = self.database_task.lock().take();
        if let Some(task) = database_task {
            let _ = task.await;
        }

        let tasks: Vec<JoinHandle<()>> = {
            let mut watchers = self.shared.watchers.lock();
            watchers
                .values_mut()
                .filter_map(|watcher| {
                    watcher.state.stop();
                    watcher.task.take()
                })
                .collect()
        };

        let count = tasks.len();
        for task in tasks {
            if let Err(e) = task.await {
                log::warn!("Service watcher ended abnormally: {}", e);
            }
        }
        log::info!("Service tracker closed ({} watchers)", count);
    }
}

impl Drop for ServiceTracker {
    fn drop(&mut self) {
        self.shared.closed.store(true, Ordering::Release);
        self.database_stop.trigger();
        for watcher in self.shared.watchers.lock().values() {
            watcher.state.stop();
        }
    }
}

fn scan(shared: &Arc<Shared>) {
    if shared.closed.load(Ordering::Acquire) {
        return;
    }

    for path in (shared.paths)() {
        let existing = shared
            .watchers
            .lock()
            .get(&path)
            .map(|watcher| (watcher.handle.clone(), watcher.state.clone()));

        if let Some((handle, state)) = existing {
            let usable = matches!(handle.start_type(), Ok(start) if start != StartType::Disabled);
            if !usable && state.force_stopped(&path, &shared.callback) {
                log::info!("Service for {} is disabled or gone", path.display());
            }
            continue;
        }

        let name = service_name_of_client(&path);
        match shared.scm.open_service(&name) {
            Ok(handle) => spawn_watcher(shared, path, handle),
            Err(e) => log::debug!("No service for {}: {}", path.display(), e),
        }
    }
}

fn spawn_watcher(shared: &Arc<Shared>, path: PathBuf, handle: Arc<dyn ServiceHandle>) {
    let mut watchers = shared.watchers.lock();
    if shared.closed.load(Ordering::Acquire) {
        return;
    }
    if watchers.contains_key(&path) {
        // Lost the race; the freshly opened handle is dropped here.
        return;
    }

    let state = Arc::new(WatchState::new());
    let task = tokio::spawn(run_watcher(
        shared.clone(),
        path.clone(),
        handle.clone(),
        state.clone(),
    ));
    log::debug!("Tracking service {} for {}", handle.name(), path.display());
    watchers.insert(
        path,
        Watcher {
            handle,
            state,
            task: Some(task),
        },
    );
}

async fn run_watcher(
    shared: Arc<Shared>,
    path: PathBuf,
    handle: Arc<dyn ServiceHandle>,
    state: Arc<WatchState>,
) {
    let callback = &shared.callback;

    match handle.subscribe_status() {
        Ok(mut events) => {
            if let Ok(run_state) = handle.query_status() {
                state.report(&path, run_state.to_config_state(), callback);
            }

            loop {
                tokio::select! {
                    _ = state.wait() => break,
                    event = events.recv() => match event {
                        Some(mask) => {
                            let next = mask.to_state().unwrap_or_else(|| {
                                handle
                                    .query_status()
                                    .map(RunState::to_config_state)
                                    .unwrap_or(ConfigState::Unknown)
                            });
                            state.report(&path, next, callback);
                        }
                        None => break,
                    },
                }
            }
        }
        Err(e) => {
            log::warn!("Cannot watch service {}: {}", handle.name(), e);
            state.force_stopped(&path, callback);
            if let Err(e) = handle.stop() {
                log::debug!("Failed to stop service {}: {}", handle.name(), e);
            }
        }
    }

    let mut watchers = shared.watchers.lock();
    let still_ours = watchers
        .get(&path)
        .map(|watcher| Arc::ptr_eq(&watcher.state, &state))
        .unwrap_or(false);
    if still_ours {
        watchers.remove(&path);
    }
}
