// In-process service control manager. Backs the tracker in tests and on
// hosts without an OS service manager.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

use super::{
    NotifyMask, RunState, ServiceControl, ServiceError, ServiceHandle, ServiceResult, StartType,
};

#[derive(Clone, Default)]
pub struct MemoryServiceManager {
    inner: Arc<Mutex<Registry>>,
}

#[derive(Default)]
struct Registry {
    services: HashMap<String, Arc<MemoryService>>,
    database_subscribers: Vec<UnboundedSender<()>>,
}

struct MemoryService {
    name: String,
    record: Mutex<ServiceRecord>,
}

struct ServiceRecord {
    run_state: RunState,
    start_type: StartType,
    deleted: bool,
    deny_subscriptions: bool,
    stop_requests: usize,
    subscribers: Vec<UnboundedSender<NotifyMask>>,
}

impl ServiceRecord {
    fn emit(&mut self, mask: NotifyMask) {
        self.subscribers.retain(|tx| tx.send(mask).is_ok());
    }
}

impl MemoryServiceManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a stopped service and announce the database change.
    pub fn install(&self, name: &str, start_type: StartType) {
        let service = Arc::new(MemoryService {
            name: name.to_string(),
            record: Mutex::new(ServiceRecord {
                run_state: RunState::Stopped,
                start_type,
                deleted: false,
                deny_subscriptions: false,
                stop_requests: 0,
                subscribers: Vec::new(),
            }),
        });
        self.inner.lock().services.insert(name.to_string(), service);
        self.notify_database();
    }

    /// Change the run state and notify status subscribers.
    pub fn set_state(&self, name: &str, state: RunState) {
        if let Some(service) = self.service(name) {
            let mut record = service.record.lock();
            record.run_state = state;
            record.emit(NotifyMask::from(state));
        }
    }

    /// Change the run state without notifying anyone.
    pub fn set_state_quietly(&self, name: &str, state: RunState) {
        if let Some(service) = self.service(name) {
            service.record.lock().run_state = state;
        }
    }

    /// Send a raw notification mask to status subscribers.
    pub fn emit(&self, name: &str, mask: NotifyMask) {
        if let Some(service) = self.service(name) {
            service.record.lock().emit(mask);
        }
    }

    /// Change the start type. Does not announce a database change; call
    /// `notify_database` for that.
    pub fn set_start_type(&self, name: &str, start_type: StartType) {
        if let Some(service) = self.service(name) {
            service.record.lock().start_type = start_type;
        }
    }

    /// Remove the service. Open handles see it as deleted.
    pub fn delete(&self, name: &str) {
        let removed = self.inner.lock().services.remove(name);
        if let Some(service) = removed {
            let mut record = service.record.lock();
            record.deleted = true;
            record.emit(NotifyMask(NotifyMask::DELETED));
        }
        self.notify_database();
    }

    pub fn deny_subscriptions(&self, name: &str) {
        if let Some(service) = self.service(name) {
            service.record.lock().deny_subscriptions = true;
        }
    }

    pub fn notify_database(&self) {
        self.inner
            .lock()
            .database_subscribers
            .retain(|tx| tx.send(()).is_ok());
    }

    pub fn stop_requests(&self, name: &str) -> usize {
        self.service(name)
            .map(|service| service.record.lock().stop_requests)
            .unwrap_or(0)
    }

    /// Live status subscriptions for a service.
    pub fn status_subscribers(&self, name: &str) -> usize {
        self.service(name)
            .map(|service| {
                let mut record = service.record.lock();
                record.subscribers.retain(|tx| !tx.is_closed());
                record.subscribers.len()
            })
            .unwrap_or(0)
    }

    pub fn database_subscribers(&self) -> usize {
        let mut registry = self.inner.lock();
        registry.database_subscribers.retain(|tx| !tx.is_closed());
        registry.database_subscribers.len()
    }

    fn service(&self, name: &str) -> Option<Arc<MemoryService>> {
        self.inner.lock().services.get(name).cloned()
    }
}

impl ServiceControl for MemoryServiceManager {
    fn open_service(&self, name: &str) -> ServiceResult<Arc<dyn ServiceHandle>> {
        match self.service(name) {
            Some(service) => Ok(service as Arc<dyn ServiceHandle>),
            None => Err(ServiceError::NotFound(name.to_string())),
        }
    }

    fn subscribe_database(&self) -> ServiceResult<UnboundedReceiver<()>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.lock().database_subscribers.push(tx);
        Ok(rx)
    }
}

impl MemoryService {
    fn live(&self) -> ServiceResult<parking_lot::MutexGuard<'_, ServiceRecord>> {
        let record = self.record.lock();
        if record.deleted {
            return Err(ServiceError::NotFound(self.name.clone()));
        }
        Ok(record)
    }
}

impl ServiceHandle for MemoryService {
    fn name(&self) -> &str {
        &self.name
    }

    fn query_status(&self) -> ServiceResult<RunState> {
        Ok(self.live()?.run_state)
    }

    fn start_type(&self) -> ServiceResult<StartType> {
        Ok(self.live()?.start_type)
    }

    fn subscribe_status(&self) -> ServiceResult<UnboundedReceiver<NotifyMask>> {
        let mut record = self.live()?;
        if record.deny_subscriptions {
            return Err(ServiceError::SubscriptionDenied(self.name.clone()));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        record.subscribers.push(tx);
        Ok(rx)
    }

    fn stop(&self) -> ServiceResult<()> {
        let mut record = self.live()?;
        record.stop_requests += 1;
        if record.run_state != RunState::Stopped {
            record.run_state = RunState::Stopped;
            record.emit(NotifyMask(NotifyMask::STOPPED));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_unknown_service_is_not_found() {
        let scm = MemoryServiceManager::new();
        assert!(matches!(
            scm.open_service("missing"),
            Err(ServiceError::NotFound(_))
        ));
    }

    #[test]
    fn test_state_changes_reach_subscribers() {
        let scm = MemoryServiceManager::new();
        scm.install("svc", StartType::Auto);
        let handle = scm.open_service("svc").unwrap();
        let mut events = handle.subscribe_status().unwrap();

        scm.set_state("svc", RunState::Running);
        scm.set_state_quietly("svc", RunState::StopPending);

        assert_eq!(events.try_recv().unwrap(), NotifyMask(NotifyMask::RUNNING));
        assert!(events.try_recv().is_err());
        assert_eq!(handle.query_status().unwrap(), RunState::StopPending);
    }

    #[test]
    fn test_deleted_service_rejects_queries() {
        let scm = MemoryServiceManager::new();
        scm.install("svc", StartType::Demand);
        let handle = scm.open_service("svc").unwrap();
        let mut events = handle.subscribe_status().unwrap();

        scm.delete("svc");

        assert_eq!(events.try_recv().unwrap(), NotifyMask(NotifyMask::DELETED));
        assert!(handle.start_type().is_err());
        assert!(handle.subscribe_status().is_err());
    }

    #[test]
    fn test_dropped_receivers_are_not_counted() {
        let scm = MemoryServiceManager::new();
        scm.install("svc", StartType::Auto);
        let handle = scm.open_service("svc").unwrap();

        let first = handle.subscribe_status().unwrap();
        let _second = handle.subscribe_status().unwrap();
        assert_eq!(scm.status_subscribers("svc"), 2);

        drop(first);
        assert_eq!(scm.status_subscribers("svc"), 1);
    }
}
