// src/service/windows.rs
//
// Service control manager backend for Windows. Queries and control go through
// `windows-service` with a fresh manager connection per call. Change
// notifications come from `SubscribeServiceChangeNotifications`; polling on a
// background thread is used only when a subscription cannot be made.

use anyhow::{Context, Result};
use std::ffi::{c_void, OsStr};
use std::io;
use std::os::windows::ffi::OsStrExt;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use windows_service::service::{Service, ServiceAccess, ServiceStartType, ServiceState};
use windows_service::service_manager::{ServiceManager, ServiceManagerAccess};
use windows_sys::Win32::System::Services::{
    CloseServiceHandle, OpenSCManagerW, OpenServiceW, SubscribeServiceChangeNotifications,
    UnsubscribeServiceChangeNotifications, PSC_NOTIFICATION_REGISTRATION,
    SC_EVENT_DATABASE_CHANGE, SC_EVENT_STATUS_CHANGE, SC_EVENT_TYPE, SC_HANDLE,
    SC_MANAGER_CONNECT, SC_MANAGER_ENUMERATE_SERVICE, SERVICE_QUERY_STATUS,
};

use super::{
    NotifyMask, RunState, ServiceControl, ServiceError, ServiceHandle, ServiceResult, StartType,
};

const STATUS_POLL_INTERVAL: Duration = Duration::from_millis(500);
const DATABASE_POLL_INTERVAL: Duration = Duration::from_secs(2);

const ERROR_SUCCESS: u32 = 0;
const ERROR_ACCESS_DENIED: i32 = 5;
const ERROR_SERVICE_DOES_NOT_EXIST: i32 = 1060;
const ERROR_SERVICE_MARKED_FOR_DELETE: i32 = 1072;

pub struct WindowsServiceManager;

impl WindowsServiceManager {
    /// Checks that the service control manager is reachable.
    pub fn connect() -> Result<Self> {
        manager().context("Failed to connect to the service control manager")?;
        Ok(Self)
    }
}

fn manager() -> Result<ServiceManager> {
    ServiceManager::local_computer(None::<&str>, ServiceManagerAccess::CONNECT)
        .context("Failed to open service manager")
}

fn open(name: &str, access: ServiceAccess) -> Result<Service> {
    manager()?
        .open_service(name, access)
        .with_context(|| format!("Failed to open service {}", name))
}

fn from_os_code(name: &str, code: Option<i32>) -> Option<ServiceError> {
    match code {
        Some(ERROR_SERVICE_DOES_NOT_EXIST) | Some(ERROR_SERVICE_MARKED_FOR_DELETE) => {
            Some(ServiceError::NotFound(name.to_string()))
        }
        Some(ERROR_ACCESS_DENIED) => Some(ServiceError::AccessDenied(name.to_string())),
        _ => None,
    }
}

fn to_service_error(name: &str, err: anyhow::Error) -> ServiceError {
    let code = err.chain().find_map(|cause| {
        match cause.downcast_ref::<windows_service::Error>() {
            Some(windows_service::Error::Winapi(io)) => io.raw_os_error(),
            _ => cause
                .downcast_ref::<io::Error>()
                .and_then(|io| io.raw_os_error()),
        }
    });

    from_os_code(name, code).unwrap_or_else(|| ServiceError::Os(format!("{:#}", err)))
}

fn run_state(state: ServiceState) -> RunState {
    match state {
        ServiceState::Stopped => RunState::Stopped,
        ServiceState::StartPending => RunState::StartPending,
        ServiceState::StopPending => RunState::StopPending,
        ServiceState::Running => RunState::Running,
        ServiceState::ContinuePending => RunState::ContinuePending,
        ServiceState::PausePending => RunState::PausePending,
        ServiceState::Paused => RunState::Paused,
    }
}

/// Raw SCM handle kept open for the lifetime of a subscription.
struct ScHandle(SC_HANDLE);

impl ScHandle {
    fn manager(access: u32) -> io::Result<Self> {
        let handle = unsafe { OpenSCManagerW(std::ptr::null(), std::ptr::null(), access) };
        if handle == 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self(handle))
    }

    fn service(manager: &ScHandle, name: &str, access: u32) -> io::Result<Self> {
        let wide: Vec<u16> = OsStr::new(name).encode_wide().chain(Some(0)).collect();
        let handle = unsafe { OpenServiceW(manager.0, wide.as_ptr(), access) };
        if handle == 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self(handle))
    }
}

impl Drop for ScHandle {
    fn drop(&mut self) {
        unsafe {
            CloseServiceHandle(self.0);
        }
    }
}

type NotificationCallback = unsafe extern "system" fn(u32, *const c_void);

/// A registered change notification feeding an mpsc sender. Dropping it
/// unsubscribes, which waits for a callback in progress, then frees the
/// sender and closes the handles.
struct Subscription<T> {
    registration: PSC_NOTIFICATION_REGISTRATION,
    sender: *mut UnboundedSender<T>,
    // Subscribed handle first, so it closes before the manager it came from.
    _handles: Vec<ScHandle>,
}

// The registration and sender pointer are owned exclusively by this value.
unsafe impl<T: Send> Send for Subscription<T> {}

impl<T: Send + 'static> Subscription<T> {
    fn new(
        handles: Vec<ScHandle>,
        event: SC_EVENT_TYPE,
        callback: NotificationCallback,
        sender: UnboundedSender<T>,
    ) -> io::Result<Self> {
        let target = handles
            .first()
            .map(|handle| handle.0)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "no handle to subscribe"))?;

        let sender = Box::into_raw(Box::new(sender));
        let mut registration: PSC_NOTIFICATION_REGISTRATION = unsafe { std::mem::zeroed() };
        let code = unsafe {
            SubscribeServiceChangeNotifications(
                target,
                event,
                Some(callback),
                sender as *const c_void,
                &mut registration,
            )
        };
        if code != ERROR_SUCCESS {
            drop(unsafe { Box::from_raw(sender) });
            return Err(io::Error::from_raw_os_error(code as i32));
        }

        Ok(Self {
            registration,
            sender,
            _handles: handles,
        })
    }

    /// Keep the subscription registered until the receiver is dropped.
    fn hold_until_closed(self) -> io::Result<()> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
        let watcher = unsafe { (*self.sender).clone() };

        runtime.spawn(async move {
            watcher.closed().await;
            // Unsubscribing blocks on callbacks still running.
            let _ = tokio::task::spawn_blocking(move || drop(self)).await;
        });
        Ok(())
    }
}

impl<T> Drop for Subscription<T> {
    fn drop(&mut self) {
        unsafe {
            UnsubscribeServiceChangeNotifications(self.registration);
            drop(Box::from_raw(self.sender));
        }
    }
}

unsafe extern "system" fn on_database_change(_notify: u32, context: *const c_void) {
    let sender = &*(context as *const UnboundedSender<()>);
    let _ = sender.send(());
}

unsafe extern "system" fn on_status_change(notify: u32, context: *const c_void) {
    let sender = &*(context as *const UnboundedSender<NotifyMask>);
    let _ = sender.send(NotifyMask(notify));
}

fn poll_database(tx: UnboundedSender<()>) -> ServiceResult<()> {
    thread::Builder::new()
        .name("scm-database-poll".to_string())
        .spawn(move || loop {
            thread::sleep(DATABASE_POLL_INTERVAL);
            if tx.send(()).is_err() {
                break;
            }
        })
        .map_err(|e| ServiceError::Os(e.to_string()))?;
    Ok(())
}

impl ServiceControl for WindowsServiceManager {
    fn open_service(&self, name: &str) -> ServiceResult<Arc<dyn ServiceHandle>> {
        open(name, ServiceAccess::QUERY_STATUS).map_err(|e| to_service_error(name, e))?;
        Ok(Arc::new(WindowsService {
            name: name.to_string(),
        }))
    }

    fn subscribe_database(&self) -> ServiceResult<UnboundedReceiver<()>> {
        let (tx, rx) = mpsc::unbounded_channel();
        let subscribed = ScHandle::manager(SC_MANAGER_CONNECT | SC_MANAGER_ENUMERATE_SERVICE)
            .and_then(|manager| {
                Subscription::new(
                    vec![manager],
                    SC_EVENT_DATABASE_CHANGE,
                    on_database_change,
                    tx.clone(),
                )
            })
            .and_then(Subscription::hold_until_closed);

        if let Err(e) = subscribed {
            log::warn!("Service database notifications unavailable, polling: {}", e);
            poll_database(tx)?;
        }
        Ok(rx)
    }
}

pub struct WindowsService {
    name: String,
}

impl WindowsService {
    fn query(&self) -> Result<RunState> {
        let status = open(&self.name, ServiceAccess::QUERY_STATUS)?
            .query_status()
            .with_context(|| format!("Failed to query status of {}", self.name))?;
        Ok(run_state(status.current_state))
    }

    fn subscribe_native(&self, tx: UnboundedSender<NotifyMask>) -> io::Result<()> {
        let manager = ScHandle::manager(SC_MANAGER_CONNECT)?;
        let service = ScHandle::service(&manager, &self.name, SERVICE_QUERY_STATUS)?;
        Subscription::new(
            vec![service, manager],
            SC_EVENT_STATUS_CHANGE,
            on_status_change,
            tx,
        )?
        .hold_until_closed()
    }

    fn poll_status(&self, tx: UnboundedSender<NotifyMask>) -> ServiceResult<()> {
        let mut last = self.query_status().map_err(|e| match e {
            ServiceError::AccessDenied(name) => ServiceError::SubscriptionDenied(name),
            other => other,
        })?;

        let name = self.name.clone();
        thread::Builder::new()
            .name(format!("scm-status-poll-{}", name))
            .spawn(move || {
                let service = WindowsService { name };
                while !tx.is_closed() {
                    thread::sleep(STATUS_POLL_INTERVAL);
                    match service.query_status() {
                        Ok(state) if state != last => {
                            last = state;
                            if tx.send(NotifyMask::from(state)).is_err() {
                                break;
                            }
                        }
                        Ok(_) => {}
                        Err(ServiceError::NotFound(_)) => {
                            let _ = tx.send(NotifyMask(NotifyMask::DELETED));
                            break;
                        }
                        Err(e) => log::debug!("Status poll for {} failed: {}", service.name, e),
                    }
                }
            })
            .map_err(|e| ServiceError::SubscriptionDenied(format!("{}: {}", self.name, e)))?;
        Ok(())
    }
}

impl ServiceHandle for WindowsService {
    fn name(&self) -> &str {
        &self.name
    }

    fn query_status(&self) -> ServiceResult<RunState> {
        self.query().map_err(|e| to_service_error(&self.name, e))
    }

    fn start_type(&self) -> ServiceResult<StartType> {
        let config = open(&self.name, ServiceAccess::QUERY_CONFIG)
            .and_then(|service| {
                service
                    .query_config()
                    .with_context(|| format!("Failed to query config of {}", self.name))
            })
            .map_err(|e| to_service_error(&self.name, e))?;

        Ok(match config.start_type {
            ServiceStartType::Disabled => StartType::Disabled,
            ServiceStartType::OnDemand => StartType::Demand,
            _ => StartType::Auto,
        })
    }

    fn subscribe_status(&self) -> ServiceResult<UnboundedReceiver<NotifyMask>> {
        let (tx, rx) = mpsc::unbounded_channel();
        match self.subscribe_native(tx.clone()) {
            Ok(()) => Ok(rx),
            Err(e) => match from_os_code(&self.name, e.raw_os_error()) {
                Some(ServiceError::AccessDenied(name)) => Err(ServiceError::SubscriptionDenied(name)),
                Some(err) => Err(err),
                None => {
                    log::debug!("Status notifications for {} unavailable, polling: {}", self.name, e);
                    self.poll_status(tx)?;
                    Ok(rx)
                }
            },
        }
    }

    fn stop(&self) -> ServiceResult<()> {
        open(&self.name, ServiceAccess::STOP)
            .and_then(|service| {
                service
                    .stop()
                    .with_context(|| format!("Failed to stop service {}", self.name))
            })
            .map(|_| ())
            .map_err(|e| to_service_error(&self.name, e))
    }
}
