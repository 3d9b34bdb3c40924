//! Process-wide registry of live sessions, with admission control and
//! shutdown fan-out.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::Notify;
use tracing::info;
use uuid::Uuid;

use crate::config::Config;
use crate::session::SessionHandle;

/// Why a connection was refused admission, before any WebSocket upgrade work
/// is done.
#[derive(Debug, PartialEq, Eq)]
pub enum AdmissionError {
    OnceAlreadyServed,
    MaxClientsReached,
}

pub struct Registry {
    config: Arc<Config>,
    sessions: DashMap<Uuid, Arc<SessionHandle>>,
    shutdown: AtomicBool,
    pub shutdown_notify: Notify,
}

impl Registry {
    pub fn new(config: Arc<Config>) -> Arc<Self> {
        Arc::new(Self {
            config,
            sessions: DashMap::new(),
            shutdown: AtomicBool::new(false),
            shutdown_notify: Notify::new(),
        })
    }

    /// Enforces the `once` and `max-clients` policy before a Session is
    /// allowed to exist.
    pub fn check_admission(&self) -> Result<(), AdmissionError> {
        if self.config.once && self.count() > 0 {
            return Err(AdmissionError::OnceAlreadyServed);
        }
        if self.config.max_clients > 0 && self.count() >= self.config.max_clients {
            return Err(AdmissionError::MaxClientsReached);
        }
        Ok(())
    }

    pub fn insert(&self, id: Uuid, session: Arc<SessionHandle>) {
        self.sessions.insert(id, session);
    }

    pub fn remove(&self, id: &Uuid) {
        self.sessions.remove(id);
        if self.config.once && self.count() == 0 {
            info!("exiting due to the --once option");
            self.trigger_shutdown();
        }
    }

    pub fn count(&self) -> usize {
        self.sessions.len()
    }

    pub fn for_each_live(&self, mut f: impl FnMut(&SessionHandle)) {
        for entry in self.sessions.iter() {
            f(entry.value());
        }
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    pub fn trigger_shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
        self.shutdown_notify.notify_waiters();
    }

    /// Sends the close signal to every live session's child; used on
    /// process shutdown to tear everything down in one pass.
    pub fn terminate_all(&self) {
        for entry in self.sessions.iter() {
            entry.value().request_close();
        }
    }
}
