use std::collections::VecDeque;
use std::os::fd::{OwnedFd, RawFd};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use tracing::{debug, error, info, warn};

use super::hooks::SessionHooks;
use super::SessionState;
use crate::adapter::{VirtualTunAdapter, VirtualTunFactory};
use crate::config::{normalize_profile, SessionConfig};
use crate::engine::{
    Credentials, EngineBuilder, EngineError, EngineHost, Event, EventKind, SocketProtector,
    TunClientFactory, TunnelEngine, TunnelObserver,
};
use crate::error::{Error, Result};
use crate::logging::redact_profile;
use crate::options::ConfigSnapshot;

/// Text returned by [`Session::last_error`] when nothing went wrong.
pub const NO_ERROR: &str = "No error";

/// Words that mark a credential rejection in engine messages.
const AUTH_HINTS: &[&str] = &["auth", "credential", "password", "username", "invalid"];

/// Immediate result of [`Session::connect`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectOutcome {
    /// The handshake is running on the worker; watch events or `is_connected()`.
    InProgress,
}

/// One tunnel: engine client, virtual TUN factory and state.
pub struct Session {
    id: String,
    config: SessionConfig,
    me: Weak<Session>,
    hooks: Arc<SessionHooks>,
    factory: Arc<VirtualTunFactory>,
    engine: Mutex<Option<Arc<dyn TunnelEngine>>>,
    observer: RwLock<Option<Weak<dyn TunnelObserver>>>,
    protector: RwLock<Option<Arc<dyn SocketProtector>>>,
    state: Mutex<SessionState>,
    connected: AtomicBool,
    connecting: AtomicBool,
    destroying: AtomicBool,
    /// Set by `disconnect()`, cleared by the next `connect()`.
    stop_requested: AtomicBool,
    reconnects: AtomicU64,
    last_error: Mutex<Option<String>>,
    snapshot: Mutex<ConfigSnapshot>,
    events: Mutex<VecDeque<Event>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Session {
    /// Build the engine client for tunnel `id` and wire this session in as
    /// its event sink, socket-protect hook and TUN factory.
    pub fn create(
        id: &str,
        builder: &dyn EngineBuilder,
        observer: Option<Weak<dyn TunnelObserver>>,
        protector: Option<Arc<dyn SocketProtector>>,
        config: SessionConfig,
    ) -> Result<Arc<Session>> {
        if id.trim().is_empty() {
            return Err(Error::invalid("tunnel id is empty"));
        }

        let app_mode = config.app_mode();
        let session = Arc::new_cyclic(|me: &Weak<Session>| {
            let hooks = Arc::new(SessionHooks::new(id, me.clone()));
            let factory = Arc::new(VirtualTunFactory::new(
                id,
                Some(hooks.clone() as Arc<dyn TunnelObserver>),
                app_mode,
            ));
            Session {
                id: id.to_string(),
                config,
                me: me.clone(),
                hooks,
                factory,
                engine: Mutex::new(None),
                observer: RwLock::new(observer),
                protector: RwLock::new(protector),
                state: Mutex::new(SessionState::Idle),
                connected: AtomicBool::new(false),
                connecting: AtomicBool::new(false),
                destroying: AtomicBool::new(false),
                stop_requested: AtomicBool::new(false),
                reconnects: AtomicU64::new(0),
                last_error: Mutex::new(None),
                snapshot: Mutex::new(ConfigSnapshot::default()),
                events: Mutex::new(VecDeque::new()),
                worker: Mutex::new(None),
            }
        });

        let engine = builder
            .build(
                session.hooks.clone() as Arc<dyn EngineHost>,
                session.factory.clone() as Arc<dyn TunClientFactory>,
            )
            .map_err(|e| Error::SessionCreation(e.message))?;
        *session.engine.lock() = Some(engine);

        info!(tunnel = %id, "Session created");
        Ok(session)
    }

    /// Normalize and evaluate `profile`, provide credentials and start the
    /// handshake on a worker thread.
    ///
    /// Returns as soon as the worker is running. Rejected with
    /// `AlreadyConnected` while another attempt is in flight or established.
    pub fn connect(&self, profile: &str, username: &str, password: &str) -> Result<ConnectOutcome> {
        if self.is_destroying() {
            return Err(Error::internal("session is being destroyed"));
        }
        if profile.trim().is_empty() {
            return Err(self.record_error(Error::invalid("config is empty")));
        }
        if self.worker_running() || self.connected.load(Ordering::SeqCst) {
            return Err(Error::AlreadyConnected);
        }
        if self
            .connecting
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return Err(Error::AlreadyConnected);
        }

        self.stop_requested.store(false, Ordering::SeqCst);
        *self.last_error.lock() = None;
        self.set_state(SessionState::Configuring);
        let engine = match self.engine.lock().clone() {
            Some(engine) => engine,
            None => return Err(self.abort_connect(Error::internal("engine client released"))),
        };

        let content = normalize_profile(profile, &self.config);
        debug!(tunnel = %self.id, profile = %redact_profile(&content), "Normalized profile");

        let info = engine
            .eval_config(&self.config.engine_config(content))
            .map_err(|e| self.abort_connect(Error::config(e.message)))?;
        if info.autologin {
            warn!(tunnel = %self.id, "Profile evaluated as autologin; credentials may be ignored");
        }

        self.set_state(SessionState::Authenticating);
        if username.is_empty() || password.is_empty() {
            return Err(self.abort_connect(Error::invalid("Credentials are empty")));
        }
        let creds = Credentials {
            username: username.to_string(),
            password: password.to_string(),
        };
        engine
            .provide_creds(&creds)
            .map_err(|e| self.abort_connect(classify_creds_error(e)))?;

        self.set_state(SessionState::Connecting);
        self.spawn_worker(engine)?;

        info!(
            tunnel = %self.id,
            remote = info.remote_host.as_deref().unwrap_or("?"),
            "Connect started"
        );
        Ok(ConnectOutcome::InProgress)
    }

    fn spawn_worker(&self, engine: Arc<dyn TunnelEngine>) -> Result<()> {
        let mut slot = self.worker.lock();
        if let Some(old) = slot.take() {
            // Checked finished in connect(); reap it.
            let _ = old.join();
        }

        let me = self.me.clone();
        let id = self.id.clone();
        let handle = thread::Builder::new()
            .name(format!("ovpn-{}", self.id))
            .spawn(move || {
                let result = engine.connect();
                match me.upgrade() {
                    Some(session) => session.on_worker_exit(result),
                    None => debug!(tunnel = %id, "Worker finished after session was dropped"),
                }
            })
            .map_err(|e| self.abort_connect(Error::internal(format!("cannot spawn worker: {e}"))))?;
        *slot = Some(handle);
        Ok(())
    }

    fn on_worker_exit(&self, result: std::result::Result<(), EngineError>) {
        self.connecting.store(false, Ordering::SeqCst);
        let was_connected = self.connected.swap(false, Ordering::SeqCst);

        let mut state = self.state.lock();
        match result {
            Ok(()) => {
                if !matches!(
                    *state,
                    SessionState::Failed | SessionState::Destroyed | SessionState::Disconnecting
                ) {
                    *state = SessionState::Idle;
                }
                info!(tunnel = %self.id, was_connected, "Engine connect returned");
            }
            Err(e) => {
                if !matches!(*state, SessionState::Failed | SessionState::Destroyed) {
                    *self.last_error.lock() = Some(e.message.clone());
                    if *state != SessionState::Disconnecting {
                        *state = SessionState::Failed;
                    }
                }
                error!(tunnel = %self.id, error = %e, "Engine connect failed");
            }
        }
    }

    /// True once the engine reported CONNECTED, false while still connecting.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn is_connecting(&self) -> bool {
        self.connecting.load(Ordering::SeqCst)
    }

    /// Soft restart of the transport after a network change.
    ///
    /// Returns `Ok(false)` without touching anything when the session is
    /// neither connected nor connecting.
    pub fn reconnect(&self) -> Result<bool> {
        if !self.is_connected() && !self.is_connecting() {
            debug!(tunnel = %self.id, "Reconnect skipped, session not active");
            return Ok(false);
        }
        let engine = self.engine.lock().clone().ok_or(Error::NotReady)?;

        match engine.reconnect(0) {
            Ok(()) => {
                let n = self.reconnects.fetch_add(1, Ordering::SeqCst) + 1;
                info!(tunnel = %self.id, count = n, "Reconnect requested");
                Ok(true)
            }
            Err(e) => {
                let msg = format!("Reconnect failed: {}", e.message);
                warn!(tunnel = %self.id, "{}", msg);
                *self.last_error.lock() = Some(msg.clone());
                Err(Error::connection(msg))
            }
        }
    }

    /// Stop the engine and release the worker. Idempotent.
    ///
    /// Waits at most `disconnect_grace_ms` for the worker; a wedged worker
    /// is left running detached.
    pub fn disconnect(&self) {
        self.stop_requested.store(true, Ordering::SeqCst);
        let active = self.is_connected() || self.is_connecting() || self.worker_running();
        if active {
            self.set_state(SessionState::Disconnecting);
            if let Some(engine) = self.engine.lock().clone() {
                engine.stop();
            }
        }
        self.connected.store(false, Ordering::SeqCst);
        self.connecting.store(false, Ordering::SeqCst);

        let handle = self.worker.lock().take();
        if let Some(handle) = handle {
            if handle.thread().id() == thread::current().id() {
                // Called on the worker itself (last Arc dropped there).
                debug!(tunnel = %self.id, "Disconnect on the worker thread, not waiting");
                *self.worker.lock() = Some(handle);
            } else {
                self.await_worker(handle);
            }
        }

        if active {
            self.set_state(SessionState::Idle);
            info!(tunnel = %self.id, "Disconnected");
        }
    }

    fn await_worker(&self, handle: JoinHandle<()>) {
        let grace = Duration::from_millis(self.config.disconnect_grace_ms);
        let deadline = Instant::now() + grace;
        while !handle.is_finished() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(5));
        }
        if handle.is_finished() {
            let _ = handle.join();
        } else {
            warn!(tunnel = %self.id, grace_ms = self.config.disconnect_grace_ms,
                "Worker still running, detaching");
            *self.worker.lock() = Some(handle);
        }
    }

    /// Disconnect and release the engine client and every callback
    /// reference. Idempotent.
    ///
    /// No observer method runs after this returns. Must not be called from
    /// inside a [`TunnelObserver`] callback.
    pub fn destroy(&self) {
        if self.destroying.swap(true, Ordering::SeqCst) {
            return;
        }
        self.disconnect();

        // Waits for any observer call already in flight.
        self.observer.write().take();
        self.protector.write().take();
        self.engine.lock().take();
        self.set_state(SessionState::Destroyed);
        info!(tunnel = %self.id, "Session destroyed");
    }

    /// Exempt the engine's transport socket from the VPN.
    pub fn socket_protect(&self, fd: RawFd, remote: &str, ipv6: bool) -> bool {
        let protector = self.protector.read().clone();
        let Some(protector) = protector else {
            warn!(tunnel = %self.id, fd, remote, "No socket protector, socket left unprotected");
            return false;
        };
        let ok = protector.protect(fd);
        if ok {
            debug!(tunnel = %self.id, fd, remote, ipv6, "Socket protected");
        } else {
            warn!(tunnel = %self.id, fd, remote, ipv6, "Socket protect failed");
        }
        ok
    }

    pub fn pause(&self, reason: &str) {
        if let Some(engine) = self.engine.lock().clone() {
            engine.pause(reason);
        }
    }

    pub fn resume(&self) {
        if let Some(engine) = self.engine.lock().clone() {
            engine.resume();
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock()
    }

    /// Human-readable last error, `"No error"` when none.
    pub fn last_error(&self) -> String {
        self.last_error
            .lock()
            .clone()
            .unwrap_or_else(|| NO_ERROR.to_string())
    }

    pub fn reconnect_count(&self) -> u64 {
        self.reconnects.load(Ordering::SeqCst)
    }

    /// Pushed configuration as last reported by the adapter.
    pub fn snapshot(&self) -> ConfigSnapshot {
        self.snapshot.lock().clone()
    }

    /// Application end of the packet channel; `NotReady` before the adapter starts.
    pub fn app_descriptor(&self) -> Result<RawFd> {
        self.factory.app_end_descriptor()
    }

    /// Owned duplicate of the application end.
    pub fn take_app_descriptor(&self) -> Result<OwnedFd> {
        self.factory.take_app_end_descriptor()
    }

    pub fn adapter(&self) -> Option<Arc<VirtualTunAdapter>> {
        self.factory.adapter()
    }

    /// Most recent engine events, oldest first.
    pub fn recent_events(&self) -> Vec<Event> {
        self.events.lock().iter().cloned().collect()
    }

    pub(crate) fn is_destroying(&self) -> bool {
        self.destroying.load(Ordering::SeqCst)
    }

    /// Run `f` against the application observer unless teardown has begun.
    pub(crate) fn notify<F: FnOnce(&dyn TunnelObserver)>(&self, f: F) {
        let guard = self.observer.read();
        if self.is_destroying() {
            return;
        }
        if let Some(observer) = guard.as_ref().and_then(Weak::upgrade) {
            f(observer.as_ref());
        }
    }

    pub(crate) fn store_snapshot(&self, snapshot: &ConfigSnapshot) {
        if self.state() == SessionState::Connected {
            debug!(tunnel = %self.id, "Snapshot is frozen while connected");
            return;
        }
        *self.snapshot.lock() = snapshot.clone();
    }

    pub(crate) fn handle_event(&self, event: &Event) {
        self.record_event(event);

        let revives = matches!(
            event.kind,
            EventKind::Connected | EventKind::Reconnecting | EventKind::AuthPending
        );
        if revives && !event.fatal && self.stop_requested.load(Ordering::SeqCst) {
            debug!(tunnel = %self.id, event = %event.kind, "Event after disconnect ignored");
            return;
        }

        match &event.kind {
            EventKind::Connected => {
                self.connected.store(true, Ordering::SeqCst);
                self.connecting.store(false, Ordering::SeqCst);
                self.set_state(SessionState::Connected);
                info!(tunnel = %self.id, info = %event.info, "Tunnel connected");
            }
            EventKind::Disconnected => {
                self.connected.store(false, Ordering::SeqCst);
                self.connecting.store(false, Ordering::SeqCst);
                let mut state = self.state.lock();
                if !matches!(
                    *state,
                    SessionState::Failed | SessionState::Destroyed | SessionState::Disconnecting
                ) {
                    *state = SessionState::Idle;
                }
                info!(tunnel = %self.id, "Tunnel disconnected");
            }
            EventKind::Reconnecting => {
                self.set_state(SessionState::Reconnecting);
                info!(tunnel = %self.id, "Tunnel reconnecting");
            }
            EventKind::AuthFailed => {
                self.fail(format!("Authentication failed: {}", event.info));
            }
            EventKind::AuthPending => {
                if event.fatal {
                    self.fail(format!("Authentication pending: {}", event.info));
                } else {
                    if !self.is_connected() {
                        self.set_state(SessionState::Authenticating);
                    }
                    info!(tunnel = %self.id, info = %event.info, "Authentication pending");
                }
            }
            EventKind::TransportError | EventKind::CompressError => {
                let msg = format!("{}: {}", event.kind, event.info);
                if event.fatal {
                    self.fail(msg);
                } else {
                    warn!(tunnel = %self.id, "{}", msg);
                    *self.last_error.lock() = Some(msg);
                }
            }
            kind if event.error => {
                warn!(tunnel = %self.id, event = %kind, info = %event.info, "Engine error event");
            }
            kind => {
                debug!(tunnel = %self.id, event = %kind, info = %event.info, "Engine event");
            }
        }
    }

    fn record_event(&self, event: &Event) {
        let cap = self.config.event_history;
        if cap == 0 {
            return;
        }
        let mut events = self.events.lock();
        while events.len() >= cap {
            events.pop_front();
        }
        events.push_back(event.clone());
    }

    fn fail(&self, msg: String) {
        error!(tunnel = %self.id, "{}", msg);
        *self.last_error.lock() = Some(msg);
        self.connected.store(false, Ordering::SeqCst);
        self.connecting.store(false, Ordering::SeqCst);
        self.set_state(SessionState::Failed);
    }

    fn set_state(&self, next: SessionState) {
        let mut state = self.state.lock();
        if *state == SessionState::Destroyed || *state == next {
            return;
        }
        debug!(tunnel = %self.id, from = %*state, to = %next, "State change");
        *state = next;
    }

    fn worker_running(&self) -> bool {
        self.worker
            .lock()
            .as_ref()
            .is_some_and(|h| !h.is_finished())
    }

    fn record_error(&self, err: Error) -> Error {
        *self.last_error.lock() = Some(err.to_string());
        err
    }

    /// Undo a connect attempt that failed before the worker started.
    fn abort_connect(&self, err: Error) -> Error {
        self.connecting.store(false, Ordering::SeqCst);
        let next = match err {
            Error::InvalidParameters(_) => SessionState::Idle,
            _ => SessionState::Failed,
        };
        self.set_state(next);
        warn!(tunnel = %self.id, error = %err, "Connect aborted");
        self.record_error(err)
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.destroy();
    }
}

fn classify_creds_error(e: EngineError) -> Error {
    let lower = e.message.to_lowercase();
    if AUTH_HINTS.iter().any(|h| lower.contains(h)) {
        Error::auth(e.message)
    } else {
        Error::invalid(e.message)
    }
}
