//! Client facade: owns the session, the single current-connection slot and
//! every timer for one listening instance.
//!
//! ```text
//!  EdgeClient::listen()
//!       │ bootstrap (if needed)
//!       ▼
//!  ┌──────────────┐  TransportEvent   ┌──────┐  ClientEvent   ┌──────────┐
//!  │ slot: Mutex< │ ───────────────►  │ pump │ ─────────────► │ Listener │
//!  │  Option<     │                   └──────┘                └──────────┘
//!  │  Connection  │ ◄── rotation / reconnect / health / stop
//!  │  Handle>>    │ ◄·· heartbeat (try_lock, non-blocking publish)
//!  └──────────────┘
//!         ▲
//!  session refresh ──► SessionContext (cookies, fb_dtsg)
//! ```
//!
//! Every path that replaces the connection goes through
//! [`Inner::replace_connection`], which holds the slot lock for the whole
//! take / close / connect / install sequence.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use tokio::sync::{Mutex, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::bootstrap::Bootstrapper;
use crate::config::ClientConfig;
use crate::connection;
use crate::delta::DeltaEvent;
use crate::dispatcher;
use crate::error::{Result, SyncError};
use crate::heartbeat::{self, Beat};
use crate::refresh::{self, RefreshOutcome, SessionRefresher};
use crate::scheduler::{self, Backoff, RotationWindow};
use crate::session::{SessionContext, SyncCursor};
use crate::topics::PRESENCE_TOPIC;
use crate::transport::{ConnectionHandle, TransportEvent};

const EVENT_QUEUE: usize = 256;

/// What a listener receives.
#[derive(Debug, Clone, PartialEq)]
pub enum ClientEvent {
    Delta(DeltaEvent),
    /// The client can no longer keep a connection and has stopped.
    Error(SyncError),
}

/// Why the current connection is being replaced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Replacement {
    Initial,
    /// The transport closed on its own.
    Reactive,
    Rotation,
    Stale,
    /// Presence publishes kept failing.
    Heartbeat,
    /// The server lost our sync queue.
    Resync,
    Manual,
}

impl Replacement {
    /// A transport close keeps the identity; deliberate teardowns renew it.
    fn regenerates_identity(self) -> bool {
        matches!(
            self,
            Self::Rotation | Self::Stale | Self::Heartbeat | Self::Resync | Self::Manual
        )
    }
}

pub struct EdgeClient {
    session: Arc<SessionContext>,
    config: ClientConfig,
    bootstrapper: Bootstrapper,
    refresher: Option<SessionRefresher>,
}

impl EdgeClient {
    pub fn new(session: Arc<SessionContext>, config: ClientConfig) -> Result<Self> {
        let bootstrapper = Bootstrapper::new(&config)?;
        let refresher = config
            .refresh
            .as_ref()
            .map(|refresh| SessionRefresher::new(&config, refresh))
            .transpose()?;
        Ok(Self {
            session,
            config,
            bootstrapper,
            refresher,
        })
    }

    pub fn session(&self) -> &Arc<SessionContext> {
        &self.session
    }

    /// Bootstrap if needed, open the first connection and start the timers.
    ///
    /// Authentication and validation failures are returned directly. A
    /// network failure on the first connect hands over to the reconnect
    /// scheduler and still yields a listener.
    pub async fn listen(self) -> Result<Listener> {
        // Appstate exports carry cookies only; fetch a form token up front
        if let Some(refresher) = &self.refresher {
            if self.session.fb_dtsg().is_none() {
                if let Err(e) = refresher.refresh(&self.session).await {
                    warn!(error = %e, "Initial session refresh failed, continuing without token");
                }
            }
        }

        if self.session.needs_bootstrap() {
            self.bootstrapper.bootstrap(&self.session).await?;
        } else {
            info!(
                seq_id = self.session.cursor().last_seq_id,
                "Resuming from stored cursor"
            );
        }

        let (transport_tx, transport_rx) = mpsc::channel(EVENT_QUEUE);
        let (events_tx, events_rx) = mpsc::channel(EVENT_QUEUE);

        let inner = Arc::new(Inner {
            session: self.session,
            config: self.config,
            bootstrapper: self.bootstrapper,
            refresher: self.refresher,
            slot: Mutex::new(None),
            current_id: AtomicU64::new(0),
            next_conn_id: AtomicU64::new(0),
            transport_tx,
            events_tx,
            emitting: AtomicBool::new(true),
            stopped: AtomicBool::new(false),
            reconnect_pending: AtomicBool::new(false),
            resync_pending: AtomicBool::new(false),
            timers: CancellationToken::new(),
            heartbeat: CancellationToken::new(),
            shutdown: CancellationToken::new(),
            connect_attempts: AtomicU64::new(0),
            rotations: AtomicU64::new(0),
            refreshes: AtomicU64::new(0),
        });

        tokio::spawn(run_pump(inner.clone(), transport_rx));

        match inner.replace_connection(Replacement::Initial).await {
            Ok(()) => {}
            Err(e) if e.is_retryable() && inner.config.reconnect.auto_reconnect => {
                warn!(error = %e, "First connection failed, retrying in background");
                inner.schedule_reconnect();
            }
            Err(e) => {
                inner.stop().await;
                return Err(e);
            }
        }

        inner.spawn_timers();

        Ok(Listener {
            events: events_rx,
            handle: ListenerHandle { inner },
        })
    }
}

/// Receives events from a running client.
pub struct Listener {
    events: mpsc::Receiver<ClientEvent>,
    handle: ListenerHandle,
}

impl Listener {
    /// Next event, or `None` once the client has stopped and every event
    /// queued before the stop has been taken.
    pub async fn recv(&mut self) -> Option<ClientEvent> {
        tokio::select! {
            biased;
            event = self.events.recv() => event,
            _ = self.handle.inner.shutdown.cancelled() => self.events.try_recv().ok(),
        }
    }

    pub fn handle(&self) -> ListenerHandle {
        self.handle.clone()
    }

    pub async fn stop(&self) {
        self.handle.stop().await;
    }

    pub fn cursor(&self) -> SyncCursor {
        self.handle.cursor()
    }

    pub fn cursor_changes(&self) -> tokio::sync::watch::Receiver<SyncCursor> {
        self.handle.cursor_changes()
    }
}

impl Drop for Listener {
    fn drop(&mut self) {
        if self.handle.inner.stopped.load(Ordering::SeqCst) {
            return;
        }
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            let handle = self.handle.clone();
            runtime.spawn(async move { handle.stop().await });
        }
    }
}

/// Control side of a listener; cheap to clone into other tasks.
#[derive(Clone)]
pub struct ListenerHandle {
    inner: Arc<Inner>,
}

impl ListenerHandle {
    pub async fn stop(&self) {
        self.inner.stop().await;
    }

    /// Tear down the current connection and reconnect with a new identity.
    pub async fn reconnect(&self) -> Result<()> {
        self.inner.replace_connection(Replacement::Manual).await
    }

    /// Refresh cookies and form token now, outside the regular schedule.
    pub async fn refresh_session(&self) -> Result<RefreshOutcome> {
        self.inner.refresh_session().await
    }

    pub fn cursor(&self) -> SyncCursor {
        self.inner.session.cursor()
    }

    /// Wakes on every cursor change; the value is the latest cursor.
    pub fn cursor_changes(&self) -> tokio::sync::watch::Receiver<SyncCursor> {
        self.inner.session.subscribe_cursor()
    }

    pub fn session(&self) -> &Arc<SessionContext> {
        &self.inner.session
    }

    pub fn is_connected(&self) -> bool {
        self.inner.session.is_connected()
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.stopped.load(Ordering::SeqCst)
    }

    /// Connection attempts made so far, including the first.
    pub fn connect_attempts(&self) -> u64 {
        self.inner.connect_attempts.load(Ordering::SeqCst)
    }

    pub fn rotations(&self) -> u64 {
        self.inner.rotations.load(Ordering::SeqCst)
    }

    /// Successful session refreshes so far.
    pub fn refreshes(&self) -> u64 {
        self.inner.refreshes.load(Ordering::SeqCst)
    }
}

struct Inner {
    session: Arc<SessionContext>,
    config: ClientConfig,
    bootstrapper: Bootstrapper,
    refresher: Option<SessionRefresher>,
    slot: Mutex<Option<ConnectionHandle>>,
    /// Id of the connection whose events count; 0 when there is none.
    current_id: AtomicU64,
    next_conn_id: AtomicU64,
    transport_tx: mpsc::Sender<TransportEvent>,
    events_tx: mpsc::Sender<ClientEvent>,
    emitting: AtomicBool,
    stopped: AtomicBool,
    reconnect_pending: AtomicBool,
    resync_pending: AtomicBool,
    /// Rotation, reactive reconnect, health check and session refresh.
    timers: CancellationToken,
    heartbeat: CancellationToken,
    /// Pump and listener.
    shutdown: CancellationToken,
    connect_attempts: AtomicU64,
    rotations: AtomicU64,
    refreshes: AtomicU64,
}

impl Inner {
    /// Take the current handle, close it, connect a new one and install it,
    /// all under the slot lock.
    async fn replace_connection(self: &Arc<Self>, why: Replacement) -> Result<()> {
        let mut slot = self.slot.lock().await;
        if self.stopped.load(Ordering::SeqCst) {
            return Ok(());
        }
        if why == Replacement::Reactive && slot.as_ref().is_some_and(|h| h.is_open()) {
            debug!("Connection already live, skipping reconnect");
            return Ok(());
        }

        if let Some(old) = slot.take() {
            debug!(conn_id = old.conn_id(), ?why, "Tearing down connection");
            self.current_id.store(0, Ordering::SeqCst);
            self.session.set_connected(false);
            old.close().await;
        }

        if self.resync_pending.load(Ordering::SeqCst) {
            self.bootstrapper.bootstrap(&self.session).await?;
            self.resync_pending.store(false, Ordering::SeqCst);
        }
        if why.regenerates_identity() {
            self.session.regenerate_client_id();
        }

        let conn_id = self.next_conn_id.fetch_add(1, Ordering::SeqCst) + 1;
        self.current_id.store(conn_id, Ordering::SeqCst);
        self.reconnect_pending.store(false, Ordering::SeqCst);
        self.connect_attempts.fetch_add(1, Ordering::SeqCst);

        match connection::connect(
            &self.session,
            &self.config.edge,
            conn_id,
            self.transport_tx.clone(),
        )
        .await
        {
            Ok(handle) => {
                *slot = Some(handle);
                self.session.mark_listened();
                info!(conn_id, ?why, "Edge connection ready");
                Ok(())
            }
            Err(e) => {
                self.current_id.store(0, Ordering::SeqCst);
                self.session.set_connected(false);
                Err(e)
            }
        }
    }

    /// Arrange for exactly one reactive reconnect.
    fn schedule_reconnect(self: &Arc<Self>) {
        if self.stopped.load(Ordering::SeqCst) {
            return;
        }
        if self.reconnect_pending.swap(true, Ordering::SeqCst) {
            debug!("Reconnect already pending");
            return;
        }

        let inner = self.clone();
        tokio::spawn(async move {
            let backoff = Backoff::from_config(&inner.config.reconnect);
            let fatal = scheduler::retry_with_backoff(backoff, &inner.timers, |_| {
                let inner = inner.clone();
                async move { inner.replace_connection(Replacement::Reactive).await }
            })
            .await;
            if let Some(e) = fatal {
                inner.fail(e).await;
            }
        });
    }

    /// The server dropped our sync queue: re-bootstrap and reconnect.
    fn request_resync(self: &Arc<Self>, code: String) {
        if self.resync_pending.swap(true, Ordering::SeqCst) {
            return;
        }
        warn!(error_code = %code, "Sync queue lost, re-bootstrapping");
        let inner = self.clone();
        tokio::spawn(async move {
            if let Err(e) = inner.replace_connection(Replacement::Resync).await {
                inner.handle_failure(e).await;
            }
        });
    }

    async fn handle_failure(self: &Arc<Self>, e: SyncError) {
        if e.is_retryable() && self.config.reconnect.auto_reconnect {
            warn!(error = %e, "Connection replacement failed");
            self.schedule_reconnect();
        } else {
            self.fail(e).await;
        }
    }

    /// Surface a terminal error to the consumer, then stop.
    async fn fail(self: &Arc<Self>, e: SyncError) {
        if self.stopped.load(Ordering::SeqCst) {
            return;
        }
        warn!(error = %e, code = e.error_code(), "Edge client giving up");
        self.emit(ClientEvent::Error(e)).await;
        self.stop().await;
    }

    async fn emit(&self, event: ClientEvent) {
        if !self.emitting.load(Ordering::SeqCst) {
            return;
        }
        tokio::select! {
            _ = self.shutdown.cancelled() => {}
            _ = self.events_tx.send(event) => {}
        }
    }

    /// Presence publish on the live connection. Never waits, neither for a
    /// replacement in progress nor for room in the outbound queue, so the
    /// slot guard is never held across an await.
    fn publish_presence(&self, payload: serde_json::Value) -> Beat {
        let Ok(slot) = self.slot.try_lock() else {
            return Beat::NotConnected;
        };
        match slot.as_ref() {
            Some(handle) if handle.is_open() && self.session.is_connected() => {
                match handle.try_publish(PRESENCE_TOPIC, payload.to_string().into_bytes()) {
                    Ok(()) => Beat::Sent,
                    Err(e) => Beat::Failed(e),
                }
            }
            _ => Beat::NotConnected,
        }
    }

    async fn refresh_session(&self) -> Result<RefreshOutcome> {
        let Some(refresher) = &self.refresher else {
            return Err(SyncError::Config("session refresh is disabled".into()));
        };
        let outcome = refresher.refresh(&self.session).await?;
        self.refreshes.fetch_add(1, Ordering::SeqCst);
        Ok(outcome)
    }

    fn spawn_timers(self: &Arc<Self>) {
        let window = RotationWindow::from_config(&self.config.reconnect);
        let inner = self.clone();
        tokio::spawn(scheduler::run_rotation(
            window,
            self.timers.clone(),
            move |delay| {
                let inner = inner.clone();
                async move {
                    info!(after_secs = delay.as_secs(), "Rotating edge identity");
                    inner.rotations.fetch_add(1, Ordering::SeqCst);
                    if let Err(e) = inner.replace_connection(Replacement::Rotation).await {
                        inner.handle_failure(e).await;
                    }
                }
            },
        ));

        if let Some(health) = self.config.reconnect.health_check.clone() {
            let session = self.session.clone();
            let inner = self.clone();
            tokio::spawn(scheduler::run_health_check(
                health,
                self.timers.clone(),
                move || {
                    if session.is_connected() {
                        session.idle_for()
                    } else {
                        None
                    }
                },
                move |_| {
                    let inner = inner.clone();
                    async move {
                        if let Err(e) = inner.replace_connection(Replacement::Stale).await {
                            inner.handle_failure(e).await;
                        }
                    }
                },
            ));
        }

        if let Some(refresh) = &self.config.refresh {
            let inner = self.clone();
            tokio::spawn(refresh::run_session_refresh(
                refresh.interval,
                self.timers.clone(),
                move || {
                    let inner = inner.clone();
                    async move { inner.refresh_session().await }
                },
            ));
        }

        if self.config.presence.broadcast {
            let publisher = self.clone();
            let inner = self.clone();
            tokio::spawn(heartbeat::run_heartbeat(
                self.config.presence.interval,
                self.heartbeat.clone(),
                move |payload| std::future::ready(publisher.publish_presence(payload)),
                move |_| {
                    let inner = inner.clone();
                    async move {
                        if inner.reconnect_pending.load(Ordering::SeqCst) {
                            debug!("Reconnect already pending, heartbeat not forcing another");
                            return;
                        }
                        if let Err(e) = inner.replace_connection(Replacement::Heartbeat).await {
                            inner.handle_failure(e).await;
                        }
                    }
                },
            ));
        }
    }

    /// Stop order: event gate, rotation/reconnect/health timers, heartbeat,
    /// then the connection itself.
    async fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Stopping edge client");

        self.emitting.store(false, Ordering::SeqCst);
        self.timers.cancel();
        self.heartbeat.cancel();

        let mut slot = self.slot.lock().await;
        if let Some(handle) = slot.take() {
            handle.close().await;
        }
        self.current_id.store(0, Ordering::SeqCst);
        self.session.set_connected(false);
        drop(slot);

        self.shutdown.cancel();
    }
}

/// Route transport events: payloads from the current connection go through
/// the dispatcher, closes of the current connection trigger a reconnect.
async fn run_pump(inner: Arc<Inner>, mut transport_rx: mpsc::Receiver<TransportEvent>) {
    loop {
        let event = tokio::select! {
            _ = inner.shutdown.cancelled() => break,
            event = transport_rx.recv() => match event {
                Some(event) => event,
                None => break,
            },
        };

        match event {
            TransportEvent::Message {
                conn_id,
                topic,
                payload,
            } => {
                if conn_id != inner.current_id.load(Ordering::SeqCst) {
                    trace!(conn_id, %topic, "Dropping payload from retired connection");
                    continue;
                }
                inner.session.touch();

                let outcome = inner
                    .session
                    .update_cursor(|cursor| dispatcher::dispatch(cursor, &topic, &payload));
                if let Some(code) = outcome.resync_required {
                    inner.request_resync(code);
                }
                for event in outcome.events {
                    inner.emit(ClientEvent::Delta(event)).await;
                }
            }
            TransportEvent::Closed { conn_id, reason } => {
                if conn_id != inner.current_id.load(Ordering::SeqCst) {
                    debug!(conn_id, "Ignoring close of retired connection");
                    continue;
                }
                inner.session.set_connected(false);
                if inner.config.reconnect.auto_reconnect {
                    inner.schedule_reconnect();
                } else {
                    let inner = inner.clone();
                    tokio::spawn(async move {
                        inner
                            .fail(SyncError::Network(format!("connection closed: {reason}")))
                            .await;
                    });
                }
            }
        }
    }
    debug!("Event pump stopped");
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_policy_per_replacement() {
        assert!(!Replacement::Initial.regenerates_identity());
        assert!(!Replacement::Reactive.regenerates_identity());
        assert!(Replacement::Rotation.regenerates_identity());
        assert!(Replacement::Stale.regenerates_identity());
        assert!(Replacement::Heartbeat.regenerates_identity());
        assert!(Replacement::Resync.regenerates_identity());
        assert!(Replacement::Manual.regenerates_identity());
    }
}
