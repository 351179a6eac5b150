// ── Scrutiny client ──
//
// Session lifecycle for one server connection: opens the link, runs the
// background listener and the periodic tasks, correlates requests with
// their replies, and tears everything down so no waiter is left hanging.

use std::collections::BTreeMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use arc_swap::ArcSwapOption;
use dashmap::DashMap;
use futures_util::FutureExt;
use scrutiny_api::protocol::{self, ClientMessage, Request, ServerBody, WriteCompletion};
use scrutiny_api::{Link, LinkSender};
use tokio::sync::{Mutex, broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::config::{ClientConfig, socket_address};
use crate::convert;
use crate::error::CoreError;
use crate::handle::WatchableHandle;
use crate::listener::{PendingRequest, listener_task, unexpected};
use crate::model::{
    ClientEvent, ConnectionState, DeviceInfo, DeviceLinkConfig, LocalStatistics,
    ServerStatistics, ServerStatus, SfdInfo, ValueStatus, WatchableCount, WatchableList,
    WatchableListFilter, WatchablePath,
};
use crate::registry::Registry;
use crate::stats::StatsCollector;

const EVENT_CHANNEL_SIZE: usize = 256;
const STATS_WINDOW: Duration = Duration::from_secs(1);
/// Added to the poll interval when waiting for the first status.
const FIRST_STATUS_GRACE: Duration = Duration::from_secs(2);

// ── Client ───────────────────────────────────────────────────────────

/// Connection to one Scrutiny server.
///
/// Cheaply cloneable via `Arc<ClientInner>`. Does not connect until
/// [`connect()`](Self::connect) is called.
#[derive(Clone)]
pub struct Client {
    pub(crate) inner: Arc<ClientInner>,
}

pub(crate) struct ClientInner {
    config: ClientConfig,
    session: ArcSwapOption<Session>,
    pub(crate) connection_state: watch::Sender<ConnectionState>,
    pub(crate) status: watch::Sender<Option<Arc<ServerStatus>>>,
    pub(crate) server_time_zero: watch::Sender<Option<f64>>,
    pub(crate) event_tx: broadcast::Sender<ClientEvent>,
    pub(crate) registry: Registry,
    pub(crate) pending: DashMap<u32, PendingRequest>,
    /// Completion channels of acknowledged writes, by request token.
    pub(crate) write_trackers: DashMap<String, mpsc::UnboundedSender<WriteCompletion>>,
    pub(crate) stats: StatsCollector,
    next_reqid: AtomicU32,
    /// Serializes connect and disconnect.
    lifecycle: Mutex<()>,
    task_handles: Mutex<Vec<JoinHandle<()>>>,
}

/// One open link and the token that stops its tasks.
pub(crate) struct Session {
    sender: LinkSender,
    pub(crate) cancel: CancellationToken,
}

impl Client {
    pub fn new(config: ClientConfig) -> Self {
        let (connection_state, _) = watch::channel(ConnectionState::Disconnected);
        let (status, _) = watch::channel(None);
        let (server_time_zero, _) = watch::channel(None);
        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_SIZE);

        Self {
            inner: Arc::new(ClientInner {
                config,
                session: ArcSwapOption::empty(),
                connection_state,
                status,
                server_time_zero,
                event_tx,
                registry: Registry::new(),
                pending: DashMap::new(),
                write_trackers: DashMap::new(),
                stats: StatsCollector::new(),
                next_reqid: AtomicU32::new(1),
                lifecycle: Mutex::new(()),
                task_handles: Mutex::new(Vec::new()),
            }),
        }
    }

    pub(crate) fn from_inner(inner: Arc<ClientInner>) -> Self {
        Self { inner }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    // ── Connection lifecycle ─────────────────────────────────────────

    /// Connect to the configured server.
    pub async fn connect(&self) -> Result<(), CoreError> {
        let host = self.inner.config.host.clone();
        self.connect_to(&host, self.inner.config.port).await
    }

    /// Connect to `host:port`, dropping any current connection first.
    ///
    /// Returns once the server welcomed the client and, unless disabled,
    /// the first status broadcast arrived. On failure the client is left
    /// in [`ConnectionState::Error`].
    pub async fn connect_to(&self, host: &str, port: u16) -> Result<(), CoreError> {
        let _lifecycle = self.inner.lifecycle.lock().await;
        self.shutdown(ConnectionState::Disconnected).await;

        let addr = socket_address(host, port);
        info!(%addr, kind = ?self.inner.config.transport.kind, "connecting to server");
        self.inner.connection_state.send_replace(ConnectionState::Connecting);

        match self.open_session(&addr).await {
            Ok(()) => {
                self.inner.stats.record_connect();
                let _ = self.inner.event_tx.send(ClientEvent::Connected {
                    host: host.to_owned(),
                    port,
                });
                info!(%addr, "connected to server");
                Ok(())
            }
            Err(e) => {
                warn!(%addr, error = %e, "connection failed");
                self.shutdown(ConnectionState::Error {
                    reason: e.to_string(),
                })
                .await;
                Err(e)
            }
        }
    }

    async fn open_session(&self, addr: &str) -> Result<(), CoreError> {
        let config = &self.inner.config;
        let (sender, receiver) = Link::open(addr, &config.transport).await?.split();
        let session = Arc::new(Session {
            sender,
            cancel: CancellationToken::new(),
        });
        self.inner.session.store(Some(Arc::clone(&session)));

        {
            let mut handles = self.inner.task_handles.lock().await;
            handles.push(tokio::spawn(listener_task(
                self.clone(),
                receiver,
                Arc::clone(&session),
            )));
            if !config.status_poll_interval.is_zero() {
                handles.push(tokio::spawn(status_poll_task(
                    self.clone(),
                    config.status_poll_interval,
                    session.cancel.clone(),
                )));
            }
            handles.push(tokio::spawn(stats_task(self.clone(), session.cancel.clone())));
        }

        let mut zero = self.inner.server_time_zero.subscribe();
        wait_handshake(
            &session,
            addr,
            "the server welcome",
            config.request_timeout,
            zero.wait_for(Option::is_some),
        )
        .await?;
        debug!(%addr, "server welcome received");

        if config.wait_status_on_connect {
            self.request_server_status_update()?;
            let mut status = self.inner.status.subscribe();
            wait_handshake(
                &session,
                addr,
                "the first server status",
                config.status_poll_interval + FIRST_STATUS_GRACE,
                status.wait_for(Option::is_some),
            )
            .await?;
        }
        Ok(())
    }

    /// Disconnect from the server. Idempotent.
    ///
    /// Every handle is invalidated and every pending request or write
    /// fails with [`CoreError::Disconnected`].
    pub async fn disconnect(&self) {
        let _lifecycle = self.inner.lifecycle.lock().await;
        self.shutdown(ConnectionState::Disconnected).await;
    }

    async fn shutdown(&self, final_state: ConnectionState) {
        if let Some(session) = self.inner.session.load_full() {
            self.end_session(&session, final_state.clone());
        }

        let handles: Vec<_> = self.inner.task_handles.lock().await.drain(..).collect();
        for handle in handles {
            if let Err(e) = handle.await {
                if e.is_panic() {
                    warn!(error = %e, "background task panicked");
                }
            }
        }

        self.inner.connection_state.send_if_modified(|state| {
            if *state == final_state {
                false
            } else {
                *state = final_state;
                true
            }
        });
    }

    /// Tear down `session` if it is still the current one.
    ///
    /// Synchronous so the listener can call it when the link fails.
    pub(crate) fn end_session(&self, session: &Arc<Session>, final_state: ConnectionState) {
        let inner = &self.inner;
        session.cancel.cancel();
        session.sender.close();

        let previous = inner.session.compare_and_swap(session, None::<Arc<Session>>);
        if !matches!(&*previous, Some(p) if Arc::ptr_eq(p, session)) {
            return;
        }

        inner.stats.archive(session.sender.counters());
        inner.stats.reset_rates();

        let handles = inner.registry.drain();
        for handle in &handles {
            handle.invalidate(ValueStatus::ServerGone);
        }
        // Dropping the reply senders wakes every waiter with `Disconnected`.
        inner.pending.clear();
        inner.write_trackers.clear();

        let last_status = inner.status.send_replace(None);
        inner.server_time_zero.send_replace(None);
        if let Some(status) = last_status {
            if let Some(firmware_id) = status.loaded_sfd_firmware_id.clone() {
                let _ = inner.event_tx.send(ClientEvent::SfdUnloaded { firmware_id });
            }
            if let Some(session_id) = status.device_session_id.clone() {
                let _ = inner.event_tx.send(ClientEvent::DeviceGone { session_id });
            }
        }
        let _ = inner.event_tx.send(ClientEvent::Disconnected);

        info!(
            peer = %session.sender.peer(),
            invalidated = handles.len(),
            state = ?final_state,
            "session closed"
        );
        inner.connection_state.send_replace(final_state);
    }

    /// Connect, run `f`, then disconnect whatever `f` returned, even if it
    /// panicked.
    pub async fn oneshot<F, Fut, T>(config: ClientConfig, f: F) -> Result<T, CoreError>
    where
        F: FnOnce(Client) -> Fut,
        Fut: Future<Output = Result<T, CoreError>>,
    {
        let client = Client::new(config);
        client.connect().await?;
        let outcome = AssertUnwindSafe(f(client.clone())).catch_unwind().await;
        client.disconnect().await;
        match outcome {
            Ok(result) => result,
            Err(panic) => std::panic::resume_unwind(panic),
        }
    }

    // ── State observation ────────────────────────────────────────────

    pub fn connection_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.connection_state.subscribe()
    }

    pub fn events(&self) -> broadcast::Receiver<ClientEvent> {
        self.inner.event_tx.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.inner.session.load().is_some()
    }

    /// Last status broadcast, without waiting.
    pub fn get_latest_server_status(&self) -> Result<Arc<ServerStatus>, CoreError> {
        self.inner
            .status
            .borrow()
            .clone()
            .ok_or(CoreError::NoServerStatus)
    }

    /// Wait for the next status broadcast.
    pub async fn wait_server_status_update(
        &self,
        timeout: Duration,
    ) -> Result<Arc<ServerStatus>, CoreError> {
        if !self.is_connected() {
            return Err(CoreError::Disconnected);
        }
        let mut rx = self.inner.status.subscribe();
        rx.borrow_and_update();

        let waited = tokio::time::timeout(timeout, async {
            rx.changed().await.map_err(|_| CoreError::Disconnected)?;
            rx.borrow_and_update().clone().ok_or(CoreError::Disconnected)
        })
        .await;

        waited.unwrap_or_else(|_| {
            Err(CoreError::Timeout {
                operation: "a server status update".into(),
                timeout,
            })
        })
    }

    /// Ask the server for a status broadcast out of its normal cadence.
    /// Pair with [`wait_server_status_update`](Self::wait_server_status_update).
    pub fn request_server_status_update(&self) -> Result<(), CoreError> {
        self.send_request(ClientMessage::GetServerStatus, None)
            .map(drop)
    }

    /// Wait until the server reports a ready device.
    pub async fn wait_device_ready(&self, timeout: Duration) -> Result<(), CoreError> {
        let mut rx = self.inner.connection_state.subscribe();
        let waited = tokio::time::timeout(timeout, async {
            rx.wait_for(|s| {
                s.is_device_ready() || !(s.is_connected() || *s == ConnectionState::Connecting)
            })
            .await
            .map(|s| s.is_device_ready())
        })
        .await;

        match waited {
            Err(_) => Err(CoreError::Timeout {
                operation: "the device to be ready".into(),
                timeout,
            }),
            Ok(Ok(true)) => Ok(()),
            Ok(Ok(false) | Err(_)) => Err(CoreError::Disconnected),
        }
    }

    // ── Watchables ───────────────────────────────────────────────────

    /// Subscribe to `path`, waiting for the server to accept it.
    ///
    /// Watching an already watched path returns the existing handle
    /// without contacting the server.
    pub async fn watch(&self, path: &str) -> Result<WatchableHandle, CoreError> {
        let path = WatchablePath::parse(path)?;
        let registry = &self.inner.registry;
        let _watch = registry.watch_lock.lock().await;

        if let Some(handle) = registry.get_by_path(path.as_str()) {
            if !handle.status().is_terminal() {
                return Ok(handle);
            }
            registry.remove(&handle);
        }

        let (reply, rx) = oneshot::channel();
        let body = ClientMessage::SubscribeWatchable {
            watchables: vec![path.as_str().to_owned()],
        };
        let reqid = self.send_request(
            body,
            Some(PendingRequest::Subscribe {
                path,
                reply,
                sent_at: Instant::now(),
            }),
        )?;
        let handle = self.await_reply(reqid, "subscribe_watchable", rx).await?;

        debug!(
            path = %handle.display_path(),
            server_id = %handle.server_id(),
            datatype = %handle.datatype(),
            "watching"
        );
        Ok(handle)
    }

    pub fn try_get_existing_watch_handle(&self, path: &str) -> Option<WatchableHandle> {
        self.inner.registry.get_by_path(path)
    }

    pub fn try_get_existing_watch_handle_by_server_id(
        &self,
        server_id: &str,
    ) -> Option<WatchableHandle> {
        self.inner.registry.get_by_server_id(server_id)
    }

    /// Every handle currently watched.
    pub fn watched_handles(&self) -> Vec<WatchableHandle> {
        self.inner.registry.handles()
    }

    /// Stop watching. The handle's value becomes unreadable immediately.
    pub async fn unwatch(&self, handle: &WatchableHandle) -> Result<(), CoreError> {
        let registry = &self.inner.registry;
        let _watch = registry.watch_lock.lock().await;

        let removed = registry.remove(handle);
        handle.invalidate(ValueStatus::NotWatched);
        if !removed {
            return Ok(());
        }

        let body = ClientMessage::UnsubscribeWatchable {
            watchables: vec![handle.display_path().to_owned()],
        };
        match self.request(body).await {
            Ok(ServerBody::UnsubscribeWatchable { .. }) | Err(CoreError::Disconnected) => {
                debug!(path = %handle.display_path(), "unwatched");
                Ok(())
            }
            Ok(other) => Err(unexpected("response_unsubscribe_watchable", &other)),
            Err(e) => Err(e),
        }
    }

    /// Wait until every handle watched at call time received an update
    /// after the call. Handles watched later are ignored.
    pub async fn wait_new_value_for_all(&self, timeout: Duration) -> Result<(), CoreError> {
        let deadline = Instant::now() + timeout;
        let targets: Vec<(WatchableHandle, u64)> = self
            .inner
            .registry
            .handles()
            .into_iter()
            .map(|h| {
                let counter = h.update_counter();
                (h, counter)
            })
            .collect();

        for (handle, counter) in targets {
            let remaining = deadline.saturating_duration_since(Instant::now());
            handle.wait_update_since(counter, remaining).await?;
        }
        Ok(())
    }

    // ── Server requests ──────────────────────────────────────────────

    /// Change how the server talks to the device.
    pub async fn configure_device_link(&self, link: &DeviceLinkConfig) -> Result<(), CoreError> {
        link.validate()?;
        let (link_type, link_config) = link.to_wire()?;
        let body = ClientMessage::SetLinkConfig {
            link_type: link_type.to_owned(),
            link_config,
        };
        match self.request(body).await? {
            ServerBody::SetLinkConfig => {
                info!(link_type, "device link configured");
                Ok(())
            }
            other => Err(unexpected("response_set_link_config", &other)),
        }
    }

    pub async fn get_server_stats(&self) -> Result<ServerStatistics, CoreError> {
        match self.request(ClientMessage::GetServerStats).await? {
            ServerBody::ServerStats(stats) => Ok(convert::server_statistics(&stats)),
            other => Err(unexpected("response_get_server_stats", &other)),
        }
    }

    pub async fn get_watchable_count(&self) -> Result<WatchableCount, CoreError> {
        match self.request(ClientMessage::GetWatchableCount).await? {
            ServerBody::WatchableCount { qty } => Ok(convert::watchable_count(qty)),
            other => Err(unexpected("response_get_watchable_count", &other)),
        }
    }

    /// Download the watchables the server can serve, matching `filter`.
    ///
    /// The server answers in segments of at most `max_per_response`
    /// entries. Each segment must arrive within the request timeout.
    pub async fn download_watchable_list(
        &self,
        filter: &WatchableListFilter,
    ) -> Result<WatchableList, CoreError> {
        if filter.max_per_response == 0 {
            return Err(CoreError::Validation {
                message: "max_per_response must be at least 1".into(),
            });
        }
        let body = ClientMessage::GetWatchableList {
            max_per_response: filter.max_per_response,
            filter: protocol::WatchableListFilter {
                types: filter.types.iter().map(ToString::to_string).collect(),
                names: filter.name_patterns.clone(),
            },
        };
        let (segments, rx) = mpsc::unbounded_channel();
        let reqid = self.send_request(
            body,
            Some(PendingRequest::Segments {
                segments,
                sent_at: Instant::now(),
            }),
        )?;

        let result = self.collect_list_segments(rx).await;
        if result.is_err() {
            self.inner.pending.remove(&reqid);
        }
        let list = result?;
        debug!(
            rpv = list.rpv.len(),
            alias = list.alias.len(),
            var = list.var.len(),
            "watchable list downloaded"
        );
        Ok(list)
    }

    async fn collect_list_segments(
        &self,
        mut rx: mpsc::UnboundedReceiver<Result<ServerBody, CoreError>>,
    ) -> Result<WatchableList, CoreError> {
        let timeout = self.inner.config.request_timeout;
        let mut list = WatchableList::default();
        loop {
            let segment = match tokio::time::timeout(timeout, rx.recv()).await {
                Ok(Some(segment)) => segment?,
                Ok(None) => return Err(CoreError::Disconnected),
                Err(_) => {
                    return Err(CoreError::Timeout {
                        operation: "the next segment of get_watchable_list".into(),
                        timeout,
                    });
                }
            };
            let part = match segment {
                ServerBody::WatchableList(part) => part,
                other => return Err(unexpected("response_get_watchable_list", &other)),
            };
            convert::watchable_list_segment(part.content, &mut list)?;
            trace!(received = list.len(), done = part.done, "watchable list segment");
            if part.done {
                return Ok(list);
            }
        }
    }

    /// Firmware descriptions installed on the server, by firmware id.
    pub async fn get_installed_sfds(&self) -> Result<BTreeMap<String, SfdInfo>, CoreError> {
        match self.request(ClientMessage::GetInstalledSfd).await? {
            ServerBody::InstalledSfd { sfd_list } => sfd_list
                .into_iter()
                .map(|msg| convert::sfd_info(msg).map(|sfd| (sfd.firmware_id.clone(), sfd)))
                .collect(),
            other => Err(unexpected("response_get_installed_sfd", &other)),
        }
    }

    /// The firmware description matching the connected device, if any.
    pub async fn get_loaded_sfd(&self) -> Result<Option<SfdInfo>, CoreError> {
        match self.request(ClientMessage::GetLoadedSfd).await? {
            ServerBody::LoadedSfd { sfd } => sfd.map(convert::sfd_info).transpose(),
            other => Err(unexpected("response_get_loaded_sfd", &other)),
        }
    }

    /// Parameters of the connected device. `None` while no device is ready.
    pub async fn get_device_info(&self) -> Result<Option<DeviceInfo>, CoreError> {
        match self.request(ClientMessage::GetDeviceInfo).await? {
            ServerBody::DeviceInfo {
                available: false,
                device_info: None,
            } => Ok(None),
            ServerBody::DeviceInfo {
                available: true,
                device_info: Some(info),
            } => convert::device_info(info).map(Some),
            ServerBody::DeviceInfo { available, .. } => Err(CoreError::protocol(format!(
                "device info availability ({available}) contradicts its content"
            ))),
            other => Err(unexpected("response_get_device_info", &other)),
        }
    }

    /// Traffic totals and rates measured by this client. Never blocks.
    pub fn get_local_stats(&self) -> LocalStatistics {
        let live = self.inner.session.load_full().map(|s| s.sender.counters());
        self.inner.stats.snapshot(live)
    }

    /// Restart rate and latency measurement. Totals keep counting.
    pub fn reset_local_stats(&self) {
        let live = self.inner.session.load_full().map(|s| s.sender.counters());
        self.inner.stats.reset(live);
        debug!("local statistics reset");
    }

    // ── Request plumbing ─────────────────────────────────────────────

    /// Send `body` with a fresh `reqid`, registering `pending` first so
    /// the reply cannot outrun it.
    pub(crate) fn send_request(
        &self,
        body: ClientMessage,
        pending: Option<PendingRequest>,
    ) -> Result<u32, CoreError> {
        let session = self.inner.session.load_full().ok_or(CoreError::Disconnected)?;
        let reqid = self.inner.next_reqid.fetch_add(1, Ordering::Relaxed);
        let cmd = body.cmd();

        if let Some(pending) = pending {
            self.inner.pending.insert(reqid, pending);
        }
        if let Err(e) = session.sender.send_json(&Request { reqid, body }) {
            self.inner.pending.remove(&reqid);
            return Err(e.into());
        }
        trace!(reqid, cmd, "request sent");
        Ok(reqid)
    }

    pub(crate) async fn request(&self, body: ClientMessage) -> Result<ServerBody, CoreError> {
        let cmd = body.cmd();
        let (reply, rx) = oneshot::channel();
        let reqid = self.send_request(
            body,
            Some(PendingRequest::Response {
                reply,
                sent_at: Instant::now(),
            }),
        )?;
        self.await_reply(reqid, cmd, rx).await
    }

    async fn await_reply<T>(
        &self,
        reqid: u32,
        cmd: &str,
        rx: oneshot::Receiver<Result<T, CoreError>>,
    ) -> Result<T, CoreError> {
        let timeout = self.inner.config.request_timeout;
        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(CoreError::Disconnected),
            Err(_) => {
                self.inner.pending.remove(&reqid);
                Err(CoreError::Timeout {
                    operation: format!("the response to {cmd}"),
                    timeout,
                })
            }
        }
    }
}

// ── Background tasks ─────────────────────────────────────────────────

/// Wait for one connect handshake step, failing early if the link drops.
async fn wait_handshake<F, T>(
    session: &Session,
    addr: &str,
    operation: &str,
    timeout: Duration,
    step: F,
) -> Result<(), CoreError>
where
    F: Future<Output = Result<T, watch::error::RecvError>>,
{
    let lost = || CoreError::Connection {
        addr: addr.to_owned(),
        reason: "server closed the connection during the handshake".into(),
    };
    let waited = tokio::time::timeout(timeout, async {
        tokio::select! {
            biased;
            () = session.cancel.cancelled() => Err(lost()),
            reached = step => reached.map(drop).map_err(|_| lost()),
        }
    })
    .await;

    waited.unwrap_or_else(|_| {
        Err(CoreError::Timeout {
            operation: operation.to_owned(),
            timeout,
        })
    })
}

/// Ask for a status broadcast every `interval`.
async fn status_poll_task(client: Client, interval: Duration, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            _ = ticker.tick() => {
                if let Err(e) = client.request_server_status_update() {
                    debug!(error = %e, "status poll skipped");
                }
            }
        }
    }
}

/// Close a rate window every second.
async fn stats_task(client: Client, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(STATS_WINDOW);
    ticker.tick().await;

    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => break,
            _ = ticker.tick() => {
                let live = client.inner.session.load_full().map(|s| s.sender.counters());
                client.inner.stats.tick(live);
            }
        }
    }
}
