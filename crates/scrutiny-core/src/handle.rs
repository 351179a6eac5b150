// ── Watchable handles ──
//
// One handle per watched path, shared by every caller that watched it.
// All mutable state sits in a single `watch` cell so value, status, counter
// and timestamps always change together. The background listener is the
// only writer; callers read snapshots or await changes.

use std::fmt;
use std::pin::Pin;
use std::sync::{Arc, Mutex, Weak};
use std::task::{Context, Poll};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures_core::Stream;
use tokio::sync::{broadcast, watch};
use tokio::time::Instant;
use tokio_stream::wrappers::BroadcastStream;

use crate::client::{Client, ClientInner};
use crate::error::CoreError;
use crate::model::{
    Datatype, DatatypeKind, EnumDefinition, ValueStatus, WatchableConfiguration, WatchablePath,
    WatchableType, WatchableValue, WriteValue,
};

const VALUE_CHANNEL_SIZE: usize = 256;

/// Point-in-time view of a handle.
#[derive(Debug, Clone, PartialEq)]
pub struct HandleSnapshot {
    pub value: Option<WatchableValue>,
    pub status: ValueStatus,
    /// Incremented on every value update, starting at 0.
    pub update_counter: u64,
    pub last_update_timestamp: Option<DateTime<Utc>>,
    pub last_write_timestamp: Option<DateTime<Utc>>,
}

/// A subscribed watchable.
///
/// Cheaply cloneable; clones share state. Two handles are equal only if
/// they are the same subscription.
#[derive(Clone)]
pub struct WatchableHandle {
    inner: Arc<HandleInner>,
}

struct HandleInner {
    path: WatchablePath,
    config: WatchableConfiguration,
    state: watch::Sender<HandleSnapshot>,
    /// Taken on invalidation, which ends every value stream.
    updates: Mutex<Option<broadcast::Sender<WatchableValue>>>,
    client: Weak<ClientInner>,
}

impl WatchableHandle {
    pub(crate) fn new(
        path: WatchablePath,
        config: WatchableConfiguration,
        client: Weak<ClientInner>,
    ) -> Self {
        let (state, _) = watch::channel(HandleSnapshot {
            value: None,
            status: ValueStatus::NeverSet,
            update_counter: 0,
            last_update_timestamp: None,
            last_write_timestamp: None,
        });
        let (updates, _) = broadcast::channel(VALUE_CHANNEL_SIZE);
        Self {
            inner: Arc::new(HandleInner {
                path,
                config,
                state,
                updates: Mutex::new(Some(updates)),
                client,
            }),
        }
    }

    // ── Identity ─────────────────────────────────────────────────────

    pub fn display_path(&self) -> &str {
        self.inner.path.as_str()
    }

    pub fn path(&self) -> &WatchablePath {
        &self.inner.path
    }

    pub fn name(&self) -> &str {
        self.inner.path.name()
    }

    pub fn watchable_type(&self) -> WatchableType {
        self.inner.config.watchable_type
    }

    pub fn datatype(&self) -> Datatype {
        self.inner.config.datatype
    }

    pub fn server_id(&self) -> &str {
        &self.inner.config.server_id
    }

    pub fn enum_definition(&self) -> Option<&EnumDefinition> {
        self.inner.config.enum_def.as_ref()
    }

    /// `true` if both handles are the same subscription.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    // ── State ────────────────────────────────────────────────────────

    pub fn snapshot(&self) -> HandleSnapshot {
        self.inner.state.borrow().clone()
    }

    pub fn status(&self) -> ValueStatus {
        self.inner.state.borrow().status
    }

    pub fn update_counter(&self) -> u64 {
        self.inner.state.borrow().update_counter
    }

    pub fn last_update_timestamp(&self) -> Option<DateTime<Utc>> {
        self.inner.state.borrow().last_update_timestamp
    }

    pub fn last_write_timestamp(&self) -> Option<DateTime<Utc>> {
        self.inner.state.borrow().last_write_timestamp
    }

    /// The latest value. Fails until the first update arrives and after
    /// the handle is invalidated.
    pub fn value(&self) -> Result<WatchableValue, CoreError> {
        let state = self.inner.state.borrow();
        match (state.status, state.value) {
            (ValueStatus::Valid, Some(value)) => Ok(value),
            (status, _) => Err(self.status_error(status)),
        }
    }

    pub fn value_bool(&self) -> Result<bool, CoreError> {
        self.expect_kind(&[DatatypeKind::Bool], "bool")?;
        self.value()?
            .as_bool()
            .ok_or_else(|| self.mismatch("bool"))
    }

    pub fn value_i64(&self) -> Result<i64, CoreError> {
        self.expect_kind(&[DatatypeKind::Signed, DatatypeKind::Unsigned], "i64")?;
        self.value()?.as_i64().ok_or_else(|| self.mismatch("i64"))
    }

    pub fn value_u64(&self) -> Result<u64, CoreError> {
        self.expect_kind(&[DatatypeKind::Signed, DatatypeKind::Unsigned], "u64")?;
        self.value()?.as_u64().ok_or_else(|| self.mismatch("u64"))
    }

    pub fn value_f64(&self) -> Result<f64, CoreError> {
        self.expect_kind(
            &[DatatypeKind::Float, DatatypeKind::Signed, DatatypeKind::Unsigned],
            "f64",
        )?;
        self.value()?.as_f64().ok_or_else(|| self.mismatch("f64"))
    }

    /// Name of the current value in the watchable's enum.
    pub fn value_enum(&self) -> Result<String, CoreError> {
        let def = self.enum_definition().ok_or_else(|| self.mismatch("enum"))?;
        let raw = self.value_i64()?;
        def.name_of(raw)
            .map(str::to_owned)
            .ok_or_else(|| CoreError::Validation {
                message: format!("{raw} is not a value of enum {}", def.name),
            })
    }

    /// Integer value of `name` in the watchable's enum.
    pub fn parse_enum(&self, name: &str) -> Result<i64, CoreError> {
        let def = self.enum_definition().ok_or_else(|| self.mismatch("enum"))?;
        def.value_of(name).ok_or_else(|| CoreError::Validation {
            message: format!("{name} is not a member of enum {}", def.name),
        })
    }

    // ── Waiting ──────────────────────────────────────────────────────

    /// Wait for the next update. Returns the new update counter.
    pub async fn wait_update(&self, timeout: Duration) -> Result<u64, CoreError> {
        let since = self.update_counter();
        self.wait_update_since(since, timeout).await
    }

    /// Wait until the update counter exceeds `counter`.
    pub async fn wait_update_since(
        &self,
        counter: u64,
        timeout: Duration,
    ) -> Result<u64, CoreError> {
        let mut rx = self.inner.state.subscribe();
        let waited = tokio::time::timeout(timeout, async {
            rx.wait_for(|s| s.status.is_terminal() || s.update_counter > counter)
                .await
                .map(|s| (s.status, s.update_counter))
        })
        .await;

        match waited {
            Err(_) => Err(self.timeout_error(timeout)),
            Ok(Err(_)) => Err(CoreError::Disconnected),
            Ok(Ok((status, _))) if status.is_terminal() => Err(self.status_error(status)),
            Ok(Ok((_, counter))) => Ok(counter),
        }
    }

    /// Wait until a value satisfying `predicate` is received.
    ///
    /// The current value is checked first, then every update in arrival
    /// order, so a matching value is never skipped even when several
    /// updates land before this task is scheduled.
    pub async fn wait_value<F>(
        &self,
        predicate: F,
        timeout: Duration,
    ) -> Result<WatchableValue, CoreError>
    where
        F: Fn(&WatchableValue) -> bool,
    {
        let deadline = Instant::now() + timeout;
        let mut values = self.value_receiver();
        let mut state = self.inner.state.subscribe();

        {
            let current = state.borrow_and_update();
            if current.status.is_terminal() {
                return Err(self.status_error(current.status));
            }
            if let Some(value) = current.value.filter(|v| predicate(v)) {
                return Ok(value);
            }
        }

        loop {
            tokio::select! {
                biased;
                received = values.recv() => match received {
                    Ok(value) if predicate(&value) => return Ok(value),
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::debug!(
                            path = %self.display_path(),
                            skipped,
                            "value waiter lagged"
                        );
                        if let Some(value) = self.value().ok().filter(|v| predicate(v)) {
                            return Ok(value);
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        return Err(self.status_error(self.status()));
                    }
                },
                changed = state.changed() => {
                    if changed.is_err() {
                        return Err(CoreError::Disconnected);
                    }
                    let status = state.borrow_and_update().status;
                    if status.is_terminal() {
                        return Err(self.status_error(status));
                    }
                }
                () = tokio::time::sleep_until(deadline) => {
                    return Err(self.timeout_error(timeout));
                }
            }
        }
    }

    /// Stream of every value received from now on. Ends when the handle
    /// is invalidated.
    pub fn subscribe(&self) -> ValueStream {
        ValueStream {
            inner: BroadcastStream::new(self.value_receiver()),
        }
    }

    // ── Writing ──────────────────────────────────────────────────────

    /// Write one value and wait for the device to confirm it.
    pub async fn write(&self, value: impl Into<WriteValue>) -> Result<(), CoreError> {
        self.client()?.write_single(self, value.into()).await
    }

    /// Write an enum member by name.
    pub async fn write_enum(&self, name: &str) -> Result<(), CoreError> {
        let value = self.parse_enum(name)?;
        self.write(value).await
    }

    /// Stop watching. Same as [`Client::unwatch`].
    pub async fn unwatch(&self) -> Result<(), CoreError> {
        match self.client() {
            Ok(client) => client.unwatch(self).await,
            Err(_) => {
                self.invalidate(ValueStatus::NotWatched);
                Ok(())
            }
        }
    }

    // ── Listener side ────────────────────────────────────────────────

    /// Apply a value from the server. Ignored once invalidated.
    pub(crate) fn apply_update(&self, value: WatchableValue, timestamp: DateTime<Utc>) -> bool {
        let Ok(updates) = self.inner.updates.lock() else {
            return false;
        };
        let applied = self.inner.state.send_if_modified(|s| {
            if s.status.is_terminal() {
                return false;
            }
            s.value = Some(value);
            s.status = ValueStatus::Valid;
            s.update_counter += 1;
            s.last_update_timestamp = Some(timestamp);
            true
        });
        if applied {
            if let Some(tx) = updates.as_ref() {
                let _ = tx.send(value);
            }
        }
        applied
    }

    pub(crate) fn mark_written(&self, timestamp: DateTime<Utc>) {
        self.inner.state.send_modify(|s| s.last_write_timestamp = Some(timestamp));
    }

    /// Make the value unreadable for good and release every waiter.
    pub(crate) fn invalidate(&self, status: ValueStatus) {
        let mut updates = match self.inner.updates.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        updates.take();
        self.inner.state.send_modify(|s| {
            s.status = status;
            s.value = None;
        });
    }

    /// Fails if writes to this handle can no longer be sent.
    pub(crate) fn check_writable(&self) -> Result<(), CoreError> {
        let status = self.status();
        if status.is_terminal() {
            return Err(self.status_error(status));
        }
        Ok(())
    }

    /// `true` if this handle was created by `client`.
    pub(crate) fn is_owned_by(&self, client: &Client) -> bool {
        std::ptr::eq(self.inner.client.as_ptr(), Arc::as_ptr(&client.inner))
    }

    // ── Helpers ──────────────────────────────────────────────────────

    fn client(&self) -> Result<Client, CoreError> {
        self.inner
            .client
            .upgrade()
            .map(Client::from_inner)
            .ok_or(CoreError::Disconnected)
    }

    fn value_receiver(&self) -> broadcast::Receiver<WatchableValue> {
        let updates = match self.inner.updates.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        match updates.as_ref() {
            Some(tx) => tx.subscribe(),
            None => broadcast::channel(1).1,
        }
    }

    fn status_error(&self, status: ValueStatus) -> CoreError {
        let path = self.display_path().to_owned();
        match status {
            ValueStatus::ServerGone => CoreError::Disconnected,
            ValueStatus::NotWatched => CoreError::Unwatched { path },
            status => CoreError::InvalidValue { path, status },
        }
    }

    fn timeout_error(&self, timeout: Duration) -> CoreError {
        CoreError::Timeout {
            operation: format!("an update of {}", self.display_path()),
            timeout,
        }
    }

    fn mismatch(&self, expected: &'static str) -> CoreError {
        CoreError::TypeMismatch {
            path: self.display_path().to_owned(),
            expected,
            datatype: self.datatype(),
        }
    }

    fn expect_kind(&self, kinds: &[DatatypeKind], expected: &'static str) -> Result<(), CoreError> {
        if kinds.contains(&self.datatype().kind()) {
            Ok(())
        } else {
            Err(self.mismatch(expected))
        }
    }
}

impl PartialEq for WatchableHandle {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other)
    }
}

impl Eq for WatchableHandle {}

impl fmt::Debug for WatchableHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WatchableHandle")
            .field("path", &self.display_path())
            .field("server_id", &self.server_id())
            .field("datatype", &self.datatype())
            .field("status", &self.status())
            .finish_non_exhaustive()
    }
}

// ── ValueStream ──────────────────────────────────────────────────────

/// `Stream` of values received by one handle.
///
/// Values are dropped rather than buffered without bound when the consumer
/// falls behind.
pub struct ValueStream {
    inner: BroadcastStream<WatchableValue>,
}

impl Stream for ValueStream {
    type Item = WatchableValue;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        loop {
            match std::task::ready!(Pin::new(&mut self.inner).poll_next(cx)) {
                Some(Ok(value)) => return Poll::Ready(Some(value)),
                Some(Err(_lagged)) => {}
                None => return Poll::Ready(None),
            }
        }
    }
}
