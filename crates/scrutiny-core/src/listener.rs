// ── Background update listener ──
//
// Owns the receive side of the link for one session. Every server message
// is decoded and routed here, in arrival order: value updates to handles,
// status broadcasts to the status cell, replies to the waiting request,
// write completions to the batch waiting on them. It is the only writer of
// handle and status state.

use std::sync::Arc;

use chrono::Utc;
use scrutiny_api::LinkReceiver;
use scrutiny_api::protocol::{
    ServerBody, ServerMessage, ServerStatusMessage, WatchableUpdateRecord, WriteCompletion,
};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::client::{Client, Session};
use crate::convert;
use crate::error::CoreError;
use crate::handle::WatchableHandle;
use crate::model::{
    ClientEvent, ConnectionState, DeviceLinkState, ValueStatus, WatchablePath, WatchableValue,
};

/// A request waiting for its reply, keyed by `reqid`.
pub(crate) enum PendingRequest {
    /// Plain request/response.
    Response {
        reply: oneshot::Sender<Result<ServerBody, CoreError>>,
        sent_at: Instant,
    },
    /// `subscribe_watchable`: the listener registers the handle before any
    /// update for it can be routed.
    Subscribe {
        path: WatchablePath,
        reply: oneshot::Sender<Result<WatchableHandle, CoreError>>,
        sent_at: Instant,
    },
    /// `write_watchable`: the listener binds the completion channel to the
    /// request token before any completion can arrive.
    Write {
        completions: mpsc::UnboundedSender<WriteCompletion>,
        reply: oneshot::Sender<Result<WriteAck, CoreError>>,
        sent_at: Instant,
    },
    /// A request answered by several messages sharing its `reqid`. Stays
    /// registered until the segment flagged `done`, an error, or the
    /// receiver going away.
    Segments {
        segments: mpsc::UnboundedSender<Result<ServerBody, CoreError>>,
        sent_at: Instant,
    },
}

impl PendingRequest {
    fn sent_at(&self) -> Instant {
        match self {
            Self::Response { sent_at, .. }
            | Self::Subscribe { sent_at, .. }
            | Self::Write { sent_at, .. }
            | Self::Segments { sent_at, .. } => *sent_at,
        }
    }
}

/// Server acknowledgment of a `write_watchable` request.
#[derive(Debug)]
pub(crate) struct WriteAck {
    pub(crate) count: u32,
    pub(crate) request_token: String,
}

// ── Task ─────────────────────────────────────────────────────────────

pub(crate) async fn listener_task(
    client: Client,
    mut receiver: LinkReceiver,
    session: Arc<Session>,
) {
    let cancel = session.cancel.clone();

    let failure = loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => return,
            payload = receiver.recv() => match payload {
                Ok(bytes) => match ServerMessage::parse(&bytes) {
                    Ok(msg) => dispatch(&client, msg),
                    Err(e) => warn!(error = %e, "dropping malformed server message"),
                },
                Err(e) => break e,
            }
        }
    };

    warn!(error = %failure, "link to server lost");
    client.end_session(
        &session,
        ConnectionState::Error {
            reason: failure.to_string(),
        },
    );
}

fn dispatch(client: &Client, msg: ServerMessage) {
    let ServerMessage { reqid, body } = msg;
    match body {
        ServerBody::Welcome {
            server_time_zero_timestamp,
        } => on_welcome(client, server_time_zero_timestamp),
        ServerBody::ServerStatus(status) => on_server_status(client, status),
        ServerBody::WatchableUpdate { updates } => on_watchable_update(client, &updates),
        ServerBody::WriteCompletion(completion) => on_write_completion(client, completion),
        ServerBody::Other => debug!(?reqid, "ignoring unhandled server message"),
        body => resolve_pending(client, reqid, body),
    }
}

// ── Pushed messages ──────────────────────────────────────────────────

fn on_welcome(client: &Client, server_time_zero: f64) {
    let inner = &client.inner;
    debug!(server_time_zero, "server welcome");
    inner.server_time_zero.send_replace(Some(server_time_zero));
    inner.connection_state.send_if_modified(|state| {
        if *state == ConnectionState::Connecting {
            *state = ConnectionState::Connected(DeviceLinkState::NoDevice);
            true
        } else {
            false
        }
    });
}

fn on_server_status(client: &Client, msg: ServerStatusMessage) {
    let inner = &client.inner;
    let status = convert::server_status(msg, Utc::now());
    let previous = inner.status.borrow().clone();

    let previous_session = previous.as_ref().and_then(|s| s.device_session_id.clone());
    if previous_session != status.device_session_id {
        if let Some(session_id) = previous_session {
            let gone = inner.registry.drain();
            info!(%session_id, invalidated = gone.len(), "device session ended");
            for handle in gone {
                handle.invalidate(ValueStatus::DeviceGone);
            }
            let _ = inner.event_tx.send(ClientEvent::DeviceGone { session_id });
        }
        if let Some(session_id) = status.device_session_id.clone() {
            info!(%session_id, "device session started");
            let _ = inner.event_tx.send(ClientEvent::DeviceReady { session_id });
        }
    }

    let previous_sfd = previous.as_ref().and_then(|s| s.loaded_sfd_firmware_id.clone());
    if previous_sfd != status.loaded_sfd_firmware_id {
        if let Some(firmware_id) = previous_sfd {
            let gone = inner.registry.drain_where(|h| h.watchable_type().needs_sfd());
            info!(%firmware_id, invalidated = gone.len(), "firmware description unloaded");
            for handle in gone {
                handle.invalidate(ValueStatus::SfdUnloaded);
            }
            let _ = inner.event_tx.send(ClientEvent::SfdUnloaded { firmware_id });
        }
        if let Some(firmware_id) = status.loaded_sfd_firmware_id.clone() {
            info!(%firmware_id, "firmware description loaded");
            let _ = inner.event_tx.send(ClientEvent::SfdLoaded { firmware_id });
        }
    }

    // State first: a caller woken by the new status sees the matching state.
    let link_state = status.device_link_state();
    inner.connection_state.send_if_modified(|state| match state {
        ConnectionState::Connected(current) if *current != link_state => {
            debug!(from = %current, to = %link_state, "device link state changed");
            *state = ConnectionState::Connected(link_state);
            true
        }
        _ => false,
    });
    inner.status.send_replace(Some(Arc::new(status)));
    let _ = inner.event_tx.send(ClientEvent::StatusUpdated);
}

fn on_watchable_update(client: &Client, updates: &[WatchableUpdateRecord]) {
    let inner = &client.inner;
    let zero = *inner.server_time_zero.borrow();
    for update in updates {
        let Some(handle) = inner.registry.get_by_server_id(&update.id) else {
            trace!(server_id = %update.id, "update for an unwatched id");
            continue;
        };
        match WatchableValue::from_wire(&update.v, handle.datatype()) {
            Some(value) => {
                handle.apply_update(value, convert::server_time(zero, update.t));
            }
            None => warn!(
                path = %handle.display_path(),
                datatype = %handle.datatype(),
                value = ?update.v,
                "value does not fit the watchable's datatype"
            ),
        }
    }
}

fn on_write_completion(client: &Client, completion: WriteCompletion) {
    let trackers = &client.inner.write_trackers;
    match trackers.get(&completion.request_token) {
        Some(tx) => {
            let _ = tx.send(completion);
        }
        None => debug!(token = %completion.request_token, "completion for an unknown write"),
    }
}

// ── Replies ──────────────────────────────────────────────────────────

fn resolve_pending(client: &Client, reqid: Option<u32>, body: ServerBody) {
    let inner = &client.inner;
    let body = match reqid {
        Some(id) => match forward_segment(client, id, body) {
            Ok(()) => return,
            Err(body) => body,
        },
        None => body,
    };
    let Some((_, pending)) = reqid.and_then(|id| inner.pending.remove(&id)) else {
        match body {
            ServerBody::Error { request_cmd, msg } => {
                warn!(%request_cmd, %msg, ?reqid, "server error for an unknown request");
            }
            _ => debug!(?reqid, "reply to an unknown or expired request"),
        }
        return;
    };
    inner.stats.record_latency(pending.sent_at().elapsed());

    match pending {
        // Handled by `forward_segment`, only reachable if the entry was
        // swapped in between the two lookups.
        PendingRequest::Segments { segments, .. } => {
            let _ = segments.send(Ok(body));
        }
        PendingRequest::Response { reply, .. } => {
            let result = match body {
                ServerBody::Error { msg, .. } => Err(CoreError::Rejected { message: msg }),
                body => Ok(body),
            };
            let _ = reply.send(result);
        }
        PendingRequest::Subscribe { path, reply, .. } => {
            let result = subscribed_handle(client, path, body);
            let _ = reply.send(result);
        }
        PendingRequest::Write {
            completions,
            reply,
            ..
        } => {
            let result = match body {
                ServerBody::WriteWatchable {
                    count,
                    request_token,
                } => {
                    // Closed when the writer already gave up waiting.
                    if !completions.is_closed() {
                        inner.write_trackers.insert(request_token.clone(), completions);
                    }
                    Ok(WriteAck {
                        count,
                        request_token,
                    })
                }
                ServerBody::Error { msg, .. } => Err(CoreError::Rejected { message: msg }),
                other => Err(unexpected("response_write_watchable", &other)),
            };
            let token = result.as_ref().ok().map(|ack| ack.request_token.clone());
            if reply.send(result).is_err() {
                // The writer timed out between our lookup and this reply.
                if let Some(token) = token {
                    inner.write_trackers.remove(&token);
                }
            }
        }
    }
}

/// Route one segment of a multi-message reply. Gives `body` back when
/// `reqid` is not such a request.
fn forward_segment(client: &Client, reqid: u32, body: ServerBody) -> Result<(), ServerBody> {
    let inner = &client.inner;
    let Some(entry) = inner.pending.get(&reqid) else {
        return Err(body);
    };
    let PendingRequest::Segments { segments, sent_at } = entry.value() else {
        return Err(body);
    };

    let last = !matches!(&body, ServerBody::WatchableList(list) if !list.done);
    let sent_at = *sent_at;
    let result = match body {
        ServerBody::Error { msg, .. } => Err(CoreError::Rejected { message: msg }),
        body => Ok(body),
    };
    let delivered = segments.send(result).is_ok();
    drop(entry);

    if last {
        inner.stats.record_latency(sent_at.elapsed());
    }
    if last || !delivered {
        trace!(reqid, delivered, "multi-message request finished");
        inner.pending.remove(&reqid);
    }
    Ok(())
}

fn subscribed_handle(
    client: &Client,
    path: WatchablePath,
    body: ServerBody,
) -> Result<WatchableHandle, CoreError> {
    let subscribed = match body {
        ServerBody::SubscribeWatchable { subscribed } => subscribed,
        ServerBody::Error { msg, .. } => {
            return Err(CoreError::InvalidPath {
                path: path.to_string(),
                reason: msg,
            });
        }
        other => return Err(unexpected("response_subscribe_watchable", &other)),
    };

    let definition = subscribed
        .get(path.as_str())
        .ok_or_else(|| CoreError::protocol(format!("server did not confirm {path}")))?;
    let config = convert::watchable_configuration(definition)?;
    if config.watchable_type != path.watchable_type() {
        return Err(CoreError::protocol(format!(
            "server reports {path} as {}",
            config.watchable_type
        )));
    }

    let handle = WatchableHandle::new(path, config, Arc::downgrade(&client.inner));
    client.inner.registry.insert(handle.clone());
    Ok(handle)
}

pub(crate) fn unexpected(expected: &str, got: &ServerBody) -> CoreError {
    let got = serde_json::to_value(got)
        .ok()
        .and_then(|v| v.get("cmd").and_then(|c| c.as_str()).map(str::to_owned))
        .unwrap_or_else(|| "unknown".into());
    CoreError::protocol(format!("expected {expected}, got {got}"))
}
