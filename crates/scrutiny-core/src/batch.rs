// ── Batch write coordinator ──
//
// A batch collects writes in call order and submits them as one
// `write_watchable` request. The server applies entries one at a time, in
// order, and confirms each with an `inform_write_completion` carrying its
// batch index. A direct handle write is a batch of one.

use std::time::Duration;

use scrutiny_api::WireValue;
use scrutiny_api::protocol::{ClientMessage, UpdateRecord, WriteCompletion};
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::client::Client;
use crate::convert;
use crate::error::CoreError;
use crate::handle::WatchableHandle;
use crate::listener::{PendingRequest, WriteAck};
use crate::model::WriteValue;

/// Most entries a single batch may carry.
pub const MAX_BATCH_SIZE: usize = 500;

pub(crate) struct BatchEntry {
    handle: WatchableHandle,
    value: WireValue,
}

/// An open write transaction.
///
/// Writes are buffered until [`commit`](Self::commit). Dropping the batch
/// without committing discards it.
pub struct BatchWrite {
    client: Client,
    entries: Vec<BatchEntry>,
    timeout: Duration,
}

impl BatchWrite {
    /// Append a write. Several writes to the same handle are all applied,
    /// in order.
    pub fn write(
        &mut self,
        handle: &WatchableHandle,
        value: impl Into<WriteValue>,
    ) -> Result<(), CoreError> {
        if !handle.is_owned_by(&self.client) {
            return Err(CoreError::Validation {
                message: format!("{} is not watched by this client", handle.display_path()),
            });
        }
        handle.check_writable()?;
        if self.entries.len() >= MAX_BATCH_SIZE {
            return Err(CoreError::Validation {
                message: format!("a batch holds at most {MAX_BATCH_SIZE} writes"),
            });
        }
        self.entries.push(BatchEntry {
            handle: handle.clone(),
            value: value.into().into_wire(),
        });
        Ok(())
    }

    /// Append a write of an enum member, by name.
    pub fn write_enum(&mut self, handle: &WatchableHandle, name: &str) -> Result<(), CoreError> {
        let value = handle.parse_enum(name)?;
        self.write(handle, value)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Send every buffered write and wait until the device confirmed all
    /// of them, or one failed.
    pub async fn commit(mut self) -> Result<(), CoreError> {
        let entries = std::mem::take(&mut self.entries);
        debug!(count = entries.len(), timeout = ?self.timeout, "committing batch write");
        self.client.submit_writes(&entries, self.timeout).await
    }

    /// Drop every buffered write without sending anything.
    pub fn discard(mut self) {
        let count = self.entries.len();
        self.entries.clear();
        debug!(count, "batch write discarded");
    }
}

impl Drop for BatchWrite {
    fn drop(&mut self) {
        if !self.entries.is_empty() {
            debug!(count = self.entries.len(), "uncommitted batch write dropped");
        }
    }
}

impl Client {
    /// Open a batch bounded by the configured write timeout.
    pub fn begin_batch(&self) -> BatchWrite {
        self.begin_batch_with_timeout(self.config().write_timeout)
    }

    pub fn begin_batch_with_timeout(&self, timeout: Duration) -> BatchWrite {
        BatchWrite {
            client: self.clone(),
            entries: Vec::new(),
            timeout,
        }
    }

    /// Fill a batch in `build` and commit it if `build` succeeds.
    ///
    /// If `build` fails nothing is sent and its error is returned.
    pub async fn batch_write<F>(&self, timeout: Duration, build: F) -> Result<(), CoreError>
    where
        F: FnOnce(&mut BatchWrite) -> Result<(), CoreError>,
    {
        let mut batch = self.begin_batch_with_timeout(timeout);
        match build(&mut batch) {
            Ok(()) => batch.commit().await,
            Err(e) => {
                batch.discard();
                Err(e)
            }
        }
    }

    /// Direct write to one handle.
    pub(crate) async fn write_single(
        &self,
        handle: &WatchableHandle,
        value: WriteValue,
    ) -> Result<(), CoreError> {
        handle.check_writable()?;
        let entries = [BatchEntry {
            handle: handle.clone(),
            value: value.into_wire(),
        }];
        match self.submit_writes(&entries, self.config().write_timeout).await {
            Err(CoreError::BatchWrite { path, reason, .. }) => {
                Err(CoreError::WriteRejected { path, reason })
            }
            Err(CoreError::Rejected { message }) => Err(CoreError::WriteRejected {
                path: handle.display_path().to_owned(),
                reason: message,
            }),
            other => other,
        }
    }

    pub(crate) async fn submit_writes(
        &self,
        entries: &[BatchEntry],
        timeout: Duration,
    ) -> Result<(), CoreError> {
        if entries.is_empty() {
            return Ok(());
        }
        if entries.len() > MAX_BATCH_SIZE {
            return Err(CoreError::Validation {
                message: format!("a batch holds at most {MAX_BATCH_SIZE} writes"),
            });
        }

        let updates = entries
            .iter()
            .zip(0u32..)
            .map(|(entry, batch_index)| UpdateRecord {
                batch_index,
                watchable: entry.handle.server_id().to_owned(),
                value: entry.value.clone(),
            })
            .collect();

        let (completions_tx, mut completions) = mpsc::unbounded_channel();
        let (reply, ack) = oneshot::channel();
        let reqid = self.send_request(
            ClientMessage::WriteWatchable { updates },
            Some(PendingRequest::Write {
                completions: completions_tx,
                reply,
                sent_at: Instant::now(),
            }),
        )?;

        let mut token = None;
        let outcome = tokio::time::timeout(
            timeout,
            self.await_completions(entries, ack, &mut completions, &mut token),
        )
        .await;

        self.inner.pending.remove(&reqid);
        match token {
            Some(token) => {
                self.inner.write_trackers.remove(&token);
            }
            None => {
                // The ack may have been handled after our last poll, leaving a
                // tracker we never learned the token of.
                drop(completions);
                self.forget_closed_trackers();
            }
        }

        outcome.unwrap_or_else(|_| {
            warn!(count = entries.len(), ?timeout, "write not confirmed in time");
            Err(CoreError::WriteTimeout {
                count: entries.len(),
                timeout,
            })
        })
    }

    /// Drop trackers whose batch stopped listening.
    fn forget_closed_trackers(&self) {
        self.inner.write_trackers.retain(|_, tx| !tx.is_closed());
    }

    async fn await_completions(
        &self,
        entries: &[BatchEntry],
        ack: oneshot::Receiver<Result<WriteAck, CoreError>>,
        completions: &mut mpsc::UnboundedReceiver<WriteCompletion>,
        token: &mut Option<String>,
    ) -> Result<(), CoreError> {
        let ack = ack.await.map_err(|_| CoreError::Disconnected)??;
        *token = Some(ack.request_token.clone());
        if usize::try_from(ack.count).ok() != Some(entries.len()) {
            return Err(CoreError::protocol(format!(
                "server accepted {} of {} writes",
                ack.count,
                entries.len()
            )));
        }

        let mut confirmed = vec![false; entries.len()];
        let mut remaining = entries.len();
        while remaining > 0 {
            let completion = completions.recv().await.ok_or(CoreError::Disconnected)?;
            let Some(index) = usize::try_from(completion.batch_index)
                .ok()
                .filter(|i| *i < entries.len())
            else {
                warn!(
                    batch_index = completion.batch_index,
                    "completion for an index outside the batch"
                );
                continue;
            };
            let (Some(entry), Some(done)) = (entries.get(index), confirmed.get_mut(index)) else {
                continue;
            };

            if !completion.success {
                return Err(CoreError::BatchWrite {
                    index,
                    path: entry.handle.display_path().to_owned(),
                    reason: "the server could not write the value to the device".into(),
                });
            }
            if !*done {
                *done = true;
                remaining -= 1;
                let zero = *self.inner.server_time_zero.borrow();
                let written = convert::server_time(zero, completion.completion_server_time_us);
                entry.handle.mark_written(written);
            }
        }
        debug!(count = entries.len(), token = %ack.request_token, "write confirmed");
        Ok(())
    }
}
