//! Per-connection channel and request tables.
//!
//! A connection multiplexes channels and RPC requests over one socket, so
//! one lock guards both tables. Accessors here never call out while the
//! lock is held; executors run outside, in tasks owned by the connection.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use pva_core::{PvaError, PvaResult, Status};

use crate::provider::{Channel, ChannelRpc};

/// Lifecycle of a channel RPC request. `Init` and `Cancelled` belong to
/// the protocol's status vocabulary but no table entry holds them today:
/// registration publishes a request directly as `Ready`, and cancel
/// handling is not wired up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RequestStatus {
    #[allow(dead_code)]
    Init,
    Ready,
    InProgress,
    #[allow(dead_code)]
    Cancelled,
    Destroyed,
}

impl std::fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            RequestStatus::Init => "INIT",
            RequestStatus::Ready => "READY",
            RequestStatus::InProgress => "REQUEST_IN_PROGRESS",
            RequestStatus::Cancelled => "CANCELLED",
            RequestStatus::Destroyed => "DESTROYED",
        };
        f.write_str(name)
    }
}

struct RequestEntry {
    doer: Arc<dyn ChannelRpc>,
    cancel: Option<CancellationToken>,
    status: RequestStatus,
}

struct Tables {
    channels: HashMap<i32, Arc<dyn Channel>>,
    requests: HashMap<i32, RequestEntry>,
}

/// Channel and request state of one connection.
pub(crate) struct ConnState {
    tables: Mutex<Tables>,
}

impl ConnState {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(ConnState {
            tables: Mutex::new(Tables { channels: HashMap::new(), requests: HashMap::new() }),
        })
    }

    pub(crate) async fn insert_channel(&self, id: i32, channel: Arc<dyn Channel>) {
        self.tables.lock().await.channels.insert(id, channel);
    }

    pub(crate) async fn channel(&self, id: i32) -> Option<Arc<dyn Channel>> {
        self.tables.lock().await.channels.get(&id).cloned()
    }

    /// Registers a request as READY. An ID may be reused only once its
    /// previous request reached DESTROYED.
    pub(crate) async fn add_request(&self, id: i32, doer: Arc<dyn ChannelRpc>) -> PvaResult<()> {
        let mut tables = self.tables.lock().await;
        if let Some(existing) = tables.requests.get(&id) {
            if existing.status != RequestStatus::Destroyed {
                return Err(PvaError::Request(format!(
                    "request ID {id:x} already exists with status {}",
                    existing.status
                )));
            }
        }
        tables
            .requests
            .insert(id, RequestEntry { doer, cancel: None, status: RequestStatus::Ready });
        Ok(())
    }

    /// Moves a READY request to REQUEST_IN_PROGRESS and hands out its
    /// executor plus a fresh cancellation token parented to `parent`.
    pub(crate) async fn begin_exec(
        &self,
        id: i32,
        parent: &CancellationToken,
    ) -> PvaResult<(Arc<dyn ChannelRpc>, CancellationToken)> {
        let mut tables = self.tables.lock().await;
        let entry = tables
            .requests
            .get_mut(&id)
            .filter(|entry| entry.status == RequestStatus::Ready)
            .ok_or_else(|| PvaError::Status(Status::error("request not READY")))?;
        entry.status = RequestStatus::InProgress;
        let token = parent.child_token();
        entry.cancel = Some(token.clone());
        Ok((entry.doer.clone(), token))
    }

    /// Returns a finished execution to READY, or destroys the request when
    /// the execution carried the destroy bit. A request already destroyed
    /// by connection teardown stays destroyed.
    pub(crate) async fn finish_exec(&self, id: i32, destroy: bool) {
        let mut tables = self.tables.lock().await;
        let Some(entry) = tables.requests.get_mut(&id) else { return };
        entry.cancel = None;
        if destroy {
            entry.status = RequestStatus::Destroyed;
        } else if entry.status == RequestStatus::InProgress {
            entry.status = RequestStatus::Ready;
        }
    }

    /// Tears down every channel and request on the connection. In-flight
    /// executions are cancelled. Returns how many were cancelled.
    pub(crate) async fn destroy_all(&self) -> usize {
        let mut tables = self.tables.lock().await;
        let mut cancelled = 0;
        for entry in tables.requests.values_mut() {
            if let Some(cancel) = entry.cancel.take() {
                cancel.cancel();
                cancelled += 1;
            }
            entry.status = RequestStatus::Destroyed;
        }
        tables.channels.clear();
        cancelled
    }

    #[cfg(test)]
    pub(crate) async fn request_status(&self, id: i32) -> Option<RequestStatus> {
        self.tables.lock().await.requests.get(&id).map(|entry| entry.status)
    }

    #[cfg(test)]
    pub(crate) async fn channel_count(&self) -> usize {
        self.tables.lock().await.channels.len()
    }
}
