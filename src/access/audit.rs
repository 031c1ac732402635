//! Best-effort access-log writer.
//!
//! Request paths hand entries to [`AuditLog::record`], which never blocks and
//! never fails the caller. A single background task drains the bounded
//! channel into an [`AuditSink`]. A full channel or a sink error drops the
//! entry with a log line.

use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, trace, warn};

use crate::storage::{AccessLogEntry, AuditSink};

/// Cheap, cloneable handle to the audit writer.
#[derive(Debug, Clone)]
pub struct AuditLog {
    tx: mpsc::Sender<AccessLogEntry>,
}

impl AuditLog {
    /// Spawn the writer task and return a handle plus its join handle.
    ///
    /// The writer stops once every [`AuditLog`] clone has been dropped and
    /// the queue is drained.
    pub fn spawn(sink: Arc<dyn AuditSink>, capacity: usize) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let handle = tokio::spawn(run_writer(sink, rx));
        (Self { tx }, handle)
    }

    /// Queue an entry without waiting.
    pub fn record(&self, entry: AccessLogEntry) {
        match self.tx.try_send(entry) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(entry)) => {
                warn!(
                    user_id = entry.user_id,
                    tryout_id = entry.tryout_id,
                    action = entry.action.as_str(),
                    "audit queue full, entry dropped"
                );
            }
            Err(mpsc::error::TrySendError::Closed(entry)) => {
                warn!(
                    user_id = entry.user_id,
                    tryout_id = entry.tryout_id,
                    action = entry.action.as_str(),
                    "audit writer stopped, entry dropped"
                );
            }
        }
    }
}

/// Run the writer loop until every sender is dropped.
async fn run_writer(sink: Arc<dyn AuditSink>, mut rx: mpsc::Receiver<AccessLogEntry>) {
    while let Some(entry) = rx.recv().await {
        if let Err(err) = sink.append(&entry).await {
            error!(?entry, error = %err, "access log write failed");
        }
    }
    trace!("audit writer stopped");
}
