//! Audit Recorder: append-only writes and lazy, paged queries.
//!
//! `record` is fail-closed: callers treat an `AuditWriteFailed` as the failure
//! of the operation that triggered it and undo their state write.

use std::sync::Arc;

use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};
use gatekeeper_state::{AuditCursor, AuditEntry, AuditFilter, AuditStore};

use crate::domain::{GovernanceError, Result};

/// User id recorded for transitions the engine performs on its own.
pub const SYSTEM_USER: &str = "system";

/// Writes and reads the audit log through an [`AuditStore`].
#[derive(Clone)]
pub struct AuditRecorder {
    store: Arc<dyn AuditStore>,
    page_size: usize,
}

impl AuditRecorder {
    pub fn new(store: Arc<dyn AuditStore>, page_size: usize) -> Self {
        Self {
            store,
            page_size: page_size.max(1),
        }
    }

    /// Append an entry. Any storage failure becomes `AuditWriteFailed`.
    pub async fn record(&self, entry: AuditEntry) -> Result<AuditEntry> {
        let action = entry.action.clone();
        match self.store.append(entry).await {
            Ok(stored) => {
                tracing::debug!(event = "audit.recorded", action = %stored.action, seq = stored.seq);
                Ok(stored)
            }
            Err(e) => {
                tracing::error!(event = "audit.write_failed", action = %action, error = %e);
                Err(GovernanceError::AuditWriteFailed(e))
            }
        }
    }

    /// Build a query over entries matching `filter`. Nothing is read until
    /// the returned query is streamed.
    pub fn query(&self, filter: AuditFilter) -> AuditQuery {
        AuditQuery {
            store: Arc::clone(&self.store),
            filter,
            page_size: self.page_size,
        }
    }
}

/// A lazy, restartable query over the audit log, newest entries first.
#[derive(Clone)]
pub struct AuditQuery {
    store: Arc<dyn AuditStore>,
    filter: AuditFilter,
    page_size: usize,
}

impl AuditQuery {
    /// Stream matching entries page by page. Each call starts from the newest
    /// entry again.
    pub fn stream(&self) -> BoxStream<'static, Result<AuditEntry>> {
        let store = Arc::clone(&self.store);
        let filter = self.filter.clone();
        let page_size = self.page_size;

        // State: `None` once the log is exhausted, else the cursor to resume after.
        stream::try_unfold(Some(None::<AuditCursor>), move |state| {
            let store = Arc::clone(&store);
            let filter = filter.clone();
            async move {
                match state {
                    None => Ok::<_, GovernanceError>(None),
                    Some(after) => {
                        let page = store.scan(&filter, after, page_size).await?;
                        let next = if page.len() < page_size {
                            None
                        } else {
                            page.last().map(|e| Some(AuditCursor::of(e)))
                        };
                        let items = stream::iter(page.into_iter().map(Ok::<_, GovernanceError>));
                        Ok(Some((items, next)))
                    }
                }
            }
        })
        .try_flatten()
        .boxed()
    }

    /// Drain the whole query into memory.
    pub async fn collect(&self) -> Result<Vec<AuditEntry>> {
        self.stream().try_collect().await
    }
}
