//! Pushes roster entries into the remote calendar and purges old ones.
//!
//! Every store call (connect, upsert, range query, delete) runs under the
//! same [`RetryPolicy`]. Authorization and connection failures throw the
//! session away so the next attempt starts from a fresh login. The session
//! is opened lazily and released when the publisher is dropped.

use std::future::Future;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::time::sleep;

use crate::errors::SyncError;
use crate::models::calendar::{CalendarDocument, RemoteEntry, RetentionWindow};
use crate::service::ics_codec::IcsCodec;
use crate::service::retry::{RetryDecision, RetryPolicy};

#[async_trait]
pub trait CalendarStore: Send + Sync {
    type Session: CalendarSession + Clone + Send + Sync + 'static;

    async fn connect(&self) -> Result<Self::Session, SyncError>;

    /// Called once for every session the publisher stops using.
    fn release(&self, _session: Self::Session) {}
}

#[async_trait]
pub trait CalendarSession: Send + Sync {
    /// Create or replace the calendar object identified by `uid`.
    async fn upsert(&self, uid: &str, document: &str) -> Result<(), SyncError>;

    /// Entries starting before `cutoff`, filtered by the server.
    async fn query_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<RemoteEntry>, SyncError>;

    async fn delete(&self, entry: &RemoteEntry) -> Result<(), SyncError>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublishReport {
    pub uploaded: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub deleted: usize,
    pub failed: usize,
}

pub struct CalendarPublisher<'a, S: CalendarStore> {
    store: &'a S,
    codec: &'a IcsCodec,
    policy: RetryPolicy,
    session: Option<S::Session>,
}

impl<'a, S: CalendarStore> CalendarPublisher<'a, S> {
    pub fn new(store: &'a S, codec: &'a IcsCodec, policy: RetryPolicy) -> Self {
        Self {
            store,
            codec,
            policy,
            session: None,
        }
    }

    pub async fn publish(&mut self, document: &CalendarDocument) -> Result<PublishReport, SyncError> {
        let mut report = PublishReport::default();
        for entry in &document.entries {
            let body = self.codec.serialize_entry(document, entry);
            let uid = entry.uid.clone();
            self.with_retry("upsert", move |session| {
                let uid = uid.clone();
                let body = body.clone();
                async move { session.upsert(&uid, &body).await }
            })
            .await?;
            tracing::debug!(uid = %entry.uid, summary = %entry.summary, "uploaded entry");
            report.uploaded += 1;
        }
        tracing::info!(uploaded = report.uploaded, "roster entries published");
        Ok(report)
    }

    /// Deletes everything the store reports as starting before the cutoff.
    /// A failing delete is logged and skipped; a failing query is returned.
    pub async fn cleanup(&mut self, window: RetentionWindow) -> Result<CleanupReport, SyncError> {
        let cutoff = window.cutoff;
        let expired = self
            .with_retry("query", move |session| async move {
                session.query_before(cutoff).await
            })
            .await?;

        let mut report = CleanupReport::default();
        for entry in expired {
            if !window.is_expired(entry.start) {
                tracing::debug!(uid = %entry.uid, start = %entry.start, "store returned an entry inside the retention window, keeping it");
                continue;
            }
            let target = entry.clone();
            let outcome = self
                .with_retry("delete", move |session| {
                    let target = target.clone();
                    async move { session.delete(&target).await }
                })
                .await;
            match outcome {
                Ok(()) => report.deleted += 1,
                Err(err) => {
                    tracing::warn!(uid = %entry.uid, error = %err, "could not delete expired entry");
                    report.failed += 1;
                }
            }
        }
        tracing::info!(
            deleted = report.deleted,
            failed = report.failed,
            cutoff = %cutoff,
            "retention cleanup finished"
        );
        Ok(report)
    }

    async fn with_retry<T, F, Fut>(&mut self, operation: &str, mut op: F) -> Result<T, SyncError>
    where
        F: FnMut(S::Session) -> Fut,
        Fut: Future<Output = Result<T, SyncError>>,
    {
        let mut attempt = 1;
        loop {
            let result = match self.session().await {
                Ok(session) => op(session).await,
                Err(err) => Err(err),
            };
            let err = match result {
                Ok(value) => return Ok(value),
                Err(err) => err,
            };
            match self.policy.decide(attempt, &err) {
                RetryDecision::GiveUp => {
                    tracing::error!(operation, attempt, error = %err, "calendar store operation failed");
                    return Err(err);
                }
                RetryDecision::Retry { delay, reconnect } => {
                    tracing::warn!(
                        operation,
                        attempt,
                        max_attempts = self.policy.max_attempts,
                        class = %err.class(),
                        error = %err,
                        ?delay,
                        reconnect,
                        "calendar store operation failed, retrying"
                    );
                    if reconnect {
                        self.discard_session();
                    }
                    sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }

    async fn session(&mut self) -> Result<S::Session, SyncError> {
        if let Some(session) = &self.session {
            return Ok(session.clone());
        }
        let session = self.store.connect().await?;
        tracing::debug!("calendar store session opened");
        self.session = Some(session.clone());
        Ok(session)
    }

    fn discard_session(&mut self) {
        if let Some(session) = self.session.take() {
            self.store.release(session);
            tracing::debug!("calendar store session discarded");
        }
    }
}

impl<S: CalendarStore> Drop for CalendarPublisher<'_, S> {
    fn drop(&mut self) {
        self.discard_session();
    }
}
