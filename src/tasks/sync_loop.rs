use std::future::Future;
use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use tokio::time::sleep;

use crate::errors::SyncError;
use crate::models::calendar::RetentionWindow;
use crate::models::period::Period;
use crate::models::sync_state::SyncState;
use crate::service::calendar_publisher::{CalendarPublisher, CalendarStore, CleanupReport};
use crate::service::document_retriever::{BrowserLauncher, DocumentRetriever};
use crate::service::ics_codec::IcsCodec;
use crate::service::retry::RetryPolicy;
use crate::service::trigger_detector::{self, Inbox};
use crate::tasks::schedule::ScheduleWindow;

#[derive(Debug, Clone)]
pub struct PipelineOptions {
    pub trigger_sender: String,
    pub scan_limit: usize,
    pub retention_days: u32,
    /// Zone used to pick the fallback week.
    pub timezone: Tz,
    pub retry: RetryPolicy,
}

/// Everything one sync cycle talks to.
pub struct SyncPipeline<I: Inbox, L: BrowserLauncher, S: CalendarStore> {
    pub inbox: I,
    pub retriever: DocumentRetriever<L>,
    pub store: S,
    pub codec: IcsCodec,
    pub options: PipelineOptions,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncSummary {
    pub period: Option<Period>,
    pub entries: usize,
    pub uploaded: usize,
    /// `None` when the cleanup query itself failed.
    pub cleanup: Option<CleanupReport>,
}

#[derive(Debug)]
pub enum TickOutcome {
    NoTrigger,
    Synced(SyncSummary),
    /// The trigger (if any) was not consumed and will be seen again.
    Failed(SyncError),
}

/// One detect → retrieve → publish → cleanup cycle. The returned state only
/// moves past a trigger once its roster was published.
pub async fn sync_tick<I, L, S>(
    state: SyncState,
    pipeline: &SyncPipeline<I, L, S>,
    now: DateTime<Utc>,
) -> (SyncState, TickOutcome)
where
    I: Inbox,
    L: BrowserLauncher,
    S: CalendarStore,
{
    let options = &pipeline.options;
    let messages = match pipeline
        .inbox
        .recent_from(&options.trigger_sender, options.scan_limit)
        .await
    {
        Ok(messages) => messages,
        Err(err) => {
            tracing::error!(error = %err, "inbox check failed");
            return (state, TickOutcome::Failed(err));
        }
    };

    let trigger = trigger_detector::detect(
        &messages,
        &options.trigger_sender,
        state.last_marker,
        options.scan_limit,
    );
    if !trigger.found {
        let next = SyncState {
            last_marker: trigger.new_marker,
            ..state
        };
        return (next, TickOutcome::NoTrigger);
    }

    let target = trigger.target_period.unwrap_or_else(|| {
        let fallback = current_period(now, options.timezone);
        tracing::info!(%fallback, "notification names no week, syncing the current one");
        fallback
    });

    match sync_period(pipeline, Some(target), now).await {
        Ok(summary) => {
            let next = SyncState {
                last_marker: trigger.new_marker,
                last_period: Some(target),
                last_published_at: Some(now),
            };
            (next, TickOutcome::Synced(summary))
        }
        Err(err) => {
            tracing::error!(period = %target, class = %err.class(), error = %err, "sync failed, trigger kept for the next check");
            (state, TickOutcome::Failed(err))
        }
    }
}

/// Retrieves, publishes and cleans up for `target` without looking at the
/// inbox. `None` exports whatever week the portal opens on.
pub async fn sync_period<I, L, S>(
    pipeline: &SyncPipeline<I, L, S>,
    target: Option<Period>,
    now: DateTime<Utc>,
) -> Result<SyncSummary, SyncError>
where
    I: Inbox,
    L: BrowserLauncher,
    S: CalendarStore,
{
    let bytes = pipeline.retriever.retrieve(target).await?;
    let document = pipeline.codec.parse(&bytes)?;
    tracing::info!(entries = document.len(), "parsed roster export");

    let mut publisher = CalendarPublisher::new(
        &pipeline.store,
        &pipeline.codec,
        pipeline.options.retry.clone(),
    );
    let published = publisher.publish(&document).await?;

    let window = RetentionWindow::days_before(now, pipeline.options.retention_days)?;
    let cleanup = match publisher.cleanup(window).await {
        Ok(report) => Some(report),
        Err(err) => {
            tracing::warn!(error = %err, "retention cleanup failed");
            None
        }
    };

    Ok(SyncSummary {
        period: target,
        entries: document.len(),
        uploaded: published.uploaded,
        cleanup,
    })
}

/// ISO week containing `now` in `timezone`.
pub fn current_period(now: DateTime<Utc>, timezone: Tz) -> Period {
    Period::containing(now.with_timezone(&timezone).date_naive())
}

pub struct LoopSettings {
    pub interval: Duration,
    pub window: ScheduleWindow,
    pub state_file: Option<PathBuf>,
}

/// Checks right away, then every `interval`, skipping checks outside the
/// window. Returns when `shutdown` resolves; a tick in progress finishes
/// first.
pub async fn run_sync_loop<I, L, S, F>(
    pipeline: &SyncPipeline<I, L, S>,
    settings: &LoopSettings,
    initial: SyncState,
    shutdown: F,
) -> SyncState
where
    I: Inbox,
    L: BrowserLauncher,
    S: CalendarStore,
    F: Future<Output = ()>,
{
    tokio::pin!(shutdown);
    let mut state = initial;
    tracing::info!(
        interval_minutes = settings.interval.as_secs() / 60,
        "sync loop started"
    );

    loop {
        let now = Utc::now();
        if settings.window.contains(now) {
            let (next, outcome) = sync_tick(state.clone(), pipeline, now).await;
            match &outcome {
                TickOutcome::NoTrigger => tracing::debug!("no new roster notification"),
                TickOutcome::Synced(summary) => tracing::info!(
                    period = ?summary.period.map(|p| p.to_string()),
                    uploaded = summary.uploaded,
                    "roster synced"
                ),
                TickOutcome::Failed(_) => {}
            }
            if next != state {
                persist(settings, &next);
            }
            state = next;
        } else {
            tracing::debug!("outside active hours, skipping check");
        }

        tokio::select! {
            _ = sleep(settings.interval) => {}
            _ = &mut shutdown => {
                tracing::info!("shutdown requested, stopping sync loop");
                break;
            }
        }
    }
    state
}

fn persist(settings: &LoopSettings, state: &SyncState) {
    let Some(path) = &settings.state_file else {
        return;
    };
    if let Err(err) = state.save(path) {
        tracing::warn!(path = %path.display(), error = %err, "could not save sync state");
    }
}
