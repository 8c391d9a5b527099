use std::path::Path;

use chrono::Utc;

use crate::clients::caldav::CalDavStore;
use crate::clients::imap_inbox::ImapInbox;
use crate::clients::webdriver::WebDriverLauncher;
use crate::config::Settings;
use crate::errors::SyncError;
use crate::models::sync_state::SyncState;
use crate::service::document_retriever::DocumentRetriever;
use crate::service::ics_codec::IcsCodec;
use crate::tasks::sync_loop::{
    self, LoopSettings, PipelineOptions, SyncPipeline, TickOutcome,
};

pub type LivePipeline = SyncPipeline<ImapInbox, WebDriverLauncher, CalDavStore>;

pub fn build_pipeline(settings: &Settings) -> LivePipeline {
    let portal = &settings.portal;
    SyncPipeline {
        inbox: ImapInbox::new(settings.inbox.imap.clone()),
        retriever: DocumentRetriever::new(
            WebDriverLauncher::new(portal.webdriver.clone()),
            portal.elements.clone(),
            portal.credentials.clone(),
            portal.retriever.clone(),
        ),
        store: CalDavStore::new(settings.caldav.clone()),
        codec: IcsCodec::new(settings.schedule.timezone),
        options: PipelineOptions {
            trigger_sender: settings.inbox.trigger_sender.clone(),
            scan_limit: settings.inbox.scan_limit,
            retention_days: settings.retention_days,
            timezone: settings.schedule.timezone,
            retry: settings.retry.clone(),
        },
    }
}

pub fn load_state(path: Option<&Path>) -> Result<SyncState, SyncError> {
    match path {
        Some(path) => SyncState::load(path),
        None => Ok(SyncState::default()),
    }
}

/// Runs the scheduled loop until Ctrl-C.
pub async fn run(settings: &Settings) -> Result<(), SyncError> {
    let pipeline = build_pipeline(settings);
    let initial = load_state(settings.state_file.as_deref())?;
    let loop_settings = LoopSettings {
        interval: settings.schedule.check_interval,
        window: settings.schedule.window.clone(),
        state_file: settings.state_file.clone(),
    };
    let final_state = sync_loop::run_sync_loop(&pipeline, &loop_settings, initial, shutdown_signal()).await;
    tracing::info!(marker = ?final_state.last_marker, "stopped");
    Ok(())
}

/// A single check, ignoring the schedule window when asked to.
pub async fn tick(settings: &Settings, ignore_window: bool) -> Result<TickOutcome, SyncError> {
    let now = Utc::now();
    if !ignore_window && !settings.schedule.window.contains(now) {
        tracing::info!("outside active hours, nothing to do");
        return Ok(TickOutcome::NoTrigger);
    }
    let pipeline = build_pipeline(settings);
    let state = load_state(settings.state_file.as_deref())?;
    let (next, outcome) = sync_loop::sync_tick(state.clone(), &pipeline, now).await;
    if let Some(path) = &settings.state_file {
        if next != state {
            next.save(path)?;
        }
    }
    Ok(outcome)
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %err, "cannot listen for Ctrl-C, running until killed");
        std::future::pending::<()>().await;
    }
}
