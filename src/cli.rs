use chrono::Utc;
use clap::{Parser, Subcommand};

use crate::clients::caldav::CalDavStore;
use crate::clients::imap_inbox::ImapInbox;
use crate::config::{AppConfig, Settings};
use crate::errors::SyncError;
use crate::logging;
use crate::models::period::Period;
use crate::runtime;
use crate::service::trigger_detector::{self, Inbox};
use crate::service::week_planner::{self, Direction};
use crate::tasks::sync_loop::{self, SyncSummary, TickOutcome};

#[derive(Parser)]
#[command(name = "rosterSync", about = "Copies the published work roster into a CalDAV calendar")]
pub struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Check the inbox on schedule until interrupted (default)
    Run,
    /// Run one check now
    Tick {
        #[arg(long)]
        ignore_window: bool,
    },
    /// Export a week from the portal and publish it without waiting for a notification
    Fetch {
        #[arg(long)]
        week: Option<u32>,
        #[arg(long)]
        year: Option<i32>,
    },
    /// Show the clicks needed to get from one week to another (e.g. 2025-W40 2025-W38)
    Plan { from: String, to: String },
    /// List the calendars on the CalDAV server
    CheckCalendar,
    /// List recent notifications from the trigger sender
    CheckInbox,
}

pub async fn cli(cli: Cli) -> Result<(), SyncError> {
    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => runtime::run(&load_settings()?).await,
        Commands::Tick { ignore_window } => {
            let settings = load_settings()?;
            match runtime::tick(&settings, ignore_window).await? {
                TickOutcome::NoTrigger => println!("No new roster notification"),
                TickOutcome::Synced(summary) => print_summary(&summary),
                TickOutcome::Failed(err) => return Err(err),
            }
            Ok(())
        }
        Commands::Fetch { week, year } => {
            let settings = load_settings()?;
            let target = fetch_target(week, year, &settings)?;
            let pipeline = runtime::build_pipeline(&settings);
            let summary = sync_loop::sync_period(&pipeline, target, Utc::now()).await?;
            print_summary(&summary);
            Ok(())
        }
        Commands::Plan { from, to } => print_plan(&from, &to),
        Commands::CheckCalendar => check_calendar(&load_settings()?).await,
        Commands::CheckInbox => check_inbox(&load_settings()?).await,
    }
}

fn load_settings() -> Result<Settings, SyncError> {
    let config = AppConfig::from_env()?;
    let settings = Settings::from_config(&config)?;
    logging::init(&settings.log)?;
    Ok(settings)
}

fn fetch_target(week: Option<u32>, year: Option<i32>, settings: &Settings) -> Result<Option<Period>, SyncError> {
    match (week, year) {
        (None, None) => Ok(None),
        (None, Some(_)) => Err(SyncError::Validation("--year needs --week".to_string())),
        (Some(week), year) => {
            let year = year.unwrap_or_else(|| {
                sync_loop::current_period(Utc::now(), settings.schedule.timezone).year()
            });
            Period::new(year, week).map(Some)
        }
    }
}

fn print_plan(from: &str, to: &str) -> Result<(), SyncError> {
    let steps = week_planner::plan_labels(from, to)?;
    if steps.is_empty() {
        println!("Already on {}", to);
        return Ok(());
    }
    let direction = match steps[0].direction {
        Direction::Forward => "next",
        Direction::Backward => "previous",
    };
    println!("{} x {} week", steps.len(), direction);
    Ok(())
}

fn print_summary(summary: &SyncSummary) {
    let period = summary
        .period
        .map(|p| p.to_string())
        .unwrap_or_else(|| "portal default week".to_string());
    println!("Synced {}: {} of {} entries uploaded", period, summary.uploaded, summary.entries);
    match summary.cleanup {
        Some(report) => println!(
            "Cleanup: {} deleted, {} failed",
            report.deleted, report.failed
        ),
        None => println!("Cleanup: skipped after an error, see log"),
    }
}

async fn check_calendar(settings: &Settings) -> Result<(), SyncError> {
    let store = CalDavStore::new(settings.caldav.clone());
    let calendars = store.list_calendars().await?;
    if calendars.is_empty() {
        println!("No calendars found under {}", settings.caldav.url);
    }
    for calendar in calendars {
        let name = calendar.display_name.as_deref().unwrap_or("(unnamed)");
        let marker = if name == settings.caldav.calendar_name { "*" } else { " " };
        println!("{} {}  {}", marker, name, calendar.url);
    }
    Ok(())
}

async fn check_inbox(settings: &Settings) -> Result<(), SyncError> {
    let inbox = ImapInbox::new(settings.inbox.imap.clone());
    let state = runtime::load_state(settings.state_file.as_deref())?;
    let messages = inbox
        .recent_from(&settings.inbox.trigger_sender, settings.inbox.scan_limit)
        .await?;
    println!(
        "{} message(s) from {}, last handled {}",
        messages.len(),
        settings.inbox.trigger_sender,
        state
            .last_marker
            .map(|m| m.to_string())
            .unwrap_or_else(|| "none".to_string())
    );
    for message in messages {
        let week = trigger_detector::extract_period(&message.body, message.received_at)
            .map(|p| p.to_string())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{}  {}  {}  {}",
            message.id,
            message.received_at.format("%Y-%m-%d %H:%M"),
            week,
            message.subject
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arguments_parse() {
        let cli = Cli::try_parse_from(["rosterSync", "fetch", "--week", "43"]).unwrap();
        assert!(matches!(
            cli.command,
            Some(Commands::Fetch {
                week: Some(43),
                year: None
            })
        ));
        let cli = Cli::try_parse_from(["rosterSync"]).unwrap();
        assert!(cli.command.is_none());
        let cli = Cli::try_parse_from(["rosterSync", "tick", "--ignore-window"]).unwrap();
        assert!(matches!(cli.command, Some(Commands::Tick { ignore_window: true })));
    }
}
