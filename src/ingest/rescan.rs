//! Re-scan: give stale unparsed records another parse job.
//!
//! Nothing retries a failed parse on its own; this is the operator's way to
//! do so for records left unparsed longer than `rescan_after_hours`.

use chrono::{DateTime, TimeDelta, Utc};
use tracing::info;

use crate::config::ScheduleConfig;
use crate::error::Result;
use crate::ingest::queue::{due_at, JobQueue, ParseJob};
use crate::store::BounceStore;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RescanReport {
    /// Unparsed records older than the threshold.
    pub stale: usize,
    pub scheduled: usize,
    pub already_queued: usize,
}

/// Queue parse jobs for stale unparsed records, under the usual cap and
/// spacing. The caller saves the queue.
pub fn rescan(
    store: &dyn BounceStore,
    queue: &mut JobQueue,
    schedule: &ScheduleConfig,
    now: DateTime<Utc>,
) -> Result<RescanReport> {
    let stale = store.unparsed_older_than(stale_cutoff(now, schedule.rescan_after_hours))?;

    let mut report = RescanReport {
        stale: stale.len(),
        ..Default::default()
    };
    for record in &stale {
        if report.scheduled >= schedule.max_jobs {
            break;
        }
        let Some(uid) = record.uid else {
            continue;
        };
        if queue.is_scheduled(uid, &record.mailbox) {
            report.already_queued += 1;
            continue;
        }
        queue.schedule(ParseJob {
            uid,
            mailbox: record.mailbox.clone(),
            due_at: due_at(now, schedule.delay_step_secs, report.scheduled + 1),
        });
        report.scheduled += 1;
    }

    info!(
        stale = report.stale,
        scheduled = report.scheduled,
        "Re-scan complete"
    );
    Ok(report)
}

/// Records last updated before this are stale. A threshold reaching past
/// the earliest representable time makes nothing stale.
fn stale_cutoff(now: DateTime<Utc>, hours: u64) -> DateTime<Utc> {
    i64::try_from(hours)
        .ok()
        .and_then(TimeDelta::try_hours)
        .and_then(|age| now.checked_sub_signed(age))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}
