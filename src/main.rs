//! CLI entry point for `bouncewatch`.

use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use clap::{CommandFactory, Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use tracing::{info, warn};

use bouncewatch::config::{self, Config};
use bouncewatch::error::BounceError;
use bouncewatch::export;
use bouncewatch::imap::ImapConnector;
use bouncewatch::ingest::{debug, driver, job, queue::JobQueue, rescan, status::StatusFile, Runtime};
use bouncewatch::model::bounce::BounceRecord;
use bouncewatch::parser::mapper::MapperOptions;
use bouncewatch::store::{BounceStore, FileStore};
use bouncewatch::upstream::{PlainCredentials, UpstreamOptions};

#[derive(Parser)]
#[command(
    name = "bouncewatch",
    version,
    about = "Watch an IMAP mailbox for bounces and record their delivery reports"
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Verbose logging (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Search for unseen bounces, record them, and schedule parse jobs
    Check {
        /// Stop starting IMAP work after this many seconds (0 = no limit).
        /// Defaults to the configured request ceiling.
        #[arg(long, value_name = "SECS")]
        time_limit: Option<u64>,
    },
    /// Run the parse jobs that are due
    Jobs,
    /// Parse one message right away
    Parse {
        #[arg(long)]
        uid: u32,
        /// Defaults to the configured mailbox
        #[arg(long)]
        mailbox: Option<String>,
    },
    /// Check periodically and run jobs as they fall due
    Watch,
    /// Schedule parse jobs for records left unparsed too long
    Rescan,
    /// Debug-parse the newest unseen bounce and print every step as JSON
    Debug,
    /// Run the delivery report pipeline on a local .eml file
    Inspect {
        file: PathBuf,
    },
    /// Show the last run, last error, and match count
    Status {
        #[arg(long)]
        json: bool,
    },
    /// List recorded bounces
    List {
        #[arg(long)]
        json: bool,
        /// Write the records to a CSV file instead
        #[arg(long, value_name = "PATH")]
        csv: Option<PathBuf>,
    },
    /// Remove every recorded bounce
    Clear,
    /// Generate shell completions
    Completions {
        #[arg(value_enum)]
        shell: clap_complete::Shell,
    },
    /// Generate a man page
    Manpage,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let config = config::load_config();

    let log_level = match cli.verbose {
        0 => config.general.log_level.as_str(),
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    setup_logging(log_level, &config);

    let data_dir = config::data_dir(&config);

    match cli.command {
        Commands::Check { time_limit } => with_runtime(&config, |rt| {
            let mut store = FileStore::in_dir(&data_dir)?;
            cmd_check(rt, &mut store, time_limit)
        }),
        Commands::Jobs => with_runtime(&config, |rt| {
            let mut store = FileStore::in_dir(&data_dir)?;
            cmd_jobs(rt, &mut store)
        }),
        Commands::Parse { uid, mailbox } => with_runtime(&config, |rt| {
            let mut store = FileStore::in_dir(&data_dir)?;
            let mailbox = mailbox.unwrap_or_else(|| rt.mailbox().to_string());
            cmd_parse(rt, &mut store, uid, &mailbox)
        }),
        Commands::Watch => with_runtime(&config, |rt| {
            let mut store = FileStore::in_dir(&data_dir)?;
            cmd_watch(rt, &mut store)
        }),
        Commands::Rescan => with_runtime(&config, |rt| {
            let store = FileStore::in_dir(&data_dir)?;
            cmd_rescan(rt, &store)
        }),
        Commands::Debug => with_runtime(&config, cmd_debug),
        Commands::Inspect { file } => cmd_inspect(&config, &file),
        Commands::Status { json } => cmd_status(&data_dir, json),
        Commands::List { json, csv } => cmd_list(&data_dir, json, csv.as_deref()),
        Commands::Clear => cmd_clear(&data_dir),
        Commands::Completions { shell } => cmd_completions(shell),
        Commands::Manpage => cmd_manpage(),
    }
}

/// Set up tracing with stderr output and optional file logging.
fn setup_logging(level: &str, config: &Config) {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    let stderr_layer = tracing_subscriber::fmt::layer().with_writer(std::io::stderr);

    // Try to set up file logging
    let log_path = config::log_file_path(config);
    let log_dir = log_path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    if std::fs::create_dir_all(&log_dir).is_ok() {
        let file_appender = tracing_appender::rolling::never(&log_dir, "bouncewatch.log");
        let file_layer = tracing_subscriber::fmt::layer()
            .with_ansi(false)
            .with_writer(file_appender);

        tracing_subscriber::registry()
            .with(env_filter)
            .with(stderr_layer)
            .with(file_layer)
            .init();
    } else {
        // Fall back to stderr only
        tracing_subscriber::registry()
            .with(env_filter)
            .with(stderr_layer)
            .init();
    }
}

/// Build the live runtime (upstream options, IMAP connector) and run `f`.
fn with_runtime(
    config: &Config,
    f: impl FnOnce(&Runtime<'_>) -> anyhow::Result<()>,
) -> anyhow::Result<()> {
    let upstream = UpstreamOptions::load(config.upstream.options_file.as_deref())?;
    let connector = ImapConnector;
    let decryptor = PlainCredentials;
    let rt = Runtime {
        config,
        upstream,
        decryptor: &decryptor,
        connector: &connector,
        data_dir: config::data_dir(config),
    };
    f(&rt)
}

fn bar(len: u64, label: &str) -> anyhow::Result<ProgressBar> {
    let pb = ProgressBar::new(len);
    pb.set_style(
        ProgressStyle::default_bar()
            .template(&format!(
                "{{spinner:.green}} {label} [{{bar:40.cyan/blue}}] {{pos}}/{{len}}"
            ))?
            .progress_chars("#>-"),
    );
    Ok(pb)
}

/// One ingestion run.
fn cmd_check(rt: &Runtime<'_>, store: &mut FileStore, time_limit: Option<u64>) -> anyhow::Result<()> {
    let limit = time_limit
        .map(Duration::from_secs)
        .unwrap_or_else(|| rt.config.timeouts.request_ceiling());
    let deadline = (!limit.is_zero()).then(|| Instant::now() + limit);

    let report = match driver::run_check(rt, store, deadline) {
        Ok(report) => report,
        Err(BounceError::Locked(_)) => {
            println!("  Another run is in progress; nothing done.");
            return Ok(());
        }
        Err(e) => return Err(e.into()),
    };

    println!();
    println!("  {:<22} {}", "Unseen bounces", report.found);
    println!("  {:<22} {}", "Records written", report.upserted);
    println!("  {:<22} {}", "Jobs scheduled", report.scheduled);
    println!("  {:<22} {}", "Already parsed", report.skipped_parsed);
    println!("  {:<22} {}", "Already scheduled", report.skipped_scheduled);
    if report.timed_out {
        println!("  Time limit reached; results are partial.");
    }
    if let Some(err) = &report.store_error {
        println!("  {:<22} {}", "Store error", err);
    }
    println!();
    Ok(())
}

/// Run the due parse jobs with a progress bar.
fn cmd_jobs(rt: &Runtime<'_>, store: &mut FileStore) -> anyhow::Result<()> {
    let pb = bar(0, "Parsing")?;
    let progress: &dyn Fn(u64, u64) = &|done, total| {
        pb.set_length(total);
        pb.set_position(done);
    };
    let report = job::run_due_jobs(rt, store, Some(progress))?;
    pb.finish_and_clear();

    if report.total() == 0 {
        println!("  No parse jobs due.");
        return Ok(());
    }
    println!();
    println!("  {:<22} {}", "Parsed", report.updated);
    println!("  {:<22} {}", "No delivery report", report.no_dsn);
    println!("  {:<22} {}", "Message gone", report.gone);
    println!("  {:<22} {}", "Failed", report.failed);
    println!();
    Ok(())
}

fn cmd_parse(rt: &Runtime<'_>, store: &mut FileStore, uid: u32, mailbox: &str) -> anyhow::Result<()> {
    match job::run_parse_job(rt, store, uid, mailbox)? {
        job::JobOutcome::Updated { rows, fields } => {
            println!("  {:<18} {}", "Sender", fields.sender);
            println!("  {:<18} {}", "Final recipient", fields.final_recipient);
            println!(
                "  {:<18} {}",
                "Arrival",
                fields
                    .arrival
                    .map(|a| a.format("%Y-%m-%d %H:%M:%S %:z").to_string())
                    .unwrap_or_default()
            );
            println!("  {:<18} {}", "Records updated", rows);
        }
        job::JobOutcome::NoDsn => println!("  {}", job::no_dsn_note(uid, mailbox)),
        job::JobOutcome::UidGone => println!("  UID {uid} is no longer in {mailbox}."),
    }
    Ok(())
}

/// Check every poll interval; between checks, run jobs as they fall due.
fn cmd_watch(rt: &Runtime<'_>, store: &mut FileStore) -> anyhow::Result<()> {
    let poll = Duration::from_secs(rt.config.schedule.poll_interval_secs.max(1));
    let tick = Duration::from_secs(rt.config.schedule.delay_step_secs.max(1));
    info!(poll_secs = poll.as_secs(), "Watching");

    loop {
        let started = Instant::now();
        match driver::run_check(rt, store, None) {
            Ok(report) => info!(found = report.found, scheduled = report.scheduled, "Check done"),
            Err(BounceError::Locked(_)) => info!("Another run is in progress"),
            Err(e) => warn!(error = %e, "Check failed"),
        }

        while started.elapsed() < poll {
            let report = job::run_due_jobs(rt, store, None)?;
            if report.total() > 0 {
                info!(
                    parsed = report.updated,
                    no_dsn = report.no_dsn,
                    failed = report.failed,
                    "Jobs done"
                );
            }
            std::thread::sleep(tick.min(poll.saturating_sub(started.elapsed())));
        }
    }
}

fn cmd_rescan(rt: &Runtime<'_>, store: &FileStore) -> anyhow::Result<()> {
    let Some(_guard) = rt.run_lock().try_acquire()? else {
        println!("  Another run is in progress; nothing done.");
        return Ok(());
    };
    let mut queue = rt.queue()?;
    let report = rescan::rescan(store, &mut queue, &rt.config.schedule, chrono::Utc::now())?;
    queue.save()?;

    println!();
    println!("  {:<22} {}", "Stale unparsed", report.stale);
    println!("  {:<22} {}", "Jobs scheduled", report.scheduled);
    println!("  {:<22} {}", "Already scheduled", report.already_queued);
    println!();
    Ok(())
}

fn cmd_debug(rt: &Runtime<'_>) -> anyhow::Result<()> {
    let report = debug::debug_parse(rt)?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn cmd_inspect(config: &Config, file: &Path) -> anyhow::Result<()> {
    if !file.exists() {
        anyhow::bail!("File not found: {}", file.display());
    }
    let options = MapperOptions::new(&config.mapper, config.site_timezone());
    let report = debug::inspect_file(file, &options)?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

fn cmd_status(data_dir: &Path, json: bool) -> anyhow::Result<()> {
    let status = StatusFile::in_dir(data_dir).load();
    let pending = JobQueue::in_dir(data_dir)?.pending().len();
    let records = FileStore::in_dir(data_dir)?.records()?;
    let parsed = records.iter().filter(|r| r.parsed).count();

    if json {
        let out = serde_json::json!({
            "last_run": status.last_run.map(|d| d.to_rfc3339()),
            "last_error": status.last_error,
            "count": status.count,
            "pending_jobs": pending,
            "records": records.len(),
            "parsed": parsed,
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    let last_run = status
        .last_run
        .map(|d| d.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| "never".to_string());
    println!();
    println!("  {:<18} {}", "Last run", last_run);
    println!(
        "  {:<18} {}",
        "Last error",
        if status.last_error.is_empty() { "-" } else { &status.last_error }
    );
    println!("  {:<18} {}", "Unseen bounces", status.count);
    println!("  {:<18} {}", "Pending jobs", pending);
    println!("  {:<18} {} ({} parsed)", "Records", records.len(), parsed);
    println!();
    Ok(())
}

fn cmd_list(data_dir: &Path, json: bool, csv: Option<&Path>) -> anyhow::Result<()> {
    let records = FileStore::in_dir(data_dir)?.records()?;

    if let Some(path) = csv {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        export::csv::export_csv(&records, path)?;
        println!("  Exported {} record(s) to {}", records.len(), path.display());
        return Ok(());
    }
    if json {
        println!("{}", serde_json::to_string_pretty(&records)?);
        return Ok(());
    }
    print_records_table(&records);
    Ok(())
}

fn cmd_clear(data_dir: &Path) -> anyhow::Result<()> {
    let mut store = FileStore::in_dir(data_dir)?;
    let count = store.records()?.len();
    store.truncate()?;
    println!("  Removed {count} record(s).");
    Ok(())
}

/// Generate shell completions and print to stdout.
fn cmd_completions(shell: clap_complete::Shell) -> anyhow::Result<()> {
    let mut cmd = Cli::command();
    clap_complete::generate(shell, &mut cmd, "bouncewatch", &mut std::io::stdout());
    Ok(())
}

/// Generate a man page and print to stdout.
fn cmd_manpage() -> anyhow::Result<()> {
    let cmd = Cli::command();
    let man = clap_mangen::Man::new(cmd);
    let mut buf = Vec::new();
    man.render(&mut buf)?;
    std::io::Write::write_all(&mut std::io::stdout(), &buf)?;
    Ok(())
}

/// Print records as a human-readable table.
fn print_records_table(records: &[BounceRecord]) {
    println!();
    println!("  {} record(s)", records.len());
    println!();
    if records.is_empty() {
        return;
    }

    println!(
        "  {:<5} {:<7} {:<6} {:<30} {:<30} {:<19}",
        "Id", "Uid", "Parsed", "Final recipient", "Sender", "Arrival"
    );
    println!("  {}", "-".repeat(102));

    for r in records {
        let recipient: String = r
            .dr_final_recipient
            .as_deref()
            .unwrap_or("")
            .chars()
            .take(29)
            .collect();
        let sender: String = r
            .dr_sender_email
            .as_deref()
            .unwrap_or("")
            .chars()
            .take(29)
            .collect();
        let arrival = r
            .dr_arrival_date
            .map(|d| d.format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_default();
        println!(
            "  {:<5} {:<7} {:<6} {:<30} {:<30} {:<19}",
            r.id,
            r.uid.map(|u| u.to_string()).unwrap_or_default(),
            if r.parsed { "yes" } else { "no" },
            recipient,
            sender,
            arrival
        );
    }
    println!();
}
