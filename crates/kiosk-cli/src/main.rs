// ============================================================================
// kiosk - entry kiosk runner and store inspection tool
// ============================================================================
// Usage:
//   kiosk run                               Read tokens from stdin, one per line
//   kiosk scan TOKEN                        Decide a single scan
//   kiosk decode TOKEN                      Show the claims carried by a token
//   kiosk refresh                           Pull the roster once
//   kiosk reconcile                         Replay queued offline grants once
//   kiosk pending                           List offline grants awaiting sync
//   kiosk history [--limit N]               Show the most recent scans
//   kiosk stats                             Show store statistics
//   kiosk export --format json              Export the store as JSON
//   kiosk prune --older-than 30             Prune old scan history
// ============================================================================

use anyhow::Result;
use chrono::{DateTime, TimeZone, Utc};
use clap::{Parser, Subcommand};
use kiosk_core::db::prune_cutoff;
use kiosk_core::{
    token, HttpAuthority, KioskConfig, KioskContext, KioskDb, KioskService, ReconciliationWorker,
    RosterRefresher, ScanAttempt, ScanDecisionEngine, SystemClock,
};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::info;

/// Gym entry kiosk
#[derive(Parser)]
#[command(name = "kiosk", version, about = "Verify member scans and manage the kiosk store")]
struct Cli {
    /// Path to the database file (default: ~/.kiosk/kiosk.redb)
    #[arg(long, global = true)]
    db_path: Option<String>,

    /// Kiosk identifier reported with every scan (overrides KIOSK_ID)
    #[arg(long, global = true)]
    kiosk_id: Option<String>,

    /// Authority base URL (overrides KIOSK_API_URL)
    #[arg(long, global = true)]
    api_url: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the kiosk: background sync plus one scan per stdin line
    Run,

    /// Decide a single scan and exit
    Scan {
        /// Raw token as read from the QR code
        token: String,
    },

    /// Decode a token locally without contacting the authority
    Decode { token: String },

    /// Pull the active roster from the authority once
    Refresh,

    /// Replay queued offline grants once
    Reconcile,

    /// List offline grants awaiting reconciliation
    Pending,

    /// Show the most recent logged scans
    History {
        #[arg(long, default_value = "20")]
        limit: usize,
    },

    /// Show store statistics (roster, queue, scan counts)
    Stats,

    /// Export store contents as JSON
    Export {
        /// Output format (currently only json is supported)
        #[arg(long, default_value = "json")]
        format: String,
    },

    /// Prune old scan history. Pending scans are never pruned.
    Prune {
        /// Delete logged scans older than this many days
        #[arg(long, default_value = "30")]
        older_than: i64,

        /// Show what would be pruned without actually deleting
        #[arg(long)]
        dry_run: bool,
    },
}

fn format_time(at: DateTime<Utc>) -> String {
    at.format("%Y-%m-%d %H:%M:%S UTC").to_string()
}

fn format_timestamp(ts: i64) -> String {
    Utc.timestamp_opt(ts, 0)
        .single()
        .map(format_time)
        .unwrap_or_else(|| format!("(invalid: {})", ts))
}

fn load_config(cli: &Cli) -> Result<KioskConfig> {
    let mut config = KioskConfig::from_env()?;
    if let Some(id) = &cli.kiosk_id {
        config.kiosk_id = id.clone();
    }
    if let Some(url) = &cli.api_url {
        config.api_base_url = url.clone();
    }
    if let Some(path) = &cli.db_path {
        config.db_path = Some(path.clone());
    }
    config.validate()?;
    Ok(config)
}

async fn open_context(config: KioskConfig, store: Arc<KioskDb>) -> Result<KioskContext> {
    let remote = HttpAuthority::new(
        &config.api_base_url,
        config.api_key.clone(),
        config.request_timeout(),
    )?;
    KioskContext::open(config, Arc::new(remote), Arc::new(SystemClock), store).await
}

#[tokio::main]
async fn main() -> Result<()> {
    // A missing .env is normal on a deployed kiosk
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("kiosk=info".parse()?)
                .add_directive("kiosk_core=info".parse()?),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    if let Commands::Decode { token } = &cli.command {
        return cmd_decode(token);
    }

    let config = load_config(&cli)?;
    let store = Arc::new(KioskDb::open(config.db_path.as_deref())?);

    match cli.command {
        Commands::Run => cmd_run(open_context(config, store).await?).await,
        Commands::Scan { token } => cmd_scan(open_context(config, store).await?, &token).await,
        Commands::Decode { .. } => Ok(()),
        Commands::Refresh => cmd_refresh(open_context(config, store).await?).await,
        Commands::Reconcile => cmd_reconcile(open_context(config, store).await?).await,
        Commands::Pending => cmd_pending(&store),
        Commands::History { limit } => cmd_history(&store, limit),
        Commands::Stats => cmd_stats(&store),
        Commands::Export { format } => cmd_export(&store, &format),
        Commands::Prune {
            older_than,
            dry_run,
        } => cmd_prune(&store, older_than, dry_run),
    }
}

fn print_attempt(attempt: &ScanAttempt) {
    println!(
        "{:<16}  {:<8}  {:<24}  {}",
        attempt.decision.as_str(),
        attempt.mode_used.as_str(),
        attempt.member_name,
        attempt.reason
    );
}

async fn cmd_run(ctx: KioskContext) -> Result<()> {
    let service = KioskService::start(ctx);
    info!("Reading tokens from stdin (Ctrl-C to stop)");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                match line? {
                    Some(line) if line.trim().is_empty() => continue,
                    Some(line) => print_attempt(&service.scan(&line).await),
                    None => break,
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                break;
            }
        }
    }

    service.shutdown().await;
    Ok(())
}

async fn cmd_scan(ctx: KioskContext, token: &str) -> Result<()> {
    // A persisted OFFLINE mode would otherwise never be re-checked here
    RosterRefresher::new(ctx.clone()).probe_if_offline().await;

    let kiosk_id = ctx.config.kiosk_id.clone();
    let attempt = ScanDecisionEngine::new(ctx).decide(token, &kiosk_id).await;
    print_attempt(&attempt);
    Ok(())
}

fn cmd_decode(raw: &str) -> Result<()> {
    let claims = token::decode(raw)?;
    println!("Subject: {}", claims.subject_id);
    match claims.expires_at {
        Some(exp) => {
            let state = if claims.is_expired_at(Utc::now().timestamp()) {
                "expired"
            } else {
                "valid"
            };
            println!("Expires: {} ({})", format_timestamp(exp), state);
        }
        None => println!("Expires: never"),
    }
    println!("Signature: not verified");
    Ok(())
}

async fn cmd_refresh(ctx: KioskContext) -> Result<()> {
    let count = RosterRefresher::new(ctx).refresh_once().await?;
    println!("Roster refreshed: {} members", count);
    Ok(())
}

async fn cmd_reconcile(ctx: KioskContext) -> Result<()> {
    // The roster pull doubles as the reachability probe
    if let Err(e) = RosterRefresher::new(ctx.clone()).refresh_once().await {
        println!("Roster refresh failed: {}", e);
    }
    if !ctx.connectivity.is_online() {
        println!("Authority unreachable; {} scans remain queued", ctx.queue.len().await);
        return Ok(());
    }

    let report = ReconciliationWorker::new(ctx.clone()).run_cycle().await;
    println!("Replayed: {}", report.replayed);
    println!("Rejected: {}", report.rejected);
    println!("Dropped:  {}", report.dropped);
    if report.interrupted {
        println!("Cycle interrupted by a transport failure");
    }
    println!("Still queued: {}", ctx.queue.len().await);
    Ok(())
}

fn cmd_pending(db: &KioskDb) -> Result<()> {
    let mut pending = db.list_pending()?;
    pending.sort_by_key(|q| (q.record.observed_at, q.id));

    if pending.is_empty() {
        println!("No pending scans.");
        return Ok(());
    }

    println!(
        "{:<6}  {:<22}  {:<16}  {:<8}  {:<22}  {}",
        "ID", "OBSERVED AT", "KIOSK", "RETRIES", "NEXT ATTEMPT", "LAST ERROR"
    );
    println!("{}", "-".repeat(100));

    for queued in &pending {
        println!(
            "{:<6}  {:<22}  {:<16}  {:<8}  {:<22}  {}",
            queued.id,
            format_time(queued.record.observed_at),
            queued.record.kiosk_id,
            queued.attempts,
            format_time(queued.next_attempt_at),
            queued.last_error.as_deref().unwrap_or("-")
        );
    }

    println!("\nTotal: {} pending", pending.len());
    Ok(())
}

fn cmd_history(db: &KioskDb, limit: usize) -> Result<()> {
    let scans = db.list_scans(Some(limit))?;

    if scans.is_empty() {
        println!("No scans logged.");
        return Ok(());
    }

    println!(
        "{:<22}  {:<16}  {:<16}  {:<8}  {:<20}  {}",
        "OBSERVED AT", "KIOSK", "DECISION", "MODE", "MEMBER", "REASON"
    );
    println!("{}", "-".repeat(110));

    for scan in &scans {
        let member = scan.member_name.chars().take(20).collect::<String>();
        println!(
            "{:<22}  {:<16}  {:<16}  {:<8}  {:<20}  {}",
            format_time(scan.observed_at),
            scan.kiosk_id,
            scan.decision.as_str(),
            scan.mode_used.as_str(),
            member,
            scan.reason
        );
    }

    println!("\nShowing {} most recent scans", scans.len());
    Ok(())
}

fn cmd_stats(db: &KioskDb) -> Result<()> {
    let stats = db.stats()?;

    println!("=== Kiosk Store Stats ===");
    println!("Database: {}", db.path().display());
    println!();
    println!(
        "Mode:     {}",
        stats.mode.map(|m| m.as_str()).unwrap_or("(never recorded)")
    );
    println!(
        "Roster:   {} members (refreshed: {})",
        stats.roster_members,
        stats
            .roster_refreshed_at
            .map(format_time)
            .unwrap_or_else(|| "never".into())
    );
    println!("Pending:  {}", stats.pending_scans);
    println!("Scans:    {} total", stats.total_scans);

    let mut counts: Vec<_> = stats.decision_counts.iter().collect();
    counts.sort();
    for (decision, count) in counts {
        println!("  {:16} {}", decision, count);
    }

    Ok(())
}

fn cmd_export(db: &KioskDb, format: &str) -> Result<()> {
    if format != "json" {
        anyhow::bail!("Unsupported format '{}'. Only 'json' is supported.", format);
    }

    let export = serde_json::json!({
        "exported_at": Utc::now().to_rfc3339(),
        "stats": db.stats()?,
        "roster": db.load_roster()?,
        "pending": db.list_pending()?,
        "scans": db.list_scans(None)?,
    });

    println!("{}", serde_json::to_string_pretty(&export)?);
    Ok(())
}

fn cmd_prune(db: &KioskDb, older_than: i64, dry_run: bool) -> Result<()> {
    if dry_run {
        println!("=== DRY RUN - no data will be deleted ===\n");

        let cutoff = prune_cutoff(Utc::now(), older_than)?;
        let pruneable = db.scans_before(cutoff)?;

        println!(
            "Would prune {} logged scans older than {} days",
            pruneable.len(),
            older_than
        );
        for scan in &pruneable {
            println!(
                "  - {} {} at {}",
                scan.decision.as_str(),
                scan.kiosk_id,
                format_time(scan.observed_at)
            );
        }
    } else {
        let pruned = db.prune_scans(older_than)?;
        println!("Pruned {} logged scans (older than {} days)", pruned, older_than);
    }

    Ok(())
}
