/// Engram CLI - Tiered Memory Manager Command Line Tool
///
/// This is the main CLI interface for Engram, providing simple commands
/// for working with a local memory store.
///
/// Usage:
///   engramctl create <owner> <payload>    - Store a new memory
///   engramctl get <owner> <id>            - Read a payload
///   engramctl list <owner>                - List an owner's items
///   engramctl recall <owner> <query>      - Similarity search
///   engramctl meditate [--owner <owner>]  - Run a lifecycle pass
///   engramctl audit <id>                  - Show an item's audit trail
///   engramctl stats                       - Show store statistics
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use colored::*;
use engram::{
    AuditAction, AuditEntry, Category, CreateOptions, Engram, EngramConfig, EngramError,
    LifecycleState, MemoryItem, MemoryTier, SearchOptions,
};
use std::path::PathBuf;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Engram - Tiered Memory Manager
///
/// Memories start ephemeral, earn durability through use, and leave an
/// audit trail for everything that happens to them.
#[derive(Parser)]
#[command(name = "engramctl")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Data directory (default: ~/.engram/data)
    #[arg(short, long, global = true)]
    data_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Store a new memory
    ///
    /// All memories begin in the ephemeral tier. Meditation promotes the
    /// ones worth keeping.
    ///
    /// Examples:
    ///   engramctl create alice "prefers dark roast"
    ///   engramctl create alice "ssh key fingerprint" --sensitive
    ///   engramctl create alice "project deadline" --id deadline --importance 0.9
    Create {
        /// Owner of the new item
        owner: String,

        /// Payload to store
        payload: String,

        /// Explicit item id (default: random UUID)
        #[arg(long)]
        id: Option<String>,

        /// Mark as sensitive (cannot leave the ephemeral tier without consent)
        #[arg(long)]
        sensitive: bool,

        /// Grant durable-persistence consent up front
        #[arg(long)]
        consent: bool,

        /// Protect from automated pruning and demotion
        #[arg(long)]
        protected: bool,

        /// Importance hint, 0.0 to 1.0 (default: 0.5)
        #[arg(long)]
        importance: Option<f64>,
    },

    /// Read a payload
    ///
    /// Examples:
    ///   engramctl get alice deadline
    ///   engramctl get alice deadline --meta
    Get {
        /// Owner of the item
        owner: String,

        /// Item id
        id: String,

        /// Show metadata (tier, state, scores, timestamps)
        #[arg(short, long)]
        meta: bool,
    },

    /// Replace a payload in place
    Update {
        /// Owner of the item
        owner: String,

        /// Item id
        id: String,

        /// New payload
        payload: String,
    },

    /// Delete an item, leaving a tombstone
    Delete {
        /// Owner of the item
        owner: String,

        /// Item id
        id: String,
    },

    /// List an owner's items, oldest first
    ///
    /// Examples:
    ///   engramctl list alice
    ///   engramctl list alice --all    # include pruned tombstones
    List {
        /// Owner to list
        owner: String,

        /// Include pruned tombstones
        #[arg(long)]
        all: bool,
    },

    /// Similarity search over an owner's persisted items
    ///
    /// Example:
    ///   engramctl recall alice "coffee preferences" --limit 5
    Recall {
        /// Owner whose space to search
        owner: String,

        /// Query text
        query: String,

        /// Maximum number of matches (default: 10)
        #[arg(short, long)]
        limit: Option<usize>,
    },

    /// Set or clear protection against automated pruning
    ///
    /// Examples:
    ///   engramctl protect alice deadline
    ///   engramctl protect alice deadline --off
    Protect {
        /// Owner of the item
        owner: String,

        /// Item id
        id: String,

        /// Clear the protected flag instead of setting it
        #[arg(long)]
        off: bool,
    },

    /// Grant or revoke durable-persistence consent
    ///
    /// Revoking consent on a sensitive item withdraws its payload from
    /// the durable tiers immediately.
    ///
    /// Examples:
    ///   engramctl consent alice fingerprint grant
    ///   engramctl consent alice fingerprint revoke
    Consent {
        /// Owner of the item
        owner: String,

        /// Item id
        id: String,

        /// "grant" or "revoke"
        action: String,
    },

    /// Run a meditation pass now
    ///
    /// Scores every item and applies promotions, demotions, and prunes.
    ///
    /// Examples:
    ///   engramctl meditate                 # all owners
    ///   engramctl meditate --owner alice   # one owner
    Meditate {
        /// Restrict the pass to one owner
        #[arg(short, long)]
        owner: Option<String>,
    },

    /// Prune expired ephemeral items now
    Sweep,

    /// Show the audit trail of one item
    ///
    /// Example:
    ///   engramctl audit deadline --limit 20
    Audit {
        /// Item id
        id: String,

        /// Limit number of entries shown
        #[arg(short, long)]
        limit: Option<usize>,
    },

    /// Export everything recorded for one owner as JSON
    ///
    /// Examples:
    ///   engramctl export alice                     # JSON to stdout
    ///   engramctl export alice -o alice-export.json
    Export {
        /// Owner to export
        owner: String,

        /// Write to a file instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Remove every live item in an owner's space
    ///
    /// Protected items are removed too. The audit trail is retained.
    Purge {
        /// Owner to purge
        owner: String,

        /// Confirm the purge
        #[arg(long)]
        yes: bool,
    },

    /// Show or change per-tier quota for one owner
    ///
    /// Examples:
    ///   engramctl quota alice
    ///   engramctl quota alice --tier long --limit 104857600
    Quota {
        /// Owner to inspect
        owner: String,

        /// Tier to change: short, long, or object
        #[arg(short, long)]
        tier: Option<String>,

        /// New limit in bytes for the chosen tier
        #[arg(short, long)]
        limit: Option<u64>,
    },

    /// Show store statistics
    Stats,
}

/// Get the default data directory (~/.engram/data)
fn default_data_dir() -> PathBuf {
    dirs::home_dir()
        .expect("Could not determine home directory")
        .join(".engram")
        .join("data")
}

fn init_tracing() {
    // Command output goes to stdout; diagnostics stay on stderr.
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

/// Format a timestamp in a human-readable way
fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.format("%Y-%m-%d %H:%M:%S UTC").to_string()
}

/// Format a byte count in a human-readable way
fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KiB", "MiB", "GiB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{bytes} B")
    } else {
        format!("{:.1} {}", value, UNITS[unit])
    }
}

/// Color a lifecycle state by durability
fn format_state(state: LifecycleState) -> ColoredString {
    match state {
        LifecycleState::Ephemeral => "ephemeral".yellow(),
        LifecycleState::Persisted => "persisted".green(),
        LifecycleState::Archived => "archived".cyan(),
        LifecycleState::Pruned => "pruned".bright_black(),
    }
}

/// Color an audit action by effect
fn format_action(action: AuditAction) -> ColoredString {
    match action {
        AuditAction::Create => "create".green(),
        AuditAction::Update => "update".normal(),
        AuditAction::Promote => "promote".cyan(),
        AuditAction::Demote => "demote".yellow(),
        AuditAction::Prune => "prune".red(),
        AuditAction::ConsentChange => "consent-change".magenta(),
        AuditAction::Protect => "protect".blue(),
        AuditAction::Delete => "delete".red(),
        AuditAction::Export => "export".normal(),
        AuditAction::Purge => "purge".red().bold(),
    }
}

/// Print the metadata block for one item
fn print_item_meta(item: &MemoryItem) {
    println!("{}", "Metadata:".bright_black());
    println!("  State: {}", format_state(item.state));
    println!("  Tier: {}", item.tier);
    println!("  Category: {}", item.category);
    println!("  Size: {}", format_bytes(item.size));
    println!("  Importance: {:.2}", item.importance);
    println!("  Score: {:.3}", item.score);
    println!("  Accesses: {}", item.access_count);
    println!(
        "  Consent: {}",
        if item.consent { "granted".green() } else { "withheld".yellow() }
    );
    if item.protected {
        println!("  Protected: {}", "yes".blue());
    }
    println!(
        "  Created: {}",
        format_timestamp(&item.created_at).bright_black()
    );
    println!(
        "  Last access: {}",
        format_timestamp(&item.last_accessed_at).bright_black()
    );
    if let Some(seq) = item.tombstone_seq {
        println!("  Tombstone seq: {}", seq.to_string().bright_black());
    }
}

/// Print one audit entry in log style
fn print_audit_entry(entry: &AuditEntry) {
    println!(
        "  {} #{:<5} {}  {}  {}",
        "*".cyan(),
        entry.seq,
        format_timestamp(&entry.timestamp).bright_black(),
        format_action(entry.action),
        entry.actor.bright_black()
    );
    let before = entry
        .before
        .map(|s| s.to_string())
        .unwrap_or_else(|| "-".to_string());
    let after = entry
        .after
        .map(|s| s.to_string())
        .unwrap_or_else(|| "-".to_string());
    if before != after {
        println!("    {} -> {}", before, after);
    }
}

fn exit_not_found(owner: &str, id: &str) -> ! {
    eprintln!("{}", "Error".red().bold());
    eprintln!("  Item not found: {}/{}", owner, id);
    std::process::exit(1);
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing();

    let data_dir = cli.data_dir.unwrap_or_else(default_data_dir);

    let engram = Engram::open(&data_dir, EngramConfig::from_env())
        .await
        .context("Failed to open memory store")?;

    // Execute command - wrap in an async block so shutdown always runs
    let result = async {
        match cli.command {
            Commands::Create {
                owner,
                payload,
                id,
                sensitive,
                consent,
                protected,
                importance,
            } => {
                let mut opts = CreateOptions::new().consent(consent).protected(protected);
                if let Some(id) = id {
                    opts = opts.id(id);
                }
                if sensitive {
                    opts = opts.category(Category::Sensitive);
                }
                if let Some(importance) = importance {
                    opts = opts.importance(importance);
                }

                let item = engram
                    .create(&owner, payload.as_bytes(), opts)
                    .await
                    .context("Failed to store memory")?;

                println!("{}", "OK".green().bold());
                println!("  Stored: {}/{}", owner.cyan(), item.id.cyan());
                println!("  State: {}", format_state(item.state));
                println!("  Size: {}", format_bytes(item.size));
                if item.category == Category::Sensitive && !item.consent {
                    println!(
                        "  {}",
                        "Sensitive without consent: will never leave the ephemeral tier"
                            .bright_black()
                    );
                }

                Ok(())
            }

            Commands::Get { owner, id, meta } => match engram.get_payload(&owner, &id).await {
                Ok(payload) => {
                    println!("{}", String::from_utf8_lossy(&payload));

                    if meta {
                        let item = engram.get(&owner, &id)?;
                        println!();
                        print_item_meta(&item);
                    }

                    Ok(())
                }
                Err(EngramError::NotFound { .. }) => exit_not_found(&owner, &id),
                Err(e) => Err(e.into()),
            },

            Commands::Update { owner, id, payload } => {
                match engram.update(&owner, &id, payload.as_bytes()).await {
                    Ok(item) => {
                        println!("{}", "OK".green().bold());
                        println!("  Updated: {}/{}", owner.cyan(), item.id.cyan());
                        println!("  Size: {}", format_bytes(item.size));
                        Ok(())
                    }
                    Err(EngramError::NotFound { .. }) => exit_not_found(&owner, &id),
                    Err(e) => Err(e.into()),
                }
            }

            Commands::Delete { owner, id } => match engram.delete(&owner, &id).await {
                Ok(()) => {
                    println!("{}", "OK".green().bold());
                    println!("  Deleted: {}/{}", owner.cyan(), id.cyan());
                    println!("  {}", "Audit trail retained".bright_black());
                    Ok(())
                }
                Err(EngramError::NotFound { .. }) => exit_not_found(&owner, &id),
                Err(e) => Err(e.into()),
            },

            Commands::List { owner, all } => {
                let items = engram.list(&owner, all);

                if items.is_empty() {
                    println!("{}", format!("No items for owner '{}'", owner).yellow());
                    return Ok(());
                }

                println!("{}", format!("Items for '{}':", owner).bold());
                println!();
                for item in &items {
                    let mut flags = Vec::new();
                    if item.protected {
                        flags.push("protected");
                    }
                    if item.category == Category::Sensitive {
                        flags.push("sensitive");
                    }
                    let flags = if flags.is_empty() {
                        String::new()
                    } else {
                        format!(" [{}]", flags.join(", "))
                    };

                    println!(
                        "  {} {}  {}  {}{}",
                        "*".cyan(),
                        item.id.bright_white(),
                        format_state(item.state),
                        format_bytes(item.size).bright_black(),
                        flags.bright_black()
                    );
                }
                println!();
                println!(
                    "  {} {} total",
                    items.len(),
                    if items.len() == 1 { "item" } else { "items" }
                );

                Ok(())
            }

            Commands::Recall { owner, query, limit } => {
                let opts = SearchOptions::new().top_k(limit.unwrap_or(10));
                let matches = engram
                    .recall(&owner, query.as_bytes(), &opts)
                    .await
                    .context("Search failed")?;

                if matches.is_empty() {
                    println!("{}", "No matches among persisted items".yellow());
                    return Ok(());
                }

                println!(
                    "{} ({} {})",
                    "Recall results:".bold(),
                    matches.len(),
                    if matches.len() == 1 { "match" } else { "matches" }
                );
                println!();
                for m in &matches {
                    println!(
                        "  {} {}  score {:.3}",
                        "*".cyan(),
                        m.item_id.bright_white(),
                        m.score
                    );
                    if let Ok(item) = engram.get(&owner, &m.item_id) {
                        println!(
                            "    {} {}",
                            format_state(item.state),
                            format_bytes(item.size).bright_black()
                        );
                    }
                }

                Ok(())
            }

            Commands::Protect { owner, id, off } => {
                match engram.protect(&owner, &id, !off).await {
                    Ok(item) => {
                        println!("{}", "OK".green().bold());
                        println!(
                            "  {}: {}/{}",
                            if item.protected { "Protected" } else { "Unprotected" },
                            owner.cyan(),
                            item.id.cyan()
                        );
                        Ok(())
                    }
                    Err(EngramError::NotFound { .. }) => exit_not_found(&owner, &id),
                    Err(e) => Err(e.into()),
                }
            }

            Commands::Consent { owner, id, action } => {
                let grant = match action.as_str() {
                    "grant" => true,
                    "revoke" => false,
                    other => {
                        anyhow::bail!("Invalid consent action '{}'. Use 'grant' or 'revoke'.", other)
                    }
                };

                match engram.set_consent(&owner, &id, grant).await {
                    Ok(item) => {
                        println!("{}", "OK".green().bold());
                        println!(
                            "  Consent {}: {}/{}",
                            if grant { "granted".green() } else { "revoked".yellow() },
                            owner.cyan(),
                            id.cyan()
                        );
                        println!("  State: {}", format_state(item.state));
                        if !grant && item.state == LifecycleState::Pruned {
                            println!(
                                "  {}",
                                "Payload removed from durable storage; audit trail retained"
                                    .bright_black()
                            );
                        }
                        Ok(())
                    }
                    Err(EngramError::NotFound { .. }) => exit_not_found(&owner, &id),
                    Err(e) => Err(e.into()),
                }
            }

            Commands::Meditate { owner } => {
                match owner {
                    Some(owner) => {
                        let report = engram
                            .meditate_owner(&owner)
                            .await
                            .context("Meditation pass failed")?;

                        println!("{}", format!("Meditation for '{}':", owner).bold());
                        println!("  Scanned: {}", report.scanned);
                        println!("  Promoted: {}", report.promoted.to_string().cyan());
                        println!("  Archived: {}", report.archived.to_string().yellow());
                        println!("  Pruned: {}", report.pruned.to_string().red());
                        println!("  Skipped: {}", report.skipped);
                        if report.retries > 0 {
                            println!("  Retries: {}", report.retries.to_string().yellow());
                        }
                    }
                    None => {
                        let report = engram.meditate().await;

                        println!("{}", "Meditation pass:".bold());
                        println!("  Scanned: {}", report.scanned());
                        println!("  Promoted: {}", report.promoted().to_string().cyan());
                        println!("  Archived: {}", report.archived().to_string().yellow());
                        println!("  Pruned: {}", report.pruned().to_string().red());
                        println!();

                        for partition in &report.partitions {
                            println!(
                                "  {} {}  {} scanned, {} promoted, {} archived, {} pruned",
                                "*".cyan(),
                                partition.owner.bright_white(),
                                partition.scanned,
                                partition.promoted,
                                partition.archived,
                                partition.pruned
                            );
                        }
                        for owner in &report.failed_partitions {
                            println!("  {} {}  {}", "*".red(), owner, "failed".red().bold());
                        }
                    }
                }

                // Persist the outcome so a crash cannot undo the pass.
                engram.save().await.context("Failed to save snapshots")?;
                Ok(())
            }

            Commands::Sweep => {
                let swept = engram.sweep_expired().await.context("Sweep failed")?;
                println!("{}", "OK".green().bold());
                println!(
                    "  {} expired {} pruned",
                    swept,
                    if swept == 1 { "item" } else { "items" }
                );
                Ok(())
            }

            Commands::Audit { id, limit } => {
                let trail = engram.audit_trail(&id);

                let entries: Vec<&AuditEntry> = if let Some(limit) = limit {
                    trail.iter().rev().take(limit).collect()
                } else {
                    trail.iter().rev().collect()
                };

                if entries.is_empty() {
                    println!("{}", "No audit entries found".yellow());
                    return Ok(());
                }

                println!("{}", format!("Audit trail for '{}':", id).bold());
                println!();
                for entry in entries {
                    print_audit_entry(entry);
                }
                println!();
                println!(
                    "  {} {} total",
                    trail.len(),
                    if trail.len() == 1 { "entry" } else { "entries" }
                );

                Ok(())
            }

            Commands::Export { owner, output } => {
                let export = engram
                    .export_owner(&owner)
                    .await
                    .context("Export failed")?;

                let json = serde_json::to_string_pretty(&export)
                    .context("Failed to serialize export")?;

                match output {
                    Some(path) => {
                        std::fs::write(&path, &json).with_context(|| {
                            format!("Failed to write export to {}", path.display())
                        })?;
                        println!("{}", "OK".green().bold());
                        println!("  Exported: {}", owner.cyan());
                        println!("  Items: {}", export.items.len());
                        println!("  Audit entries: {}", export.audit.len());
                        println!("  Written to: {}", path.display());
                    }
                    None => println!("{}", json),
                }

                Ok(())
            }

            Commands::Purge { owner, yes } => {
                if !yes {
                    anyhow::bail!(
                        "Purge removes every item for '{}', protected ones included.\n\
                         Re-run with --yes to confirm.",
                        owner
                    );
                }

                let report = engram.purge_owner(&owner).await.context("Purge failed")?;

                println!("{}", "OK".green().bold());
                println!("  Purged: {}", owner.cyan());
                println!("  Items removed: {}", report.items_purged);
                println!("  Bytes freed: {}", format_bytes(report.bytes_freed));
                println!("  {}", "Audit trail retained".bright_black());

                Ok(())
            }

            Commands::Quota { owner, tier, limit } => {
                if let Some(limit) = limit {
                    let tier_name = tier
                        .as_deref()
                        .context("--limit requires --tier (short, long, or object)")?;
                    let tier: MemoryTier = tier_name
                        .parse()
                        .map_err(|e: String| anyhow::anyhow!(e))?;

                    engram.set_quota_limit(&owner, tier, limit);
                    println!("{}", "OK".green().bold());
                    println!(
                        "  Limit for {}/{} set to {}",
                        owner.cyan(),
                        tier,
                        format_bytes(limit)
                    );
                    println!();
                }

                println!("{}", format!("Quota for '{}':", owner).bold());
                println!();
                for tier in MemoryTier::all() {
                    let counter = engram.quota_usage(&owner, tier);
                    let pct = counter.utilization() * 100.0;
                    let pct = if pct >= 90.0 {
                        format!("{pct:.0}%").red()
                    } else if pct >= 70.0 {
                        format!("{pct:.0}%").yellow()
                    } else {
                        format!("{pct:.0}%").green()
                    };

                    println!(
                        "  {} {:<7} used {:>10}  reserved {:>10}  limit {:>10}  {}",
                        "*".cyan(),
                        tier.to_string(),
                        format_bytes(counter.used),
                        format_bytes(counter.reserved),
                        format_bytes(counter.limit),
                        pct
                    );
                }

                Ok(())
            }

            Commands::Stats => {
                let stats = engram.stats();

                println!("{}", "Engram Status".bold().cyan());
                println!();
                println!(
                    "  {} {} ({} live)",
                    "Items:".bright_white(),
                    stats.items.total_items,
                    stats.items.live_items()
                );
                println!("    ephemeral: {}", stats.items.ephemeral);
                println!("    persisted: {}", stats.items.persisted);
                println!("    archived: {}", stats.items.archived);
                println!("    tombstones: {}", stats.items.tombstones);
                println!();
                println!(
                    "  {} {}",
                    "Index entries:".bright_white(),
                    stats.items.indexed
                );
                println!(
                    "  {} {}",
                    "Audit entries:".bright_white(),
                    stats.items.audit_entries
                );
                println!();
                println!("{}", "Operations since start:".bright_white());
                println!(
                    "  creates {} / updates {} / deletes {}",
                    stats.operations.creates, stats.operations.updates, stats.operations.deletes
                );
                println!(
                    "  promotions {} / demotions {} / prunes {}",
                    stats.operations.promotions,
                    stats.operations.demotions,
                    stats.operations.prunes
                );
                println!(
                    "  reads {} (hit rate {:.0}%), quota rejections {}",
                    stats.operations.payload_reads,
                    stats.operations.read_hit_rate() * 100.0,
                    stats.operations.quota_rejections
                );
                println!();
                println!("{}", "Ephemeral tier:".bright_white());
                println!(
                    "  {} / {} entries ({:.0}% full), {} evictions",
                    stats.short_tier.current_size,
                    stats.short_tier.capacity,
                    stats.short_tier.utilization() * 100.0,
                    stats.short_tier.evictions
                );
                println!();
                println!("  {} {}", "Store:".bright_black(), data_dir.display());

                Ok(())
            }
        }
    }
    .await;

    // Shutdown writes final snapshots and stops background tasks
    engram.shutdown().await.ok();

    result
}
