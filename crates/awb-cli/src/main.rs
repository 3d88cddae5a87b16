use anyhow::{Context, Result};
use awb_core::{ChangeKind, DiffBlock, DiffSummary};
use awb_diff::{compute_diff, contents_equal, group_into_blocks, summarize};
use awb_storage::{SnapshotCache, SqliteStore};
use clap::{Parser, Subcommand};
use std::fs;
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "awb")]
#[command(about = "Agent Workbench snapshot diff CLI", long_about = None)]
struct Cli {
    /// Snapshot database path; defaults under the user data directory.
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Diff two files line by line
    Diff {
        old: PathBuf,
        new: PathBuf,
        /// Unchanged lines kept around each change
        #[arg(long, default_value_t = 3)]
        context: usize,
    },
    /// Manage last-viewed snapshots
    Snapshot {
        #[command(subcommand)]
        action: SnapshotCommands,
    },
}

#[derive(Subcommand)]
enum SnapshotCommands {
    /// Show changes since the last view, then record the current content
    View {
        session: String,
        file: PathBuf,
        #[arg(long, default_value_t = 3)]
        context: usize,
    },
    /// Drop one snapshot, or every snapshot of the session
    Clear {
        session: String,
        /// Logical file path of a single snapshot to drop
        #[arg(long)]
        file: Option<String>,
    },
    /// Print cache occupancy for the session
    Stats { session: String },
    /// Drop every snapshot across all sessions
    Purge,
}

fn main() -> Result<()> {
    init_logging();
    let cli = Cli::parse();

    match cli.command {
        Commands::Diff { old, new, context } => {
            let old_text = read_file(&old)?;
            let new_text = read_file(&new)?;
            if contents_equal(&old_text, &new_text) {
                println!("Files are identical.");
                return Ok(());
            }
            let changes = compute_diff(&old_text, &new_text);
            print_blocks(&group_into_blocks(&changes, context));
            print_summary(&summarize(&changes));
        }
        Commands::Snapshot { action } => {
            let cache = open_cache(cli.db)?;
            run_snapshot(&cache, action)?;
        }
    }

    Ok(())
}

fn run_snapshot(cache: &SnapshotCache<SqliteStore>, action: SnapshotCommands) -> Result<()> {
    match action {
        SnapshotCommands::View {
            session,
            file,
            context,
        } => {
            let current = read_file(&file)?;
            let logical_path = file.display().to_string();

            match cache.cached(&session, &logical_path) {
                None => println!("No previous snapshot for {logical_path} in session {session}."),
                Some(entry) if contents_equal(&entry.content, &current) => {
                    println!("No changes since last view ({}).", entry.viewed_at);
                }
                Some(entry) => {
                    let changes = compute_diff(&entry.content, &current);
                    print_blocks(&group_into_blocks(&changes, context));
                    print_summary(&summarize(&changes));
                }
            }

            if !cache.store(&session, &logical_path, &current) {
                println!("Note: could not record the snapshot; next view diffs against the old one.");
            }
        }
        SnapshotCommands::Clear { session, file } => {
            cache.clear(&session, file.as_deref());
            println!("Cleared.");
        }
        SnapshotCommands::Stats { session } => {
            let stats = cache.stats(&session);
            println!("Session entries: {}", stats.session_entries);
            println!("Total entries:   {}", stats.total_entries);
            println!("Estimated bytes: {}", stats.estimated_bytes);
        }
        SnapshotCommands::Purge => {
            cache.clear_all();
            println!("All snapshots dropped.");
        }
    }
    Ok(())
}

fn print_blocks(blocks: &[DiffBlock]) {
    for block in blocks {
        println!("@@ lines {}-{} @@", block.start_line, block.end_line);
        for change in &block.changes {
            match change.kind {
                ChangeKind::Added => println!("+{:>5} {}", change.line_number, change.text),
                ChangeKind::Deleted => println!("-      {}", change.text),
                ChangeKind::Unchanged => println!(" {:>5} {}", change.line_number, change.text),
            }
        }
    }
}

fn print_summary(summary: &DiffSummary) {
    println!(
        "+{} -{} ({} unchanged)",
        summary.additions, summary.deletions, summary.unchanged
    );
}

fn read_file(path: &Path) -> Result<String> {
    fs::read_to_string(path).with_context(|| format!("Failed to read {}", path.display()))
}

fn open_cache(db: Option<PathBuf>) -> Result<SnapshotCache<SqliteStore>> {
    let path = match db {
        Some(path) => path,
        None => default_db_path()?,
    };
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    let store = SqliteStore::open(&path)
        .with_context(|| format!("Failed to open snapshot store at {}", path.display()))?;
    Ok(SnapshotCache::new(store))
}

fn default_db_path() -> Result<PathBuf> {
    let base = dirs::data_dir().context("Could not resolve a user data directory")?;
    Ok(base.join("awb").join("snapshots.db"))
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}
