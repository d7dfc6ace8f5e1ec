use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use shaman_checkout::FileEntry;
use shaman_config::logging::{init_logging, LogLevel};
use shaman_config::{log_server_info, Config};
use shaman_gc::GcStats;
use shaman_server::Shaman;
use shaman_store::BlobKey;
use tokio::signal;

#[derive(Parser)]
#[command(name = "shamand")]
#[command(version, about = "Shaman render farm file store", long_about = None)]
struct Cli {
    /// Configuration file (default: ~/.shaman/config.toml, then ./shaman.toml)
    #[arg(short, long, global = true, env = "SHAMAN_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the file store with its background tasks (default)
    Serve,

    /// Run one garbage collection
    Gc {
        /// Report what would be deleted without deleting it
        #[arg(long)]
        dry_run: bool,

        /// Print statistics as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show the status of one blob
    Status { checksum: String, size: u64 },

    /// Create a checkout from a JSON list of {checksum, size, path}
    Checkout { checkout_id: String, entries: PathBuf },

    /// Show file store statistics
    Stats,

    /// Print the default configuration
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => Config::load_from(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => Config::load().context("Failed to load config")?,
    };

    let level = config.logging.level.parse::<LogLevel>().unwrap_or(LogLevel::Info);
    init_logging(level);

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => serve(config).await,
        Commands::Gc { dry_run, json } => run_gc(config, dry_run, json).await,
        Commands::Status { checksum, size } => status(config, checksum, size),
        Commands::Checkout {
            checkout_id,
            entries,
        } => checkout(config, &checkout_id, &entries),
        Commands::Stats => stats(config),
        Commands::Config => {
            print!("{}", Config::default_toml());
            Ok(())
        }
    }
}

async fn serve(config: Config) -> Result<()> {
    let mut shaman = Shaman::new(config).context("Failed to start Shaman")?;
    shaman.start();

    signal::ctrl_c().await.context("Failed to listen for Ctrl-C")?;
    log_server_info!("Received Ctrl-C, shutting down");

    shaman.shutdown().await;
    Ok(())
}

async fn run_gc(config: Config, dry_run: bool, json: bool) -> Result<()> {
    let shaman = Shaman::new(config)?;
    let stats = shaman.garbage_collect(dry_run).await?;

    if json {
        println!("{}", serde_json::to_string_pretty(&stats)?);
    } else {
        print_gc_stats(&stats);
    }
    Ok(())
}

fn print_gc_stats(stats: &GcStats) {
    println!();
    if stats.dry_run {
        println!("🔍 Garbage collection (dry run)");
    } else {
        println!("🗑️  Garbage collection");
    }
    println!();
    println!("  Symlinks checked:  {:>12}", format_number(stats.num_symlinks_checked));
    println!("  Old files:         {:>12}", format_number(stats.num_old_files));
    println!("  Still in use:      {:>12}", format_number(stats.num_still_used_old_files));
    println!("  Unused:            {:>12}", format_number(stats.num_unused_old_files));
    println!("  Recently touched:  {:>12}", format_number(stats.num_recently_touched));
    println!();

    let verb = if stats.dry_run { "Would delete" } else { "Deleted" };
    println!(
        "  {}: {} files, {}",
        verb,
        format_number(stats.num_files_deleted),
        format_bytes(stats.bytes_deleted)
    );
    if stats.num_files_not_deleted > 0 {
        println!(
            "  ⚠️  Could not delete {} files (see log)",
            format_number(stats.num_files_not_deleted)
        );
    }
    if stats.aborted {
        println!("  ⚠️  Collection was interrupted");
    }
}

fn status(config: Config, checksum: String, size: u64) -> Result<()> {
    let shaman = Shaman::new(config)?;
    let key = BlobKey::new(checksum, size)?;
    println!("{}", shaman.file_status(&key)?);
    Ok(())
}

fn checkout(config: Config, checkout_id: &str, entries_path: &Path) -> Result<()> {
    let raw = std::fs::read_to_string(entries_path)
        .with_context(|| format!("Failed to read {}", entries_path.display()))?;
    let entries: Vec<FileEntry> = serde_json::from_str(&raw)
        .with_context(|| format!("Failed to parse {}", entries_path.display()))?;

    let shaman = Shaman::new(config)?;
    let required = shaman.requirements(&entries)?;
    if !required.is_empty() {
        println!("{} files are not stored yet:", required.len());
        for file in &required {
            println!("  {:<10} {}", file.status.as_str(), file.entry.path);
        }
        anyhow::bail!("checkout {} is incomplete", checkout_id);
    }

    let paths = shaman.create_checkout(checkout_id, &entries)?;
    println!("{}", paths.absolute_path.display());
    Ok(())
}

fn stats(config: Config) -> Result<()> {
    let shaman = Shaman::new(config)?;
    let stats = shaman.store_stats()?;

    println!();
    println!("📊 Shaman file store");
    println!();
    println!(
        "  Stored:     {:>12} files  {:>12}",
        format_number(stats.stored_files),
        format_bytes(stats.stored_bytes)
    );
    println!(
        "  Uploading:  {:>12} files  {:>12}",
        format_number(stats.uploading_files),
        format_bytes(stats.uploading_bytes)
    );
    println!("  Avg blob:   {:>12}", format_bytes(stats.avg_blob_size()));
    Ok(())
}

fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} bytes", bytes)
    }
}

/// Format number with comma separators
fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::new();
    for (i, c) in s.chars().rev().enumerate() {
        if i > 0 && i % 3 == 0 {
            result.push(',');
        }
        result.push(c);
    }
    result.chars().rev().collect()
}
