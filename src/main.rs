//! coldsnap - incremental block-level backup and restore

use clap::Parser;
use coldsnap::backup::backup;
use coldsnap::cancel::CancelToken;
use coldsnap::cli::{Cli, Commands};
use coldsnap::restore::{restore_latest, restore_level, verify_level};
use coldsnap::storage::LocalStore;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    init_tracing(cli.verbose, cli.json);

    let cancel = CancelToken::new();
    // Ctrl+C or a TERM requests a clean stop at the next entry boundary
    for sig in [signal_hook::consts::SIGINT, signal_hook::consts::SIGTERM] {
        signal_hook::flag::register(sig, cancel.flag())?;
    }

    match cli.command {
        Commands::Backup(args) => {
            let config = args.to_config(cli.verbose)?;
            let store = LocalStore::new(&args.store);
            let stats = backup(&config, &args.source, &store, &cancel)?;
            println!(
                "files: {} ({} full, {} delta, {} unchanged), dirs: {}, deleted: {}",
                stats.total_files,
                stats.files_full,
                stats.files_delta,
                stats.files_unchanged,
                stats.total_directories,
                stats.files_deleted,
            );
            println!(
                "read {} bytes, wrote {} bytes in {} segments",
                stats.bytes_on_disk, stats.bytes_compressed, stats.segments,
            );
            for path in &stats.broken_links {
                eprintln!("warning: skipped unreadable entry: {}", path);
            }
        }

        Commands::Restore(args) => {
            let store = LocalStore::new(&args.store);
            let pass_file = args.encrypt_pass_file.as_deref();
            let stats = match args.level {
                Some(level) => restore_level(&store, level, &args.target, pass_file, &cancel)?,
                None => restore_latest(&store, &args.target, pass_file, &cancel)?,
            };
            println!(
                "restored {} files ({} patched), {} dirs, deleted {}, wrote {} bytes",
                stats.files_restored,
                stats.files_patched,
                stats.directories_restored,
                stats.entries_deleted,
                stats.bytes_written,
            );
            for warning in &stats.warnings {
                eprintln!("warning: {}", warning);
            }
        }

        Commands::Verify(args) => {
            let store = LocalStore::new(&args.store);
            let pass_file = args.encrypt_pass_file.as_deref();
            let levels = match args.level {
                Some(level) => level..=level,
                None => {
                    let latest = store
                        .latest_level()?
                        .ok_or_else(|| anyhow::anyhow!("store holds no backup levels"))?;
                    0..=latest
                }
            };
            for level in levels {
                let stats = verify_level(&store, level, pass_file, &cancel)?;
                println!(
                    "level {}: {} tokens, {} files, {} dirs, {} deletions, {} content bytes",
                    level,
                    stats.tokens,
                    stats.files,
                    stats.directories,
                    stats.deletions,
                    stats.content_bytes,
                );
            }
        }

        Commands::Info(args) => {
            let store = LocalStore::new(&args.store);
            match store.latest_level()? {
                None => println!("store holds no backup levels"),
                Some(latest) => {
                    for level in 0..=latest {
                        match store.load_run_metadata(level) {
                            Ok(run) => println!(
                                "level {}: engine {}, compression {}, encrypted: {}, {} segments",
                                level,
                                run.engine,
                                run.compression,
                                run.encrypted,
                                run.segment_count,
                            ),
                            Err(e) => println!("level {}: unreadable ({})", level, e),
                        }
                    }
                }
            }
        }
    }

    Ok(())
}

fn init_tracing(verbose: u8, json: bool) {
    let filter = match verbose {
        0 => EnvFilter::new("coldsnap=info"),
        1 => EnvFilter::new("coldsnap=debug"),
        2 => EnvFilter::new("coldsnap=trace"),
        _ => EnvFilter::new("trace"),
    };

    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().pretty())
            .init();
    }
}
