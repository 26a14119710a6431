//! xa_coordinator - journal inspection tool
//!
//! Loads `config/<env>.yaml`, reads the configured journal without modifying
//! it and reports what a recovery run would have to deal with:
//!
//! ```text
//! ┌──────────┐    ┌──────────┐    ┌──────────────────┐
//! │  Config  │───▶│ Journal  │───▶│ Dangling records │
//! │  (YAML)  │    │(CRC+bin) │    │  + pool summary  │
//! └──────────┘    └──────────┘    └──────────────────┘
//! ```
//!
//! Flags: `--env <name>` (default `dev`), `--records` to dump every record.

use anyhow::Context;

use xa_coordinator::config::{AppConfig, JournalKind};
use xa_coordinator::journal::disk::{read_dangling, read_records};
use xa_coordinator::logging::init_logging;

fn get_env() -> String {
    let args: Vec<String> = std::env::args().collect();
    for i in 0..args.len() {
        if (args[i] == "--env" || args[i] == "-e") && i + 1 < args.len() {
            return args[i + 1].clone();
        }
    }
    "dev".to_string()
}

fn dump_records() -> bool {
    std::env::args().any(|a| a == "--records")
}

fn main() -> anyhow::Result<()> {
    let env = get_env();
    let app_config = AppConfig::load_env(&env)
        .with_context(|| format!("loading configuration for env {}", env))?;
    let _log_guard = init_logging(&app_config);

    println!(
        "=== xa_coordinator {} ({}) ===",
        env!("CARGO_PKG_VERSION"),
        env!("GIT_HASH")
    );
    tracing::info!(env = %env, "Starting journal inspection");

    if app_config.journal.kind != JournalKind::Disk {
        println!("\n[Journal] in-memory journal, nothing persisted to inspect");
        return Ok(());
    }
    let path = &app_config.journal.path;

    // Read-only: a torn tail is reported by the scan, never truncated
    if dump_records() {
        let records = read_records(path).with_context(|| format!("reading journal {}", path))?;
        println!("\n[Journal] {} record(s)", records.len());
        for record in &records {
            println!(
                "  #{:<6} {} {:<13} [{}]",
                record.sequence,
                record.gtrid,
                record.status.as_str(),
                record.resources.join(", ")
            );
        }
    }

    let mut dangling: Vec<_> = read_dangling(path)
        .with_context(|| format!("collecting dangling records from {}", path))?
        .into_values()
        .collect();
    dangling.sort_by_key(|record| record.sequence);

    println!("\n[Dangling] {} transaction(s)", dangling.len());
    for record in &dangling {
        let decision = record
            .decision
            .map(|d| d.to_string())
            .unwrap_or_else(|| "none".to_string());
        println!(
            "  {} last={} decision={} server={} resources=[{}]",
            record.gtrid,
            record.last_status.as_str(),
            decision,
            record.gtrid.server_id(),
            record.resources.join(", ")
        );
    }

    println!("\n[Pools] {} configured", app_config.pools.len());
    for pool in &app_config.pools {
        println!(
            "  {} min={} max={} test_query={} keep_open={}",
            pool.unique_name,
            pool.min_pool_size,
            pool.max_pool_size,
            pool.test_query.as_deref().unwrap_or("-"),
            pool.keep_connection_open_until_after_2pc
        );
    }

    tracing::info!(dangling = dangling.len(), "Journal inspection finished");
    Ok(())
}
