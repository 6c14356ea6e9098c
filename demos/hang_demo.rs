//! Demonstrates hang detection on a page lock that is never released.
//!
//! One worker walks a small "B+Tree" path, taking read locks on inner pages
//! and a write lock on a leaf, then stalls while holding the leaf. The hang
//! monitor notices after the threshold and logs a dump.

use clap::Parser;
use pagelock_diag::{
    BeanName, DiagnosticsConfig, DiagnosticsService, LockMode, ManagementDirectory, PageId,
};
use std::path::PathBuf;
use std::thread;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(about = "Page lock hang detection demo")]
struct Args {
    /// Hang threshold in milliseconds
    #[arg(long, default_value_t = 500)]
    threshold_ms: u64,

    /// Monitor scan interval in milliseconds
    #[arg(long, default_value_t = 100)]
    scan_interval_ms: u64,

    /// How long the worker stalls while holding the leaf lock
    #[arg(long, default_value_t = 1500)]
    stall_ms: u64,

    /// Directory for dump files
    #[arg(long)]
    dump_dir: Option<PathBuf>,
}

#[tokio::main]
async fn main() {
    // Initialize logging
    tracing_subscriber::fmt::init();
    let args = Args::parse();

    println!("=== Page lock hang demo ===\n");

    let service = DiagnosticsService::start(
        "demo-node",
        DiagnosticsConfig {
            hang_threshold_ms: args.threshold_ms,
            scan_interval_ms: args.scan_interval_ms,
            dump_dir: args.dump_dir.clone(),
            ..Default::default()
        },
        ManagementDirectory::platform(),
        &tokio::runtime::Handle::current(),
    );

    let registry = service.registry().clone();
    let stall = Duration::from_millis(args.stall_ms);
    let worker = thread::Builder::new()
        .name("btree-worker".into())
        .spawn(move || {
            let mut op = registry.begin_current_thread().unwrap();
            let root = PageId::new(1, 1);
            let inner = PageId::new(1, 17);
            let leaf = PageId::new(1, 342);

            op.on_lock(root, LockMode::Read);
            op.on_lock(inner, LockMode::Read);
            op.on_unlock(root, LockMode::Read);
            op.before_lock(leaf, LockMode::Write);
            op.on_lock(leaf, LockMode::Write);
            println!("  worker: holding WRITE on {} for {:?}", leaf, stall);
            thread::sleep(stall);
            op.on_unlock(leaf, LockMode::Write);
            op.on_unlock(inner, LockMode::Read);
            println!("  worker: released");
        })
        .unwrap();

    tokio::time::sleep(Duration::from_millis(args.threshold_ms / 2)).await;

    println!("\nOn-demand dump through the management bean:");
    let bean = ManagementDirectory::platform()
        .lookup(&BeanName::page_lock_tracker("demo-node"))
        .unwrap();
    println!("{}", bean.dump_locked_pages().unwrap());

    tokio::task::spawn_blocking(move || worker.join().unwrap())
        .await
        .unwrap();

    println!("Metrics:");
    for (name, value) in service.diagnostics().metrics().iter() {
        println!("  {} = {}", name, value);
    }

    service.stop().await;
}
