//! Cachestore main program entry

use cachestore::{CacheTable, CacheTableConfig};

// Use jemalloc as global allocator
#[global_allocator]
static GLOBAL: jemallocator::Jemalloc = jemallocator::Jemalloc;

fn main() {
    println!("Cachestore page cache starting...");

    let config = match std::env::args().nth(1) {
        Some(path) => match CacheTableConfig::from_json_file(&path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("Failed to load config {}: {}", path, e);
                std::process::exit(1);
            }
        },
        None => CacheTableConfig::default(),
    };
    println!(
        "Configured: size_limit={} bytes, workers_per_core={}, data_dir={}",
        config.size_limit, config.workers_per_core, config.data_dir
    );

    let cache = CacheTable::new(config);
    let stats = cache.stats();
    println!(
        "Cache online: {} pages cached, {} files open",
        stats.n_in_table, stats.n_files
    );

    if let Err(e) = cache.close() {
        eprintln!("Shutdown error: {}", e);
        std::process::exit(1);
    }
    println!("Cachestore page cache shut down cleanly");
}
