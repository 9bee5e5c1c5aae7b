//! Secure logging example
//!
//! This example demonstrates:
//! 1. Provisioning a file-backed flash region and metadata store
//! 2. Opening the secure log (generating the device key on first run)
//! 3. Appending entries from several threads
//! 4. Draining the sealed records as a hex dump on stdout
//!
//! Run it twice: the second run finds the key and chain state from the first.

use flashlog::{
    FileMetaStore, FilePartitionTable, HexLineSink, PartitionTable, SecureLog, SecureLogConfig,
};
use std::sync::Arc;
use std::thread;

fn main() -> flashlog::Result<()> {
    flashlog::clock::mark_boot();

    let root = std::env::temp_dir().join("flashlog_example");
    println!("Using storage at: {:?}", root);

    let table = FilePartitionTable::new(root.join("partitions"))?;
    if table.find_region("log_secure")?.is_none() {
        table.provision("log_secure", 64 * 1024)?;
    }
    let meta = Arc::new(FileMetaStore::new(root.join("nvs"))?);

    let log = Arc::new(SecureLog::open(&table, meta, SecureLogConfig::default())?);

    let handles: Vec<_> = ["sensor", "net", "main"]
        .into_iter()
        .map(|tag| {
            let log = log.clone();
            thread::spawn(move || {
                for counter in 0..3 {
                    if let Err(e) = log.append_log_entry(tag, &format!("system running smoothly. counter={}", counter)) {
                        eprintln!("append failed: {}", e);
                    }
                }
            })
        })
        .collect();

    for handle in handles {
        let _ = handle.join();
    }

    let mut sink = HexLineSink::sealed(std::io::stdout().lock());
    let count = log.drain_and_emit(&mut sink)?;
    println!("dumped {} records", count);

    Ok(())
}
