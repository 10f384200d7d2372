use std::io::Write;

use env_logger::Builder;

/// Console logging for the storage engine. Structural events (node
/// splits, borrows and merges, root growth and collapse, page-cache
/// eviction, flusher lifecycle) log at debug level; filter with
/// `RUST_LOG`, e.g. `RUST_LOG=small_kv=debug`.
pub fn init_log() {
    let mut builder = Builder::from_default_env();
    builder
        .format(|buf, record| {
            writeln!(
                buf,
                "{} {:<5} {} | {}",
                buf.timestamp_millis(),
                record.level(),
                record.target(),
                record.args()
            )
        })
        .init();
}
