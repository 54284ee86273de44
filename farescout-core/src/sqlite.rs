use rusqlite::Connection;

/// Applied to every connection the crate opens. WAL keeps concurrent readers
/// from blocking the scrape path while another process sweeps the cache.
pub fn configure_connection(conn: &Connection, busy_timeout_ms: u32) -> rusqlite::Result<()> {
    conn.execute_batch(&format!(
        "PRAGMA journal_mode = WAL;\n\
         PRAGMA synchronous = NORMAL;\n\
         PRAGMA cache_size = -16000;\n\
         PRAGMA temp_store = MEMORY;\n\
         PRAGMA busy_timeout = {busy_timeout_ms};\n",
    ))
}
