use serde::{Deserialize, Serialize};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

// Get current timestamp in milliseconds
pub fn get_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::from_secs(0))
        .as_millis() as u64
}

/// Process memory footprint in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryUsage {
    pub resident_bytes: u64,
    pub virtual_bytes: u64,
}

// Read /proc/self/statm (sizes in pages). None on platforms without procfs.
pub fn memory_usage() -> Option<MemoryUsage> {
    let statm = std::fs::read_to_string("/proc/self/statm").ok()?;
    parse_statm(&statm, 4096)
}

fn parse_statm(statm: &str, page_size: u64) -> Option<MemoryUsage> {
    let mut fields = statm.split_whitespace();
    let virtual_pages: u64 = fields.next()?.parse().ok()?;
    let resident_pages: u64 = fields.next()?.parse().ok()?;
    Some(MemoryUsage {
        resident_bytes: resident_pages * page_size,
        virtual_bytes: virtual_pages * page_size,
    })
}

// Random lowercase alphanumeric suffix for generated ids
pub fn random_suffix(len: usize) -> String {
    use rand::distributions::Alphanumeric;
    use rand::Rng;

    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(|c| char::from(c).to_ascii_lowercase())
        .collect()
}
