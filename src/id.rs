//! ID generation utilities for Draftwright
//!
//! Request ids tie log lines and error frames of one run together.

use rand::Rng;

/// Get current timestamp in milliseconds since Unix epoch
pub fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

/// Generate a request ID
///
/// Format: `req-{timestamp_ms}-{random_hex}`
/// Example: `req-1738300800123-a1b2c3d4`
pub fn generate_request_id() -> String {
    let random: u32 = rand::rng().random();
    format!("req-{}-{:08x}", now_ms(), random)
}
