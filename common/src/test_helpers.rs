/// Shared Test Helpers for Cross-Crate Use
///
/// This module provides centralized test utilities used by the `engine`
/// crate's test suites to avoid code duplication.
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

// Global counter for truly unique test identifiers across parallel tests
static GLOBAL_TEST_COUNTER: AtomicU64 = AtomicU64::new(1);

/// Generate globally unique test identifiers that won't conflict across parallel tests
///
/// This creates IDs using timestamp + atomic counter to ensure uniqueness even when
/// running tests in parallel across multiple threads and crates.
///
/// # Arguments
/// * `prefix` - A string prefix to identify the test type (e.g., "BIZ", "SEG")
///
/// # Returns
/// A unique string in the format: "{prefix}-{timestamp}-{counter}"
pub fn generate_unique_id(prefix: &str) -> String {
    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_millis();
    let counter = GLOBAL_TEST_COUNTER.fetch_add(1, Ordering::SeqCst);
    format!("{}-{}-{}", prefix, timestamp, counter)
}

/// Generate a unique numeric test ID for ModelId usage
pub fn generate_unique_test_id() -> u64 {
    let timestamp = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_millis() as u64;
    let counter = GLOBAL_TEST_COUNTER.fetch_add(1, Ordering::SeqCst);
    (timestamp % 100_000) * 1_000_000 + counter
}

/// Get the test database URL from environment or default
///
/// The engine's tests run against an in-memory SQLite database unless a
/// DATABASE_URL is supplied.
pub fn get_test_database_url() -> String {
    std::env::var("DATABASE_URL").unwrap_or_else(|_| "sqlite::memory:".to_string())
}
