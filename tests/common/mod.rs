//! Shared test utilities

use murmur::{store, DbPool, Settings};

/// Baseline settings for tests (in-memory, no wake word, short timeouts)
#[must_use]
pub fn test_settings() -> Settings {
    Settings::for_tests()
}

/// Set up an in-memory test store
#[must_use]
pub fn setup_test_db() -> DbPool {
    store::init_memory().expect("failed to init test store")
}
