//! `tracing` subscriber setup for binaries and tests.

use tracing::Level;

/// Installs a formatting subscriber at `level`. Does nothing if one is already set.
pub fn init(level: Level) {
  let _ = tracing_subscriber::fmt()
    .with_max_level(level)
    .with_target(false)
    .try_init();
}

/// Installs a subscriber that writes through the test harness's capture.
pub fn init_for_tests() {
  let _ = tracing_subscriber::fmt()
    .with_max_level(Level::DEBUG)
    .with_test_writer()
    .try_init();
}
