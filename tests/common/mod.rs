//! Shared setup for the integration suites

use std::sync::Once;

static TRACING: Once = Once::new();

/// Route engine diagnostics (propagation and cascade warnings) into the
/// captured output of the running test.
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    });
}
