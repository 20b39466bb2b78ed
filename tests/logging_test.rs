//! Installs the process-wide tracing subscriber, so it lives in its own test
//! binary where it cannot interfere with `#[traced_test]` log capture.

use sem_scan::logging::{init, LoggingConfig, OutputFormat};
use tracing::Level;

#[test]
fn init_is_idempotent() {
    let config = LoggingConfig::new(Level::WARN);
    assert!(init(config.clone().with_format(OutputFormat::Json)).is_ok());
    assert!(init(config).is_ok());
}
