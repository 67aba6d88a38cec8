//! Process-wide logger setup for keyward binaries.

use env_logger::{Builder, Env};

/// Install the `env_logger` backend.
///
/// `RUST_LOG` wins when set; otherwise `default_level` applies. Calling this more
/// than once is harmless, later calls are ignored.
pub fn init(default_level: &str) {
    let env = Env::default().default_filter_or(default_level);
    let _ = Builder::from_env(env)
        .format_timestamp_millis()
        .format_target(false)
        .try_init();
}
