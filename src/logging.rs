//! Logger installation for binaries. The library itself only uses `log`.

use env_logger::{Builder, Env};

/// Install a stderr logger at `default_level` unless `RUST_LOG` says
/// otherwise. Safe to call more than once; later calls are ignored.
pub fn init(default_level: &str) {
    let _ = Builder::from_env(Env::default().default_filter_or(default_level))
        .format_timestamp(None)
        .format_target(false)
        .try_init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_twice_is_harmless() {
        init("warn");
        init("debug");
        log::debug!("logger installed");
    }
}
