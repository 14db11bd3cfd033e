use tracing_subscriber::{fmt, EnvFilter};

fn filter(debug: bool) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if debug {
            EnvFilter::new("debug")
        } else {
            EnvFilter::new("info")
        }
    })
}

/// Initialize the tracing subscriber with timestamp, level, and structured fields.
/// `RUST_LOG` wins when set; otherwise `debug` selects DEBUG over INFO.
///
/// Panics if a global subscriber is already installed; hosts that may have
/// their own subscriber should call [`try_init`].
pub fn init(debug: bool) {
    fmt()
        .with_env_filter(filter(debug))
        .with_timer(fmt::time::SystemTime)
        .with_level(true)
        .with_target(true)
        .init();
}

/// Like [`init`], but returns `false` instead of panicking when a global
/// subscriber is already set.
pub fn try_init(debug: bool) -> bool {
    fmt()
        .with_env_filter(filter(debug))
        .with_timer(fmt::time::SystemTime)
        .with_level(true)
        .with_target(true)
        .try_init()
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_try_init_second_call_is_refused() {
        // Other tests may have installed a subscriber first, so only the
        // second call's outcome is deterministic.
        let _ = try_init(false);
        assert!(!try_init(true));
    }
}
