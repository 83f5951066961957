//! Tracing subscriber setup driven by [`LogOptions`].
//!
//! Every component logs with a `sb_core::<component>` target so operators can
//! tune verbosity per area, e.g. `RUST_LOG=info,sb_core::dns=debug`.
use sb_config::{LogFormat, LogOptions};
use std::sync::OnceLock;
use tracing_subscriber::EnvFilter;

static TRACING: OnceLock<bool> = OnceLock::new();

/// Install the global subscriber once; later calls are ignored.
///
/// `RUST_LOG` overrides `options.level` when set. Returns whether a
/// subscriber from this call (or an earlier one) is active.
pub fn init(options: &LogOptions) -> bool {
    *TRACING.get_or_init(|| {
        if options.disabled {
            return false;
        }
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(options.level.as_str()));
        let builder = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true);
        let installed = match (options.format, options.timestamp) {
            (LogFormat::Json, true) => builder.json().try_init(),
            (LogFormat::Json, false) => builder.json().without_time().try_init(),
            (LogFormat::Compact, true) => builder.compact().try_init(),
            (LogFormat::Compact, false) => builder.compact().without_time().try_init(),
        }
        .is_ok();
        tracing::debug!(
            target: "sb_core::log",
            format = ?options.format,
            installed,
            "tracing initialized"
        );
        installed
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_is_idempotent() {
        let opts = LogOptions {
            level: "debug".into(),
            timestamp: false,
            ..Default::default()
        };
        let first = init(&opts);
        let second = init(&LogOptions {
            disabled: true,
            ..Default::default()
        });
        assert_eq!(first, second);
    }
}
