/// Tracing initialization for hosts that do not install their own subscriber.
///
/// Honors `RUST_LOG`; falls back to debug output for this crate and info for
/// everything else. Safe to call more than once: later calls are no-ops.
pub fn init_logging() {
    let default_filter = if cfg!(feature = "verbose-logging") {
        "huddle_core=trace,info"
    } else {
        "huddle_core=debug,info"
    };

    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with_target(true)
        .try_init();
}
