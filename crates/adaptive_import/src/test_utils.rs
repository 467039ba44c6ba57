use std::sync::Once;

static TRACE: Once = Once::new();

/// Routes `tracing` output through the test harness. Set `RUST_LOG` to see it.
pub fn trace_init() {
    TRACE.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}
