use tracing_subscriber::EnvFilter;

/// Routes the reactor's logs through the test harness. Set `RUST_LOG` to see
/// them.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
