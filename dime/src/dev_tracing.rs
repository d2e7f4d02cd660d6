/// Development helper: initialize tracing when `RUST_LOG` is set.
///
/// Integration tests call `dime::dev_tracing::init_tracing()` to get
/// structured logs while debugging a scenario. No-op when `RUST_LOG` is
/// unset or a global subscriber is already installed; the `dime` binary
/// installs its own subscriber instead.
pub fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    if std::env::var("RUST_LOG").is_ok() {
        let _ = fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_target(false)
            .try_init();
    }
}
