use std::sync::Once;

use tracing_subscriber::fmt::format::FmtSpan;

/// Installs a global `tracing` subscriber the first time it is called; subsequent
/// calls are no-ops. Safe to call from multiple readers/tests concurrently.
pub fn init() {
    static START: Once = Once::new();
    START.call_once(|| {
        let subscriber = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_span_events(FmtSpan::ENTER | FmtSpan::CLOSE)
            .with_target(false)
            .finish();
        tracing::subscriber::set_global_default(subscriber)
            .expect("failed to set global default tracing subscriber");
    });
}
