//! Logging bootstrap.
//!
//! The crate logs through `tracing`. Applications embedding it call [`init_tracing`]
//! once at startup; libraries that still use the `log` facade are bridged into the same
//! subscriber.

use std::sync::Once;

use tracing_log::LogTracer;
use tracing_subscriber::EnvFilter;

/// Installs a global `fmt` subscriber.
///
/// The filter is read from `RUST_LOG` and falls back to `default_directive`, e.g.
/// `"info,threeds_core=debug"`. Only the first call has an effect.
///
/// # Examples
///
/// ```rust
/// threeds_core::logger::init_tracing("info");
/// tracing::info!("logging ready");
/// ```
pub fn init_tracing(default_directive: &str) {
    static INIT: Once = Once::new();

    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(default_directive));
        let subscriber = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .finish();

        if let Err(e) = LogTracer::init() {
            eprintln!("Failed to bridge log records: {e}");
        }
        if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
            eprintln!("Failed to set tracing subscriber: {e}");
        }
    });
}
