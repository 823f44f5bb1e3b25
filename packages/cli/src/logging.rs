// ABOUTME: Tracing subscriber setup for the dockformer binary
// ABOUTME: RUST_LOG wins over the configured level; JSON output is opt-in

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

pub fn init_tracing(level: &str, json: bool) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(level))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let registry = tracing_subscriber::registry().with(filter);

    // A second init (tests, embedding) keeps the existing subscriber
    let result = if json {
        registry.with(fmt::layer().json()).try_init()
    } else {
        registry.with(fmt::layer().with_target(false)).try_init()
    };

    if let Err(e) = result {
        tracing::debug!("Tracing already initialised: {}", e);
    }
}
