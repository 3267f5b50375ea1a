//! Randomized exploration of the [`reclaimer`] protocol.
//!
//! The protocol core lives in the `reclaimer` crate. This crate is the thing
//! that drives it: worker threads picking allocate / copy / drop / hand-off /
//! collect actions at random against one shared pool, then checking that
//! every object came back.

mod config;
mod explore;

pub use config::{ExploreConfig, ExploreConfigError};
pub use explore::{explore, ExploreSummary};

/// Log to stderr, filtered by `RUST_LOG` when it's set.
pub fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("refpool=info,reclaimer=info"))
        // Set the base level when not matched by other directives to WARN.
        .add_directive(tracing_subscriber::filter::LevelFilter::WARN.into());

    let sub = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_span_events(tracing_subscriber::fmt::format::FmtSpan::CLOSE)
        .finish();

    // a subscriber may already be installed (tests, embedding); that's fine
    let _ = tracing::subscriber::set_global_default(sub);
}
