//! # murmur-core
//!
//! The messaging engine. [`MessagingService`] runs on top of the store and
//! the transport and publishes [`MessagingEvent`]s.

pub mod config;
pub mod error;
pub mod events;
pub mod locks;
pub mod reorder;
pub mod service;
pub mod tasks;

pub use config::EngineConfig;
pub use error::{Result, ServiceError};
pub use events::{EventReceiver, MessagingEvent};
pub use service::{ContactDraft, DropReason, IngestOutcome, MessagingService};

use tracing_subscriber::{fmt, EnvFilter};

/// Install the global `fmt` subscriber. `RUST_LOG` overrides the default
/// filter. Calling this more than once is harmless.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new("murmur_core=debug,murmur_net=debug,murmur_store=info,warn")
    });

    let _ = fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .try_init();
}
