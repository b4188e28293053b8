//! Host-framework glue for the Sydney client.
//!
//! Receives one inbound turn (prompt + user identity + optional group
//! metadata), runs it with a bounded retry loop, and always returns a
//! structured reply instead of propagating an error to the framework.

pub mod config;
pub mod handler;

pub use config::{load_default, load_from_path, BotConfig, ConfigError};
pub use handler::{handle_turn, Incoming, TurnReply};

/// Initialize process-wide logging. `RUST_LOG` overrides the default.
pub fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "sydney_bot=info,sydney_client=info".into()),
        )
        .init();
}
