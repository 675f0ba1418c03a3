pub mod error;
pub mod souk;
pub mod types;
pub mod utils;

pub use error::{Result, SoukError};
pub use souk::conversations::{Conversation, ConversationKey};
pub use souk::database::messages::{MediaPayload, Message, MessageDraft};
pub use souk::database::notifications::Notification;
pub use souk::database::profiles::Profile;
pub use souk::dispatcher::LiveStatus;
pub use souk::dispatcher::feed::{ChangeEvent, ChangeFeed, ChangeKind, WebsocketFeed};
pub use souk::{Souk, SoukConfig};
pub use types::MessageDomain;

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{filter::EnvFilter, fmt::Layer, prelude::*, registry::Registry};

use std::sync::{Mutex, Once};

static TRACING_GUARDS: Mutex<Option<(WorkerGuard, WorkerGuard)>> = Mutex::new(None);
static TRACING_INIT: Once = Once::new();

/// Initializes the daily-rolling file logger plus a stdout layer.
///
/// Safe to call more than once; only the first call has any effect.
pub(crate) fn init_tracing(logs_dir: &std::path::Path) -> Result<()> {
    let mut result = Ok(());
    TRACING_INIT.call_once(|| {
        result = try_init_tracing(logs_dir);
    });
    result
}

fn try_init_tracing(logs_dir: &std::path::Path) -> Result<()> {
    let file_appender = tracing_appender::rolling::RollingFileAppender::builder()
        .rotation(tracing_appender::rolling::Rotation::DAILY)
        .filename_prefix("souk")
        .filename_suffix("log")
        .build(logs_dir)
        .map_err(|e| SoukError::Configuration(format!("failed to create log appender: {}", e)))?;

    let (non_blocking_file, file_guard) = tracing_appender::non_blocking(file_appender);
    let (non_blocking_stdout, stdout_guard) = tracing_appender::non_blocking(std::io::stdout());

    if let Ok(mut guards) = TRACING_GUARDS.lock() {
        *guards = Some((file_guard, stdout_guard));
    }

    let stdout_layer = Layer::new()
        .with_writer(non_blocking_stdout)
        .with_ansi(true)
        .with_target(true);

    let file_layer = Layer::new()
        .with_writer(non_blocking_file)
        .with_ansi(false)
        .with_target(true);

    Registry::default()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(stdout_layer)
        .with(file_layer)
        .try_init()
        .ok();

    Ok(())
}
