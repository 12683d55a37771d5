pub use crate::roomkeeper::error::{Result, RoomkeeperError};
pub use crate::roomkeeper::events::{Event, EventKind, OutgoingState, SourceFlags};
pub use crate::roomkeeper::history::{HistoryStore, SyncState};
pub use crate::roomkeeper::notifications::{PushRuleEvaluator, PushVerdict};
pub use crate::roomkeeper::preferences::Preferences;
pub use crate::roomkeeper::rooms::{Room, RoomTag};
pub use crate::roomkeeper::transport::{MessagesPage, SyncBatch, SyncedEvent, Transport, TransportError};
pub use crate::roomkeeper::ui::{BroadcastUi, UiSink, UiUpdate};
pub use crate::roomkeeper::{Roomkeeper, RoomkeeperConfig, WorkerExit};

use std::sync::{Mutex, OnceLock};

use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{filter::EnvFilter, fmt::Layer, prelude::*, registry::Registry};

pub mod roomkeeper;

static TRACING_GUARDS: OnceLock<Mutex<Vec<WorkerGuard>>> = OnceLock::new();
static TRACING_INIT: OnceLock<()> = OnceLock::new();

/// Log to stdout and to a daily rolling file under `logs_dir`. Only the
/// first call has any effect.
pub(crate) fn init_tracing(logs_dir: &std::path::Path) {
    TRACING_INIT.get_or_init(|| {
        let mut guards = Vec::with_capacity(2);

        let (non_blocking_stdout, stdout_guard) = tracing_appender::non_blocking(std::io::stdout());
        guards.push(stdout_guard);
        let stdout_layer = Layer::new()
            .with_writer(non_blocking_stdout)
            .with_ansi(true)
            .with_target(true);

        let file_layer = match tracing_appender::rolling::RollingFileAppender::builder()
            .rotation(tracing_appender::rolling::Rotation::DAILY)
            .filename_prefix("roomkeeper")
            .filename_suffix("log")
            .build(logs_dir)
        {
            Ok(file_appender) => {
                let (non_blocking_file, file_guard) = tracing_appender::non_blocking(file_appender);
                guards.push(file_guard);
                Some(
                    Layer::new()
                        .with_writer(non_blocking_file)
                        .with_ansi(false)
                        .with_target(true),
                )
            }
            Err(e) => {
                eprintln!("Failed to create log file in {:?}: {}", logs_dir, e);
                None
            }
        };

        TRACING_GUARDS.set(Mutex::new(guards)).ok();

        // Another subscriber may already be installed by the host application
        let _ = Registry::default()
            .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
            .with(stdout_layer)
            .with(file_layer)
            .try_init();
    });
}
