use crate::paths::Paths;
use tracing::Level;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialize the logging system.
///
/// File logging with daily rotation (last 7 days kept) under the state dir,
/// plus a console layer in debug builds. `RUST_LOG` overrides the level.
/// Returns the appender guard; dropping it stops the background writer, so
/// the caller holds it for the process lifetime.
pub fn init(paths: &Paths) -> Result<tracing_appender::non_blocking::WorkerGuard, String> {
    let log_dir = paths.log_dir();
    std::fs::create_dir_all(&log_dir)
        .map_err(|e| format!("Failed to create log directory: {}", e))?;

    let file_appender = RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .filename_prefix("maild")
        .filename_suffix("log")
        .max_log_files(7)
        .build(&log_dir)
        .map_err(|e| format!("Failed to create file appender: {}", e))?;
    let (writer, guard) = tracing_appender::non_blocking(file_appender);

    #[cfg(debug_assertions)]
    let default_level = Level::DEBUG;

    #[cfg(not(debug_assertions))]
    let default_level = Level::INFO;

    let env_filter = EnvFilter::builder()
        .with_default_directive(default_level.into())
        .from_env_lossy()
        .add_directive("sqlx=warn".parse().unwrap());

    let file_layer = fmt::layer()
        .with_writer(writer)
        .with_ansi(false)
        .with_target(true)
        .json();

    #[cfg(debug_assertions)]
    {
        let console_layer = fmt::layer().with_target(true);
        tracing_subscriber::registry()
            .with(env_filter)
            .with(file_layer)
            .with(console_layer)
            .init();
    }

    #[cfg(not(debug_assertions))]
    {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(file_layer)
            .init();
    }

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        log_dir = %log_dir.display(),
        "Logging system initialized"
    );

    Ok(guard)
}
