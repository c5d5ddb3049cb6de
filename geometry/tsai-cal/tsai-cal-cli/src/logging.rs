use camino::Utf8Path;
use time::{format_description::well_known::Iso8601, UtcOffset};
use tracing_subscriber::{
    filter::{EnvFilter, LevelFilter},
    fmt::{self, time::OffsetTime},
    layer::SubscriberExt,
};

/// Install the global tracing subscriber.
///
/// Console output is always on. With `log_file`, the same events are also
/// written there without ANSI colors. The filter comes from `RUST_LOG` and
/// defaults to `info`.
pub fn init(log_file: Option<&Utf8Path>) -> eyre::Result<()> {
    // Fixed offset from the local timezone at startup.
    let timer = OffsetTime::new(
        UtcOffset::from_whole_seconds(chrono::Local::now().offset().local_minus_utc())?,
        Iso8601::DEFAULT,
    );

    let file_layer = match log_file {
        Some(path) => {
            let file = std::fs::File::create(path)?;
            Some(
                fmt::layer()
                    .with_timer(timer.clone())
                    .with_writer(std::sync::Mutex::new(file))
                    .with_ansi(false)
                    .with_file(true)
                    .with_line_number(true),
            )
        }
        None => None,
    };

    let console_layer = fmt::layer()
        .with_timer(timer)
        .with_writer(std::io::stderr)
        .with_ansi(!cfg!(windows));

    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy();

    let collector = tracing_subscriber::registry()
        .with(file_layer)
        .with(console_layer)
        .with(filter);
    tracing::subscriber::set_global_default(collector)?;

    if let Some(path) = log_file {
        tracing::debug!("Logging to file \"{path}\" and console.");
    }
    Ok(())
}
