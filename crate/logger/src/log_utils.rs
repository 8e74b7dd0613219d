use std::{io, sync::Once};

use tracing::Subscriber;
use tracing_subscriber::{
    EnvFilter, Layer,
    fmt::MakeWriter,
    layer::SubscriberExt,
    registry::LookupSpan,
    util::SubscriberInitExt,
};

/// Filter used when neither `RUST_LOG` nor an explicit default is provided
pub const DEFAULT_LOG_FILTER: &str = "info";

static LOG_INIT: Once = Once::new();

/// Install the process-wide tracing subscriber, writing to the standard
/// error.
///
/// The filter is read from `RUST_LOG`; when it is not set, `default_value`
/// is used, falling back to [`DEFAULT_LOG_FILTER`].
/// Only the first call has an effect. If another subscriber was installed
/// beforehand (by the hosting application), it is left in place.
pub fn log_init(default_value: Option<&str>) {
    LOG_INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new(default_value.unwrap_or(DEFAULT_LOG_FILTER))
        });
        tracing_setup(filter);
    });
}

fn format_layer<S, W>(writer: W, ansi: bool) -> impl Layer<S>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
{
    tracing_subscriber::fmt::layer()
        .with_writer(writer)
        .with_level(true)
        .with_target(true)
        .with_thread_ids(true)
        .with_line_number(true)
        .with_file(true)
        .with_ansi(ansi)
        .compact()
}

fn tracing_setup(filter: EnvFilter) {
    // the host may already own the global subscriber
    drop(
        tracing_subscriber::registry()
            .with(filter)
            .with(format_layer(io::stderr, true))
            .try_init(),
    );
}
