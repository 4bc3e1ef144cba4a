use std::{num::NonZeroU8, panic};

use anyhow::Result;
use time::format_description::well_known::{iso8601, Iso8601};
use tracing::error;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
    fmt::time::LocalTime, prelude::__tracing_subscriber_SubscriberExt, EnvFilter, Layer,
};

const MY_CONFIG: iso8601::EncodedConfig = iso8601::Config::DEFAULT
    .set_time_precision(iso8601::TimePrecision::Second {
        decimal_digits: NonZeroU8::new(3),
    })
    .encode();

const DEFAULT_LEVEL: &str = "info";

fn make_filter() -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "{}={level},telecall_lib={level}",
            env!("CARGO_CRATE_NAME"),
            level = DEFAULT_LEVEL
        ))
    })
}

/// Logs to stdout and to a daily file in `dir`. Keep the guard alive until
/// the process exits or buffered lines are lost.
pub fn init_tracing(dir: &str, file_name: &str, ansi: bool) -> Result<WorkerGuard> {
    let default_layer = || {
        const WITH_FILE_PATH: bool = cfg!(debug_assertions);
        tracing_subscriber::fmt::layer()
            .compact()
            .with_file(WITH_FILE_PATH)
            .with_line_number(WITH_FILE_PATH)
            .with_target(!WITH_FILE_PATH)
            .with_thread_ids(true)
            .with_timer(LocalTime::new(Iso8601::<MY_CONFIG>))
    };
    let (writer, guard) =
        tracing_appender::non_blocking(tracing_appender::rolling::daily(dir, file_name));

    tracing::subscriber::set_global_default(
        tracing_subscriber::registry().with(
            default_layer()
                .with_ansi(false)
                .with_writer(writer)
                .with_filter(make_filter())
                .and_then(default_layer().with_ansi(ansi).with_filter(make_filter())),
        ),
    )?;

    panic::set_hook(Box::new(|panic| error!("{}", panic)));
    Ok(guard)
}
