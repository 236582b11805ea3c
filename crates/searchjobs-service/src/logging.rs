use sentry::integrations::tracing::{EventFilter, SentryLayer};
use tracing::{Level, Subscriber};
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::fmt::{MakeWriter, fmt};
use tracing_subscriber::prelude::*;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::util::SubscriberInitExt;

/// Decides what Sentry makes of an event of the given level.
///
/// Errors become Sentry events, everything down to INFO is sent along as logs.
pub fn sentry_event_filter(level: &Level) -> EventFilter {
    match *level {
        Level::ERROR => EventFilter::Event | EventFilter::Log,
        Level::WARN | Level::INFO => EventFilter::Log,
        Level::DEBUG | Level::TRACE => EventFilter::Ignore,
    }
}

/// The Sentry tracing layer, filtered with [`sentry_event_filter`].
pub fn sentry_layer<S>() -> SentryLayer<S>
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    sentry::integrations::tracing::layer().event_filter(|md| sentry_event_filter(md.level()))
}

/// Installs a global subscriber that writes one JSON object per event.
///
/// Events also flow into the Sentry tracing integration, so errors logged by background searches
/// are reported even though no request is around to capture them.
pub fn init_json_logging<W>(env_filter: &str, make_writer: W)
where
    W: for<'writer> MakeWriter<'writer> + Send + Sync + 'static,
{
    fmt()
        .with_timer(UtcTime::rfc_3339())
        .with_target(true)
        .with_env_filter(env_filter)
        .json()
        .flatten_event(true)
        .with_current_span(true)
        .with_span_list(true)
        .with_file(true)
        .with_line_number(true)
        .with_writer(make_writer)
        .finish()
        .with(sentry_layer())
        .init();
}
