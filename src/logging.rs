//! Log setup and the macros used to trace the SMTP conversation.
//!
//! Each traffic event is emitted inside a span named after its direction,
//! so `LOG_LEVEL=trace` output reads as a transcript:
//!
//! ```text
//! TRACE outgoing: mailshot: MAIL FROM:<me@example.com>
//! TRACE incoming: mailshot: 250 2.1.0 OK
//! ```

use std::str::FromStr;

use tracing::metadata::LevelFilter;
use tracing_subscriber::{
    Layer, filter::FilterFn, prelude::__tracing_subscriber_SubscriberExt, util::SubscriberInitExt,
};

#[doc(hidden)]
#[macro_export]
macro_rules! __traffic_event {
    ($direction:literal, $level:ident, $($msg:tt)*) => {{
        let span = $crate::tracing::span!(
            target: "mailshot",
            $crate::tracing::Level::$level,
            $direction
        );
        let _enter = span.enter();

        $crate::tracing::event!(target: "mailshot", $crate::tracing::Level::$level, $($msg)*)
    }};
}

/// Commands written to the server. Never pass credentials.
#[macro_export]
macro_rules! outgoing {
    (level = $level:ident, $($msg:tt)*) => {
        $crate::__traffic_event!("outgoing", $level, $($msg)*)
    };

    ($($msg:tt)*) => {
        $crate::outgoing!(level = TRACE, $($msg)*)
    };
}

/// Replies read from the server.
#[macro_export]
macro_rules! incoming {
    (level = $level:ident, $($msg:tt)*) => {
        $crate::__traffic_event!("incoming", $level, $($msg)*)
    };

    ($($msg:tt)*) => {
        $crate::incoming!(level = TRACE, $($msg)*)
    };
}

/// Connection housekeeping that never goes over the wire.
#[macro_export]
macro_rules! internal {
    (level = $level:ident, $($msg:tt)*) => {
        $crate::__traffic_event!("internal", $level, $($msg)*)
    };

    ($($msg:tt)*) => {
        $crate::internal!(level = TRACE, $($msg)*)
    };
}

/// Installs the global subscriber, writing to stderr so stdout stays free
/// for progress output.
///
/// The level comes from `LOG_LEVEL`, falling back to `TRACE` in debug builds
/// and `INFO` in release builds. Only events from this crate are printed.
/// Calling it again once a subscriber is installed does nothing.
pub fn init() {
    let default = if cfg!(debug_assertions) {
        LevelFilter::TRACE
    } else {
        LevelFilter::INFO
    };

    let level = std::env::var("LOG_LEVEL").map_or(default, |level| {
        LevelFilter::from_str(level.as_str()).unwrap_or_else(|_| {
            eprintln!("Invalid log level specified {level}, defaulting to {default}");
            default
        })
    });

    let installed = tracing_subscriber::Registry::default()
        .with(
            tracing_subscriber::fmt::layer()
                .with_file(false)
                .with_line_number(false)
                .with_writer(std::io::stderr)
                .compact()
                .with_ansi(true)
                .with_timer(tracing_subscriber::fmt::time::ChronoUtc::rfc_3339())
                .with_filter(level)
                .with_filter(FilterFn::new(|metadata| {
                    metadata.target().starts_with("mailshot")
                })),
        )
        .try_init();

    if installed.is_err() {
        tracing::debug!("Logging already initialised");
    }
}
