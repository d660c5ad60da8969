//! Tracing subscriber initialization with structured logging and optional
//! OpenTelemetry trace export.
//!
//! # Usage
//!
//! ```no_run
//! use stepwise_observe::tracing_setup::{init_tracing, shutdown_tracing, TracingOptions};
//!
//! init_tracing(&TracingOptions { verbosity: 1, ..Default::default() }).unwrap();
//! // ... run ...
//! shutdown_tracing();
//! ```
//!
//! Logs go to stderr so stdout stays clean for `--json` output.

use std::sync::OnceLock;

use opentelemetry::trace::TracerProvider as _;
use opentelemetry_sdk::trace::SdkTracerProvider;
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::layer::{Layered, SubscriberExt};
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry};

/// Stores the OTel tracer provider so it can be shut down cleanly on exit.
static TRACER_PROVIDER: OnceLock<SdkTracerProvider> = OnceLock::new();

/// How the command line asked for logs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TracingOptions {
    /// Number of `-v` flags.
    pub verbosity: u8,
    /// `--quiet`: errors only.
    pub quiet: bool,
    /// `--log-json`: one JSON object per event.
    pub json: bool,
    /// `--otel`: export spans to stdout through OpenTelemetry.
    pub otel: bool,
}

/// Filter directive used when `RUST_LOG` is not set.
pub fn default_directive(verbosity: u8, quiet: bool) -> &'static str {
    if quiet {
        return "error";
    }
    match verbosity {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    }
}

type Base = Layered<EnvFilter, Registry>;

/// Initialize the global tracing subscriber.
///
/// - `RUST_LOG` wins when set; otherwise the level follows `-v`/`--quiet`.
/// - `--log-json` switches the fmt layer to JSON lines.
/// - `--otel` additionally bridges spans to OpenTelemetry using a stdout
///   exporter.
///
/// # Errors
///
/// Returns an error if the global subscriber has already been set.
pub fn init_tracing(options: &TracingOptions) -> Result<(), Box<dyn std::error::Error>> {
    let env_filter = match std::env::var(EnvFilter::DEFAULT_ENV) {
        Ok(_) => EnvFilter::from_default_env(),
        Err(_) => EnvFilter::new(default_directive(options.verbosity, options.quiet)),
    };

    let span_events = if options.verbosity >= 2 {
        FmtSpan::CLOSE
    } else {
        FmtSpan::NONE
    };
    let fmt_layer: Box<dyn Layer<Base> + Send + Sync> = if options.json {
        tracing_subscriber::fmt::layer()
            .json()
            .with_writer(std::io::stderr)
            .with_span_events(span_events)
            .boxed()
    } else {
        tracing_subscriber::fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(options.verbosity >= 2)
            .with_span_events(span_events)
            .boxed()
    };

    let registry = tracing_subscriber::registry().with(env_filter).with(fmt_layer);

    if options.otel {
        let provider = SdkTracerProvider::builder()
            .with_simple_exporter(opentelemetry_stdout::SpanExporter::default())
            .build();
        let tracer = provider.tracer("stepwise");
        let otel_layer = tracing_opentelemetry::layer().with_tracer(tracer);

        // Store the provider for shutdown and register it globally.
        let _ = TRACER_PROVIDER.set(provider.clone());
        opentelemetry::global::set_tracer_provider(provider);

        registry.with(otel_layer).try_init()?;
    } else {
        registry.try_init()?;
    }

    Ok(())
}

/// Flush pending traces and shut down the OpenTelemetry tracer provider.
///
/// Safe to call even when OTel was not enabled (no-op in that case).
pub fn shutdown_tracing() {
    if let Some(provider) = TRACER_PROVIDER.get() {
        if let Err(e) = provider.shutdown() {
            eprintln!("Warning: OTel tracer provider shutdown error: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verbosity_maps_to_levels() {
        assert_eq!(default_directive(0, false), "warn");
        assert_eq!(default_directive(1, false), "info");
        assert_eq!(default_directive(2, false), "debug");
        assert_eq!(default_directive(7, false), "trace");
        assert_eq!(default_directive(3, true), "error");
    }

    #[test]
    fn shutdown_without_init_is_a_no_op() {
        shutdown_tracing();
    }
}
