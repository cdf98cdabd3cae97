//! Telemetry helpers for tracing output and Prometheus metrics.

use std::{io, path::Path, sync::OnceLock, thread, time::Duration};

use anyhow::{Context, Result};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tracing_subscriber::{
    filter::{EnvFilter, filter_fn},
    fmt,
    prelude::*,
};

use crate::pipeline::config::TelemetryOptions;

static PROM_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

/// Keeps the Chrome trace writer alive; dropping it flushes the trace file.
pub struct TelemetryGuard {
    chrome_guard: Option<tracing_chrome::FlushGuard>,
}

impl Drop for TelemetryGuard {
    fn drop(&mut self) {
        if let Some(guard) = self.chrome_guard.take() {
            guard.flush();
        }
    }
}

/// Install the process-wide tracing subscriber.
///
/// Capture runs on plain OS threads, so the subscriber is global rather than
/// scoped to the calling thread.
pub fn init_tracing(opts: &TelemetryOptions) -> Result<TelemetryGuard> {
    let default_filter = opts.default_filter.as_deref().unwrap_or("info");
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));

    let (chrome_layer, chrome_guard) = match opts.chrome_trace_path.as_deref() {
        Some(path) => match build_chrome_layer(path) {
            Ok((layer, guard)) => (Some(layer), Some(guard)),
            Err(err) => {
                eprintln!(
                    "failed to initialise chrome trace writer at {}: {err}",
                    path.display()
                );
                (None, None)
            }
        },
        None => (None, None),
    };

    let span_only_filter = filter_fn(|metadata| metadata.is_span());
    let subscriber = tracing_subscriber::registry()
        .with(chrome_layer.map(|layer| layer.with_filter(span_only_filter)))
        .with(
            fmt::layer()
                .with_target(false)
                .with_writer(io::stderr)
                .with_timer(fmt::time::uptime())
                .with_filter(env_filter),
        )
        .with(tracing_error::ErrorLayer::default());
    tracing::subscriber::set_global_default(subscriber)
        .context("a tracing subscriber is already installed")?;

    Ok(TelemetryGuard { chrome_guard })
}

/// Ensure the global metrics recorder is installed and return the Prometheus handle.
pub fn init_metrics_recorder() -> Result<&'static PrometheusHandle> {
    if let Some(handle) = PROM_HANDLE.get() {
        return Ok(handle);
    }

    let recorder = PrometheusBuilder::new().build_recorder();
    let handle = recorder.handle();
    metrics::set_global_recorder(recorder).context("metrics recorder already installed")?;

    let upkeep_handle = handle.clone();
    spawn_thread("prometheus-upkeep", move || {
        loop {
            thread::sleep(Duration::from_secs(5));
            upkeep_handle.run_upkeep();
        }
    })
    .context("failed to spawn prometheus upkeep thread")?;

    Ok(PROM_HANDLE.get_or_init(|| handle))
}

/// Access the Prometheus handle when already initialised.
pub fn prometheus_handle() -> Option<&'static PrometheusHandle> {
    PROM_HANDLE.get()
}

/// Spawn a thread that inherits the current tracing dispatcher.
pub fn spawn_thread<F, T>(name: impl Into<String>, f: F) -> io::Result<thread::JoinHandle<T>>
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    let dispatch = tracing::dispatcher::get_default(|current| current.clone());
    thread::Builder::new()
        .name(name.into())
        .spawn(move || tracing::dispatcher::with_default(&dispatch, f))
}

fn build_chrome_layer(
    path: &Path,
) -> io::Result<(
    tracing_chrome::ChromeLayer<tracing_subscriber::Registry>,
    tracing_chrome::FlushGuard,
)> {
    let file = std::fs::File::create(path)?;
    let (layer, guard) = tracing_chrome::ChromeLayerBuilder::new()
        .writer(file)
        .include_args(true)
        .trace_style(tracing_chrome::TraceStyle::Threaded)
        .build();
    Ok((layer, guard))
}
