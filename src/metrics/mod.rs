//! Prometheus exposition for the `metrics` facade counters.

use once_cell::sync::OnceCell;

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

use crate::{Error, Result};

static PROM_HANDLE: OnceCell<PrometheusHandle> = OnceCell::new();

/// Initialise the global Prometheus recorder.
///
/// Call once at startup, before any metrics are emitted. Later and
/// concurrent calls reuse the recorder installed by the first one.
pub fn init() -> Result<()> {
    PROM_HANDLE.get_or_try_init(|| {
        PrometheusBuilder::new()
            .install_recorder()
            .map_err(|e| Error::Other(format!("install prometheus recorder: {e}")))
    })?;
    Ok(())
}

/// The global Prometheus handle, if [`init`] has run.
pub fn handle() -> Option<&'static PrometheusHandle> {
    PROM_HANDLE.get()
}

/// Current metrics in text exposition format (empty before [`init`]).
pub fn render() -> String {
    handle().map(PrometheusHandle::render).unwrap_or_default()
}
