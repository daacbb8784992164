//! ---
//! gridpoll_section: "04-metrics-export"
//! gridpoll_subsection: "module"
//! gridpoll_type: "source"
//! gridpoll_scope: "code"
//! gridpoll_description: "Metrics collection and export utilities."
//! gridpoll_version: "v0.1.0"
//! gridpoll_owner: "tbd"
//! ---
use std::net::{SocketAddr, TcpListener as StdTcpListener};
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::http::{header, HeaderValue, StatusCode};
use axum::routing::get;
use axum::{response::IntoResponse, Router};
use prometheus::{Encoder, GaugeVec, IntCounter, IntGauge, Opts, Registry, TextEncoder};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{error, info};

use gridpoll_agg::{ObisConsumer, ObisUpdate, RegisterConsumer, RegisterUpdate};

/// Shared registry type used across the daemon.
pub type SharedRegistry = Arc<Registry>;

/// Produce a new shared registry.
pub fn new_registry() -> SharedRegistry {
    Arc::new(Registry::new())
}

/// Spawn an HTTP server that exposes the registry at `/metrics`.
pub fn spawn_http_server(registry: SharedRegistry, addr: SocketAddr) -> Result<MetricsServer> {
    let app = Router::new().route(
        "/metrics",
        get({
            let registry = registry.clone();
            move || metrics_handler(registry.clone())
        }),
    );

    let std_listener = StdTcpListener::bind(addr)
        .with_context(|| format!("failed to bind metrics listener {}", addr))?;
    std_listener
        .set_nonblocking(true)
        .with_context(|| "failed to configure metrics listener as non-blocking")?;
    let listener = TcpListener::from_std(std_listener)
        .with_context(|| "failed to convert std listener into tokio listener")?;

    info!(address = %addr, "metrics server starting");

    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let service = app.into_make_service();
    let handle: JoinHandle<Result<()>> = tokio::spawn(async move {
        axum::serve(listener, service)
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.await;
            })
            .await
            .context("metrics server encountered an error")?;
        Ok(())
    });

    Ok(MetricsServer {
        addr,
        shutdown: Some(shutdown_tx),
        task: handle,
    })
}

/// Prometheus scrape endpoint. Returns `text/plain` metrics even on large registries.
async fn metrics_handler(registry: SharedRegistry) -> impl IntoResponse {
    let families = registry.gather();
    let encoder = TextEncoder::new();
    match encoder.encode_to_string(&families) {
        Ok(body) => (
            StatusCode::OK,
            [(
                header::CONTENT_TYPE,
                HeaderValue::from_str(encoder.format_type())
                    .unwrap_or_else(|_| HeaderValue::from_static("text/plain")),
            )],
            body,
        )
            .into_response(),
        Err(err) => {
            error!(error = %err, "failed to encode metrics");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                String::from("metrics encoding error"),
            )
                .into_response()
        }
    }
}

/// Handle to the running HTTP exporter.
#[derive(Debug)]
pub struct MetricsServer {
    addr: SocketAddr,
    shutdown: Option<oneshot::Sender<()>>,
    task: JoinHandle<Result<()>>,
}

impl MetricsServer {
    /// Return the bound address for convenience.
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Signal shutdown and await task completion.
    pub async fn shutdown(mut self) -> Result<()> {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        match self.task.await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(err)) => Err(err),
            Err(join_err) => Err(anyhow::Error::new(join_err)),
        }
    }
}

/// Metrics recorded by the polling loop itself.
#[derive(Clone)]
pub struct PollerMetrics {
    registry: SharedRegistry,
    cycles_total: IntCounter,
    queries_sent_total: IntCounter,
    login_rounds_total: IntCounter,
    packets_dispatched_total: IntCounter,
    tokens_outstanding: IntGauge,
    night_mode: IntGauge,
    devices_fully_registered: IntGauge,
}

impl PollerMetrics {
    pub fn new(registry: SharedRegistry) -> Result<Self> {
        let cycles_total = IntCounter::with_opts(Opts::new(
            "gridpoll_query_cycles_total",
            "Completed inverter query cycles",
        ))?;
        registry.register(Box::new(cycles_total.clone()))?;

        let queries_sent_total = IntCounter::with_opts(Opts::new(
            "gridpoll_queries_sent_total",
            "Register query requests sent to inverters",
        ))?;
        registry.register(Box::new(queries_sent_total.clone()))?;

        let login_rounds_total = IntCounter::with_opts(Opts::new(
            "gridpoll_login_rounds_total",
            "Login rounds executed against the inverter fleet",
        ))?;
        registry.register(Box::new(login_rounds_total.clone()))?;

        let packets_dispatched_total = IntCounter::with_opts(Opts::new(
            "gridpoll_packets_dispatched_total",
            "Inbound Gridwire packets routed to a receiver",
        ))?;
        registry.register(Box::new(packets_dispatched_total.clone()))?;

        let tokens_outstanding = IntGauge::with_opts(Opts::new(
            "gridpoll_tokens_outstanding",
            "Request tokens currently awaiting a response",
        ))?;
        registry.register(Box::new(tokens_outstanding.clone()))?;

        let night_mode = IntGauge::with_opts(Opts::new(
            "gridpoll_night_mode",
            "Indicator (0/1) whether the poller runs the night cadence",
        ))?;
        registry.register(Box::new(night_mode.clone()))?;

        let devices_fully_registered = IntGauge::with_opts(Opts::new(
            "gridpoll_devices_fully_registered",
            "Devices with confirmed identity and address",
        ))?;
        registry.register(Box::new(devices_fully_registered.clone()))?;

        Ok(Self {
            registry,
            cycles_total,
            queries_sent_total,
            login_rounds_total,
            packets_dispatched_total,
            tokens_outstanding,
            night_mode,
            devices_fully_registered,
        })
    }

    pub fn registry(&self) -> SharedRegistry {
        self.registry.clone()
    }

    pub fn inc_cycle(&self) {
        self.cycles_total.inc();
    }

    pub fn inc_queries(&self, count: u64) {
        self.queries_sent_total.inc_by(count);
    }

    pub fn inc_login_round(&self) {
        self.login_rounds_total.inc();
    }

    pub fn add_packets(&self, count: u64) {
        self.packets_dispatched_total.inc_by(count);
    }

    pub fn set_tokens_outstanding(&self, count: usize) {
        self.tokens_outstanding.set(count as i64);
    }

    pub fn set_night_mode(&self, night: bool) {
        self.night_mode.set(if night { 1 } else { 0 });
    }

    pub fn set_devices_fully_registered(&self, count: usize) {
        self.devices_fully_registered.set(count as i64);
    }
}

/// Terminal aggregation sink exporting every flushed measurement as a
/// labelled gauge. This is the deployment's storage seam; a time-series
/// database scrapes the gauges.
#[derive(Clone)]
pub struct GaugeExportConsumer {
    meter_quantities: GaugeVec,
    inverter_quantities: GaugeVec,
}

impl GaugeExportConsumer {
    pub fn new(registry: SharedRegistry) -> Result<Self> {
        let meter_quantities = GaugeVec::new(
            Opts::new(
                "gridpoll_meter_quantity",
                "Averaged meter quantity in engineering units",
            ),
            &["quantity"],
        )?;
        registry.register(Box::new(meter_quantities.clone()))?;

        let inverter_quantities = GaugeVec::new(
            Opts::new(
                "gridpoll_inverter_quantity",
                "Latest inverter register quantity in engineering units",
            ),
            &["quantity"],
        )?;
        registry.register(Box::new(inverter_quantities.clone()))?;

        Ok(Self {
            meter_quantities,
            inverter_quantities,
        })
    }
}

impl ObisConsumer for GaugeExportConsumer {
    fn consume_obis(&self, update: ObisUpdate) {
        self.meter_quantities
            .with_label_values(&[&update.quantity.to_string()])
            .set(update.value);
    }

    fn end_of_obis_data(&self, _time: u64) {}
}

impl RegisterConsumer for GaugeExportConsumer {
    fn consume_register(&self, update: RegisterUpdate) {
        self.inverter_quantities
            .with_label_values(&[&update.quantity.to_string()])
            .set(update.value);
    }

    fn end_of_device_data(&self, _serial: u32, _time: u64) {}
}

pub use prometheus;

#[cfg(test)]
mod tests {
    use super::*;
    use gridpoll_agg::{ObisQuantity, RegisterQuantity};

    #[test]
    fn poller_metrics_register_cleanly() {
        let registry = new_registry();
        let metrics = PollerMetrics::new(registry.clone()).unwrap();
        metrics.inc_cycle();
        metrics.inc_queries(5);
        metrics.set_night_mode(true);
        metrics.set_tokens_outstanding(3);
        assert!(!registry.gather().is_empty());
    }

    #[test]
    fn gauge_export_tracks_latest_values() {
        let registry = new_registry();
        let sink = GaugeExportConsumer::new(registry.clone()).unwrap();
        sink.consume_obis(ObisUpdate {
            quantity: ObisQuantity::SignedActivePowerTotal,
            value: 1300.0,
            time: 1,
        });
        sink.consume_register(RegisterUpdate {
            quantity: RegisterQuantity::DcPowerMpp1,
            value: 0.0,
            time: 1,
        });

        let families = registry.gather();
        let meter = families
            .iter()
            .find(|f| f.get_name() == "gridpoll_meter_quantity")
            .unwrap();
        assert_eq!(meter.get_metric()[0].get_gauge().get_value(), 1300.0);
    }
}
