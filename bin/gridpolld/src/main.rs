//! ---
//! gridpoll_section: "01-core-functionality"
//! gridpoll_subsection: "binary"
//! gridpoll_type: "source"
//! gridpoll_scope: "code"
//! gridpoll_description: "Entrypoint of the gridpoll daemon."
//! gridpoll_version: "v0.1.0"
//! gridpoll_owner: "tbd"
//! ---
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;

use anyhow::Result;
use tracing::info;

use gridpoll_agg::{AveragingProcessor, CalculatedValueProcessor, ObisFilter};
use gridpoll_common::{init_tracing, LoggingConfig};
use gridpoll_core::{
    run_discovery, CommandPacketReceiver, MeterPacketReceiver, PacketDispatcher, PollScheduler,
    TokenRepository,
};
use gridpoll_metrics::{new_registry, spawn_http_server, GaugeExportConsumer, PollerMetrics};
use gridpoll_wire::{
    DeviceDiscovery, GridwireCommandChannel, GridwireDiscovery, HttpWakeProbe, SocketPool,
    GRIDWIRE_PORT,
};

mod site;

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    init_tracing("gridpolld", &LoggingConfig::default())?;
    info!(version = env!("CARGO_PKG_VERSION"), "gridpolld starting");

    let registry = new_registry();
    let metrics = PollerMetrics::new(registry.clone())?;
    let metrics_addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, site::METRICS_PORT));
    let metrics_server = spawn_http_server(registry.clone(), metrics_addr)?;
    info!(address = %metrics_server.addr(), "metrics endpoint up");

    let discovery = GridwireDiscovery::bind().await?;
    for address in site::PRE_REGISTERED_ADDRESSES {
        discovery.pre_register_device(IpAddr::V4(address));
    }
    for serial in site::REQUIRED_SERIALS {
        discovery.require_device(serial);
    }
    let probe = HttpWakeProbe::new()?;
    let registered = run_discovery(&discovery, &probe).await?;
    metrics.set_devices_fully_registered(registered);

    let pool = Arc::new(
        SocketPool::bind(
            GRIDWIRE_PORT,
            site::METER_MULTICAST_GROUP,
            &site::LOCAL_INTERFACE_ADDRS,
        )
        .await?,
    );
    let tokens = Arc::new(TokenRepository::new());
    let channel = Arc::new(GridwireCommandChannel::new(pool.clone(), tokens.clone()));

    // Aggregation chain: filter -> averager -> calculator -> gauge export.
    let sink = Arc::new(GaugeExportConsumer::new(registry)?);
    let calculator = Arc::new(CalculatedValueProcessor::new(sink));
    let averager = Arc::new(AveragingProcessor::new(
        site::AVERAGING_TIME_OBIS_MS,
        site::AVERAGING_TIME_REGISTER_MS,
    ));
    averager.add_obis_consumer(calculator.clone());
    averager.add_register_consumer(calculator);
    let filter = Arc::new(ObisFilter::new());
    filter.add_filter(site::METER_OBIS_SELECTION);
    filter.add_consumer(averager.clone());

    let dispatcher = Arc::new(PacketDispatcher::new(pool));
    dispatcher.register_receiver(Arc::new(MeterPacketReceiver::new(filter)));
    dispatcher.register_receiver(Arc::new(CommandPacketReceiver::new(
        tokens.clone(),
        averager.clone(),
    )));

    let mut scheduler = PollScheduler::new(
        discovery.devices(),
        channel,
        dispatcher,
        tokens,
        averager,
        metrics,
    );
    scheduler.run().await
}
