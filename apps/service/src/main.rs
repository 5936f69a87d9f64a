mod aggregator;
mod api;
mod config;
mod monitoring;
mod outbound;
mod ping;
mod resources;
mod scheduler;
mod scrubber;
mod tracker;
mod worker;

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use actix_web::{web, App, HttpServer};
use anyhow::Context;
use logger::init_tracing;
use tracing::{error, info};

use crate::aggregator::DataAggregator;
use crate::config::{spawn_reload_watcher, ServerConfig};
use crate::monitoring::Monitor;
use crate::outbound::{ControllerTransport, HttpControllerTransport};
use crate::tracker::ServiceTracker;

#[tokio::main]
async fn main() -> ExitCode {
    init_tracing();

    let mut arguments = std::env::args().skip(1);
    let (Some(configuration_path), None) = (arguments.next(), arguments.next()) else {
        error!("Invalid command line. Include path to the configuration file");
        return ExitCode::from(1);
    };

    match run(PathBuf::from(configuration_path)).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(run_error) => {
            error!("{:#}", run_error);
            ExitCode::from(1)
        }
    }
}

async fn run(configuration_path: PathBuf) -> anyhow::Result<()> {
    let configuration = ServerConfig::load(&configuration_path)?;

    let transport = Arc::new(HttpControllerTransport::new()?);
    let aggregator = DataAggregator::new(Arc::clone(&transport) as Arc<dyn ControllerTransport>);
    let tracker = ServiceTracker::new(Arc::clone(&aggregator), 0)?;
    aggregator.set_tracker(&tracker);

    apply_configuration(&configuration, &tracker, &aggregator, &transport);
    let inbound_port = configuration.inbound_port;

    {
        let tracker = Arc::clone(&tracker);
        let aggregator = Arc::clone(&aggregator);
        let transport = Arc::clone(&transport);
        spawn_reload_watcher(configuration_path, move |reloaded| {
            apply_configuration(&reloaded, &tracker, &aggregator, &transport);
        });
    }

    info!("Polling server started");

    let state = web::Data::new(api::ApiState {
        tracker: Arc::clone(&tracker),
        runtime: tokio::runtime::Handle::current(),
    });
    HttpServer::new(move || App::new().app_data(state.clone()).configure(api::configure))
        .workers(1)
        .bind(("0.0.0.0", inbound_port))
        .with_context(|| format!("could not bind inbound port {inbound_port}"))?
        .run()
        .await?;

    Ok(())
}

/// Push configuration values into the running components. Called at startup
/// and on every successful hot reload.
fn apply_configuration(
    configuration: &ServerConfig,
    tracker: &Arc<ServiceTracker>,
    aggregator: &Arc<DataAggregator>,
    transport: &Arc<HttpControllerTransport>,
) {
    transport.set_base_url(configuration.database_server.clone());
    aggregator.set_server_identifier(&configuration.server_identifier);
    tracker.connect_to_pinger(&configuration.pinger);
    Monitor::set_default_headers(&configuration.headers);
}
