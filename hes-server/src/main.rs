//! HES (Head-End System) gateway protocol engine — binary entry point.
//!
//! Binds the configured TCP port, accepts one connection per gateway,
//! performs the handshake, and spawns a cooperative session task per
//! gateway (§5, §6). Mirrors the teacher's `main.rs`: tracing init up
//! front, collaborators wired up, then a loop handed to `tokio::spawn`.

mod config;
mod firmware;
mod fuota_driver;
mod gateway;
mod mqtt;
mod store;
mod transport;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::{error, info, warn};

use hes_core::registry::GatewayRegistry;

static STARTUP_MS: AtomicU64 = AtomicU64::new(0);

#[tokio::main]
async fn main() {
    let startup_ms = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis() as u64;
    STARTUP_MS.store(startup_ms, Ordering::Relaxed);

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "hes_server=info,hes_core=info".into()),
        )
        .init();

    install_panic_hook();

    let config = Arc::new(config::Config::load());
    info!(bind_addr = %config.bind_addr, "HES gateway engine starting");

    let store: Arc<dyn hes_core::store_api::Store> = match store::MySqlStore::connect(&config.mysql_url).await {
        Ok(s) => Arc::new(s),
        Err(err) => {
            error!(%err, "failed to connect to mysql, exiting");
            std::process::exit(1);
        }
    };

    let (mqtt_source, mqtt_eventloop) = mqtt::RumqttcSource::connect(
        &config.mqtt_host,
        config.mqtt_port,
        &config.mqtt_client_id_prefix,
    );
    mqtt::log_startup(&config.mqtt_host, config.mqtt_port);
    tokio::spawn(mqtt_source.clone().run(mqtt_eventloop));

    let registry = Arc::new(GatewayRegistry::new());

    let listener = match tokio::net::TcpListener::bind(&config.bind_addr).await {
        Ok(l) => l,
        Err(err) => {
            error!(%err, bind_addr = %config.bind_addr, "failed to bind gateway listener, exiting");
            std::process::exit(1);
        }
    };
    info!(bind_addr = %config.bind_addr, "listening for gateway connections");

    tokio::select! {
        _ = accept_loop(listener, store, mqtt_source, registry, config) => {}
        _ = tokio::signal::ctrl_c() => {
            info!("ctrl-c received, shutting down gracefully");
        }
    }

    std::process::exit(0);
}

async fn accept_loop(
    listener: tokio::net::TcpListener,
    store: Arc<dyn hes_core::store_api::Store>,
    mqtt_source: Arc<mqtt::RumqttcSource>,
    registry: Arc<GatewayRegistry>,
    config: Arc<config::Config>,
) {
    loop {
        let (stream, peer_addr) = match listener.accept().await {
            Ok(pair) => pair,
            Err(err) => {
                warn!(%err, "accept failed");
                continue;
            }
        };

        let store = store.clone();
        let mqtt_source = mqtt_source.clone();
        let registry = registry.clone();
        let config = config.clone();

        tokio::spawn(async move {
            let transport = Arc::new(transport::TcpTransport::new(stream));
            let handshake = match transport.read_handshake().await {
                Ok(h) => h,
                Err(err) => {
                    warn!(%peer_addr, ?err, "handshake failed, dropping connection");
                    return;
                }
            };
            info!(
                %peer_addr,
                gateway_id = %handshake.gateway_id,
                signal_strength = handshake.signal_strength,
                modem_type = handshake.modem_type,
                "gateway handshake accepted"
            );

            mqtt_source.subscribe_gateway(&handshake.gateway_id).await;
            gateway::run(
                handshake.gateway_id.clone(),
                transport,
                store,
                mqtt_source.clone() as Arc<dyn hes_core::mqtt_api::MqttSource>,
                registry,
                config,
            )
            .await;
            mqtt_source.unsubscribe_gateway(&handshake.gateway_id).await;
        });
    }
}

/// Per §6 exit codes: a panic inside any task dumps its trace and exits
/// non-zero rather than letting the process hang in a half-torn-down state.
fn install_panic_hook() {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |info| {
        default_hook(info);
        error!(%info, "fatal panic, exiting non-zero");
        std::process::exit(1);
    }));
}
