// DANS : src/monitoring/metrics.rs

use lazy_static::lazy_static;
use prometheus::{
    register_int_counter, register_int_gauge, Encoder, IntCounter, IntGauge, TextEncoder,
};
use warp::Filter;

lazy_static! {
    // --- Flux de notifications ---
    pub static ref NOTIFICATIONS_RECEIVED: IntCounter = register_int_counter!(
        "relay_notifications_received_total", "Nombre total de notifications de changement de comptes reçues"
    ).unwrap();
    pub static ref SUBSCRIPTION_RESTARTS: IntCounter = register_int_counter!(
        "relay_subscription_restarts_total", "Nombre de (re)démarrages de génération d'abonnement"
    ).unwrap();

    // --- Réconciliation ---
    pub static ref RESYNCS: IntCounter = register_int_counter!(
        "relay_resyncs_total", "Nombre de resynchronisations complètes via l'index"
    ).unwrap();
    pub static ref STAGED_TO_ADD: IntGauge = register_int_gauge!(
        "relay_staged_to_add", "Arrivées en attente d'appariement"
    ).unwrap();
    pub static ref STAGED_TO_REMOVE: IntGauge = register_int_gauge!(
        "relay_staged_to_remove", "Départs en attente d'appariement"
    ).unwrap();
    pub static ref POOL_ASSETS: IntGauge = register_int_gauge!(
        "relay_pool_assets", "Taille courante de l'appartenance à la pool"
    ).unwrap();

    // --- Clients ---
    pub static ref CONNECTED_CLIENTS: IntGauge = register_int_gauge!(
        "relay_connected_clients", "Nombre de clients WebSocket connectés"
    ).unwrap();
    pub static ref BROADCASTS: IntCounter = register_int_counter!(
        "relay_broadcasts_total", "Nombre de diffusions du snapshot aux clients"
    ).unwrap();
}

pub async fn start_metrics_server() {
    let metrics_route = warp::path!("metrics").map(|| {
        let encoder = TextEncoder::new();
        let mut buffer = vec![];
        encoder.encode(&prometheus::gather(), &mut buffer).unwrap();
        warp::reply::with_header(buffer, "content-type", "text/plain; version=0.0.4")
    });
    println!("[Monitoring] Serveur de métriques exposé sur http://0.0.0.0:9100/metrics");
    warp::serve(metrics_route).run(([0, 0, 0, 0], 9100)).await;
}
