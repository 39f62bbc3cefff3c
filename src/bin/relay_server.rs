// DANS : src/bin/relay_server.rs

use anyhow::Result;
use floor_relay::{
    config::Config,
    das::DasClient,
    das::AssetIndex,
    listener::ChangeListener,
    monitoring::{logging, metrics},
    relay::PoolRelay,
    server,
    storage::{KvStore, RocksStore},
};
use std::sync::Arc;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load()?;
    logging::setup_logging();

    let authority = config.authority()?;
    let collection = config.collection()?;

    let store: Arc<dyn KvStore> = Arc::new(RocksStore::open(&config.db_path)?);
    let index: Arc<dyn AssetIndex> = Arc::new(DasClient::new(config.rpc_url.clone()));

    // La poignée du relai doit exister avant le listener, et le relai a
    // besoin de celle du listener : on ouvre d'abord le canal de commandes.
    let (relay_handle, relay_rx) = PoolRelay::channel();
    let listener = ChangeListener::spawn(
        config.ws_url.clone(),
        collection,
        relay_handle.clone(),
        store.clone(),
    );
    let snapshot = PoolRelay::spawn(
        relay_rx,
        relay_handle.clone(),
        listener,
        store,
        index,
        authority,
        collection,
    );

    tokio::spawn(metrics::start_metrics_server());

    info!(authority = %authority, collection = %collection, "Relai d'état de pool démarré.");

    tokio::select! {
        res = server::serve(config.listen_addr.clone(), relay_handle, snapshot) => res?,
        _ = tokio::signal::ctrl_c() => {
            info!("Arrêt demandé (ctrl-c).");
        }
    }
    Ok(())
}
