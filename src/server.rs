// DANS : src/server.rs

use crate::das::Asset;
use crate::relay::RelayHandle;
use anyhow::{Context, Result};
use arc_swap::ArcSwap;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use futures_util::{sink::SinkExt, stream::StreamExt};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, info};
use uuid::Uuid;

#[derive(Clone)]
pub struct AppState {
    relay: RelayHandle,
    snapshot: Arc<ArcSwap<Vec<Asset>>>,
}

/// Démarre le serveur WebSocket/HTTP. Ne rend la main qu'à l'arrêt.
pub async fn serve(
    listen_addr: String,
    relay: RelayHandle,
    snapshot: Arc<ArcSwap<Vec<Asset>>>,
) -> Result<()> {
    let state = AppState { relay, snapshot };

    let app = Router::new()
        .route("/ws", get(websocket_handler))
        .route("/assets", get(assets_handler))
        .route("/health", get(|| async { "ok" }))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(&listen_addr)
        .await
        .with_context(|| format!("Impossible d'écouter sur {}", listen_addr))?;
    info!(addr = %listen_addr, "Serveur WebSocket/HTTP en écoute.");

    axum::serve(listener, app)
        .await
        .context("Le serveur HTTP s'est arrêté")?;
    Ok(())
}

// Snapshot HTTP en lecture seule : même contrat d'ordre que la diffusion
// WebSocket, lu sans verrou.
async fn assets_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.snapshot.load().as_ref().clone())
}

async fn websocket_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    // Identifiant de connexion opaque, généré à l'upgrade.
    let connection_id = Uuid::new_v4();
    let (mut sender, mut receiver) = socket.split();
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();

    // L'enregistrement déclenche côté relai : sonde de vivacité du
    // listener, resynchronisation, puis envoi du snapshot courant.
    state.relay.client_connected(connection_id, out_tx.clone());

    let mut send_task = tokio::spawn(async move {
        while let Some(payload) = out_rx.recv().await {
            if sender.send(Message::Text(payload)).await.is_err() {
                break;
            }
        }
    });

    let relay = state.relay.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(msg) = receiver.next().await {
            let msg = match msg {
                Ok(msg) => msg,
                Err(_) => break,
            };
            match msg {
                Message::Text(text) => {
                    // Réponse automatique au ping applicatif : la couche
                    // transport répond sans réveiller l'acteur.
                    if text == "ping" {
                        let _ = out_tx.send("pong".to_string());
                        continue;
                    }
                    relay.client_message(connection_id, text);
                }
                Message::Binary(_) => {
                    error!(connection_id = %connection_id, "Message non textuel reçu, ignoré.");
                }
                Message::Close(_) => break,
                // Ping/Pong protocolaires : gérés par axum.
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = (&mut send_task) => { recv_task.abort(); }
        _ = (&mut recv_task) => { send_task.abort(); }
    }

    // Pas de fuite d'entrées : la fermeture retire toujours le client
    // du registre.
    state.relay.client_disconnected(connection_id);
    info!(connection_id = %connection_id, "Connexion WebSocket fermée.");
}
