// DANS : src/relay.rs

use crate::alarm::check_and_set_alarm;
use crate::das::{Asset, AssetIndex};
use crate::decoders::decode_asset_header;
use crate::listener::ListenerHandle;
use crate::monitoring::metrics;
use crate::pda::find_pool_pda;
use crate::storage::KvStore;
use anyhow::{Context, Result};
use arc_swap::ArcSwap;
use solana_sdk::pubkey::Pubkey;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use uuid::Uuid;

/// Nom de l'alarme de l'acteur dans le store durable.
pub const RELAY_ALARM_NAME: &str = "relay";
/// Resynchronisation complète périodique toutes les 10 minutes.
pub const RELAY_ALARM_MS: i64 = 10 * 60 * 1000;

// Plafond d'éléments par appel au store (limite du backend).
pub const MAX_PUTS: usize = 128;
pub const MAX_DELETES: usize = 128;

// Garde-fou sur les tampons de staging : au-delà, un côté enfle sans
// appariement (retraits en masse sans arrivées) et on force une
// resynchronisation complète plutôt que de laisser le déséquilibre croître.
const MAX_STAGED: usize = 64;

// --- COMMANDES ET POIGNÉE ---

pub enum RelayCommand {
    ChangeDetected { pubkey: String, data: Vec<u8> },
    Connected { id: Uuid, tx: mpsc::UnboundedSender<String> },
    Disconnected { id: Uuid },
    Message { id: Uuid, text: String },
    Alarm,
}

/// Poignée vers l'acteur PoolRelay. Le listener et le serveur WebSocket
/// ne parlent au relai que par messages.
#[derive(Clone)]
pub struct RelayHandle {
    tx: mpsc::UnboundedSender<RelayCommand>,
}

impl RelayHandle {
    /// Transmet une notification brute de changement de compte.
    pub fn change_detected(&self, pubkey: String, data: Vec<u8>) {
        let _ = self.tx.send(RelayCommand::ChangeDetected { pubkey, data });
    }

    pub fn client_connected(&self, id: Uuid, tx: mpsc::UnboundedSender<String>) {
        let _ = self.tx.send(RelayCommand::Connected { id, tx });
    }

    pub fn client_disconnected(&self, id: Uuid) {
        let _ = self.tx.send(RelayCommand::Disconnected { id });
    }

    pub fn client_message(&self, id: Uuid, text: String) {
        let _ = self.tx.send(RelayCommand::Message { id, text });
    }

    pub fn alarm(&self) {
        let _ = self.tx.send(RelayCommand::Alarm);
    }
}

// --- ÉTAT DE L'ACTEUR ---

/// Tampons d'attente de la réconciliation : une arrivée s'apparie avec
/// un départ, jamais l'un sans l'autre. Transitoires, jamais persistés.
#[derive(Default)]
struct Staged {
    to_add: Vec<Asset>,
    to_remove: Vec<Asset>,
}

/// Détient la vue autoritaire de l'appartenance à la pool, la persiste,
/// et la sert en temps réel aux clients WebSocket.
pub struct PoolRelay {
    pool: Pubkey,
    collection: Pubkey,
    assets: HashMap<String, Asset>,
    staged: Staged,
    clients: HashMap<Uuid, mpsc::UnboundedSender<String>>,
    store: Arc<dyn KvStore>,
    index: Arc<dyn AssetIndex>,
    listener: ListenerHandle,
    snapshot: Arc<ArcSwap<Vec<Asset>>>,
}

impl PoolRelay {
    /// Crée le canal de commandes avant l'acteur lui-même : la poignée
    /// doit exister pour construire le ChangeListener, qui est lui-même
    /// requis pour construire le relai.
    pub fn channel() -> (RelayHandle, mpsc::UnboundedReceiver<RelayCommand>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (RelayHandle { tx }, rx)
    }

    /// Démarre l'acteur et sa tâche d'alarme. Retourne le snapshot
    /// partagé, lu sans verrou par le serveur HTTP.
    pub fn spawn(
        rx: mpsc::UnboundedReceiver<RelayCommand>,
        handle: RelayHandle,
        listener: ListenerHandle,
        store: Arc<dyn KvStore>,
        index: Arc<dyn AssetIndex>,
        authority: Pubkey,
        collection: Pubkey,
    ) -> Arc<ArcSwap<Vec<Asset>>> {
        let (pool, _) = find_pool_pda(&authority, &collection);
        info!(pool = %pool, collection = %collection, "Adresse de la pool dérivée.");

        let snapshot = Arc::new(ArcSwap::from_pointee(Vec::new()));

        crate::alarm::spawn_alarm_scheduler(store.clone(), RELAY_ALARM_NAME, move || {
            handle.alarm();
        });

        let actor = PoolRelay {
            pool,
            collection,
            assets: HashMap::new(),
            staged: Staged::default(),
            clients: HashMap::new(),
            store,
            index,
            listener,
            snapshot: snapshot.clone(),
        };
        tokio::spawn(actor.run(rx));

        snapshot
    }

    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<RelayCommand>) {
        // Toute activation relance l'abonnement amont : la boucle de
        // consommation d'une vie antérieure n'alimente plus cet état.
        self.listener.listen_to_txs();

        // Hydratation avant le premier message : l'équivalent du verrou
        // d'exclusion de la construction. Aucun client ne peut observer
        // un état à moitié chargé.
        if let Err(e) = self.hydrate().await {
            error!(error = %e, "Échec de l'hydratation initiale.");
        }
        if let Err(e) = check_and_set_alarm(&*self.store, RELAY_ALARM_NAME, RELAY_ALARM_MS) {
            warn!(error = %e, "Impossible d'armer l'alarme du relai.");
        }

        while let Some(cmd) = rx.recv().await {
            match cmd {
                RelayCommand::ChangeDetected { pubkey, data } => {
                    if let Err(e) = self.change_detected(&pubkey, &data).await {
                        // Erreur de décodage ou de lookup : la notification
                        // est ignorée, le flux continue.
                        warn!(pubkey = %pubkey, error = %e, "Notification ignorée.");
                    }
                }
                RelayCommand::Connected { id, tx } => self.on_connected(id, tx).await,
                RelayCommand::Disconnected { id } => self.on_disconnected(id),
                RelayCommand::Message { id, text } => self.on_message(id, &text).await,
                RelayCommand::Alarm => self.on_alarm().await,
            }
        }
    }

    async fn hydrate(&mut self) -> Result<()> {
        self.assets = self.store.list_assets()?;
        info!(
            count = self.assets.len(),
            pool = %self.pool,
            "Appartenance rechargée depuis le store durable."
        );

        if self.assets.is_empty() {
            self.get_assets().await?;
        } else {
            metrics::POOL_ASSETS.set(self.assets.len() as i64);
            self.publish_snapshot();
        }
        Ok(())
    }

    /// Réconciliation incrémentale : une notification = au plus une mise
    /// en attente, puis drainage en paires appariées (coût O(1) par swap
    /// au lieu d'une resynchronisation complète).
    async fn change_detected(&mut self, pubkey: &str, data: &[u8]) -> Result<()> {
        let header = decode_asset_header(data)?;
        let tracked = self.assets.contains_key(pubkey);

        if header.owner == self.pool && !tracked {
            // Arrivée : on récupère l'enregistrement complet via l'index.
            let asset = self
                .index
                .get_asset(pubkey)
                .await
                .with_context(|| format!("Échec du getAsset pour {}", pubkey))?;
            self.staged.to_add.push(asset);
        } else if tracked {
            // Le compte vient de quitter la propriété de la pool.
            if let Some(existing) = self.assets.get(pubkey) {
                self.staged.to_remove.push(existing.clone());
            }
        }

        self.drain_staged();

        // Garde-fou : beaucoup de départs sans arrivées (ou l'inverse)
        // ne se draineront jamais. On repart d'une vue complète.
        if self.staged.to_add.len() > MAX_STAGED || self.staged.to_remove.len() > MAX_STAGED {
            warn!(
                to_add = self.staged.to_add.len(),
                to_remove = self.staged.to_remove.len(),
                "Tampons de staging déséquilibrés : resynchronisation forcée."
            );
            self.staged = Staged::default();
            self.get_assets().await?;
        }

        metrics::STAGED_TO_ADD.set(self.staged.to_add.len() as i64);
        metrics::STAGED_TO_REMOVE.set(self.staged.to_remove.len() as i64);
        Ok(())
    }

    // Post-condition : au moins un des deux tampons est vide.
    fn drain_staged(&mut self) {
        while !self.staged.to_add.is_empty() && !self.staged.to_remove.is_empty() {
            let removed = self.staged.to_remove.pop();
            let added = self.staged.to_add.pop();
            if let (Some(removed), Some(added)) = (removed, added) {
                // Un swap entièrement appliqué par itération : chaque
                // broadcast reflète un état cohérent.
                self.assets.remove(&removed.id);
                self.assets.insert(added.id.clone(), added);
                metrics::POOL_ASSETS.set(self.assets.len() as i64);
                self.schedule_save();
                self.broadcast();
            }
        }
    }

    /// Resynchronisation complète : la carte est remplacée en bloc par le
    /// résultat de l'index, persistée, puis diffusée à tous les clients.
    async fn get_assets(&mut self) -> Result<()> {
        let items = self
            .index
            .search_assets(&self.pool, &self.collection)
            .await
            .context("Échec du searchAssets pour la resynchronisation")?;

        self.assets = items.into_iter().map(|a| (a.id.clone(), a)).collect();
        metrics::POOL_ASSETS.set(self.assets.len() as i64);
        metrics::RESYNCS.inc();
        info!(count = self.assets.len(), "Resynchronisation complète de l'appartenance.");

        self.schedule_save();
        self.broadcast();
        Ok(())
    }

    /// Snapshot trié : nom d'affichage croissant, identifiant en départage.
    /// Tous les clients observent le même ordre.
    pub fn list(&self) -> Vec<Asset> {
        sorted_assets(&self.assets)
    }

    // Persistance fire-and-forget : un crash entre la mutation et
    // l'écriture perd au pire le delta non persisté, rattrapé par la
    // prochaine resynchronisation complète.
    fn schedule_save(&self) {
        let store = self.store.clone();
        let assets = self.assets.clone();
        tokio::task::spawn_blocking(move || {
            if let Err(e) = persist_snapshot(&*store, &assets) {
                error!(error = %e, "Échec de la persistance de l'appartenance.");
            }
        });
    }

    fn publish_snapshot(&self) {
        self.snapshot.store(Arc::new(self.list()));
    }

    fn broadcast(&mut self) {
        self.publish_snapshot();
        let payload = match serde_json::to_string(&self.list()) {
            Ok(payload) => payload,
            Err(e) => {
                error!(error = %e, "Sérialisation du snapshot impossible.");
                return;
            }
        };

        for (id, tx) in &self.clients {
            if tx.send(payload.clone()).is_err() {
                warn!(connection_id = %id, "Client injoignable pendant la diffusion.");
            }
        }
        metrics::BROADCASTS.inc();
    }

    fn emit_to(&self, id: &Uuid) {
        let Some(tx) = self.clients.get(id) else {
            return;
        };
        match serde_json::to_string(&self.list()) {
            Ok(payload) => {
                let _ = tx.send(payload);
            }
            Err(e) => error!(error = %e, "Sérialisation du snapshot impossible."),
        }
    }

    async fn on_connected(&mut self, id: Uuid, tx: mpsc::UnboundedSender<String>) {
        self.clients.insert(id, tx);
        metrics::CONNECTED_CLIENTS.set(self.clients.len() as i64);
        info!(connection_id = %id, "Nouveau client WebSocket.");

        self.listener.check_connected();
        if let Err(e) = self.get_assets().await {
            warn!(error = %e, "Resynchronisation à la connexion échouée.");
        }
        self.emit_to(&id);
    }

    fn on_disconnected(&mut self, id: Uuid) {
        self.clients.remove(&id);
        metrics::CONNECTED_CLIENTS.set(self.clients.len() as i64);
        info!(connection_id = %id, "Client WebSocket déconnecté.");
    }

    async fn on_message(&mut self, id: Uuid, text: &str) {
        if text == "refresh" {
            if let Err(e) = self.get_assets().await {
                warn!(error = %e, "Resynchronisation sur refresh échouée.");
            }
            self.emit_to(&id);
        }

        // Toute interaction cliente re-sonde la vivacité de l'abonnement.
        self.listener.check_connected();
    }

    async fn on_alarm(&mut self) {
        if let Err(e) = self.get_assets().await {
            warn!(error = %e, "Resynchronisation périodique échouée.");
        }
        if let Err(e) = check_and_set_alarm(&*self.store, RELAY_ALARM_NAME, RELAY_ALARM_MS) {
            warn!(error = %e, "Réarmement de l'alarme du relai impossible.");
        }
    }
}

/// Tri du snapshot visible par les clients : nom croissant, puis
/// identifiant pour les assets homonymes.
fn sorted_assets(assets: &HashMap<String, Asset>) -> Vec<Asset> {
    let mut items: Vec<Asset> = assets.values().cloned().collect();
    items.sort_by(|a, b| {
        a.display_name()
            .cmp(b.display_name())
            .then_with(|| a.id.cmp(&b.id))
    });
    items
}

/// Réconcilie le store avec la carte en mémoire : écrit le delta, supprime
/// les clés disparues, par lots plafonnés à 128 éléments.
pub fn persist_snapshot(store: &dyn KvStore, assets: &HashMap<String, Asset>) -> Result<()> {
    let from_storage = store.list_assets()?;

    let mut to_save: Vec<(String, Asset)> = Vec::new();
    for (id, asset) in assets {
        if from_storage.get(id) != Some(asset) {
            to_save.push((id.clone(), asset.clone()));
        }
    }
    let to_delete: Vec<String> = from_storage
        .keys()
        .filter(|id| !assets.contains_key(*id))
        .cloned()
        .collect();

    for chunk in to_save.chunks(MAX_PUTS) {
        store.put_assets(chunk)?;
    }
    for chunk in to_delete.chunks(MAX_DELETES) {
        store.delete_assets(chunk)?;
    }
    Ok(())
}
