// DANS : src/listener.rs

use crate::alarm::check_and_set_alarm;
use crate::decoders::COLLECTION_MEMCMP_OFFSET;
use crate::monitoring::metrics;
use crate::pda::CORE_PROGRAM_ID;
use crate::relay::RelayHandle;
use crate::storage::KvStore;
use anyhow::{anyhow, Context, Result};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use futures_util::StreamExt;
use rand::Rng;
use solana_account_decoder::{UiAccountData, UiAccountEncoding};
use solana_client::nonblocking::pubsub_client::PubsubClient;
use solana_client::rpc_config::{RpcAccountInfoConfig, RpcProgramAccountsConfig};
use solana_client::rpc_filter::{Memcmp, RpcFilterType};
use solana_sdk::commitment_config::CommitmentConfig;
use solana_sdk::pubkey::Pubkey;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// Nom de l'alarme de l'acteur dans le store durable.
pub const LISTENER_ALARM_NAME: &str = "listener";
/// L'auto-réparation périodique se réarme toutes les 5 secondes.
pub const LISTENER_ALARM_MS: i64 = 5_000;

// Une connexion qui a tenu au moins aussi longtemps est considérée
// saine : le backoff repart de zéro.
const HEALTHY_CONNECTION_SECS: u64 = 60;

// --- BACKOFF DE RECONNEXION ---

/// Backoff exponentiel plafonné avec jitter plein sur la moitié haute :
/// le délai rendu est tiré dans [exp/2, exp].
pub struct Backoff {
    base: Duration,
    cap: Duration,
    attempt: u32,
}

impl Backoff {
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self { base, cap, attempt: 0 }
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn next_delay(&mut self) -> Duration {
        let exp = self
            .base
            .saturating_mul(2u32.saturating_pow(self.attempt))
            .min(self.cap);
        self.attempt = self.attempt.saturating_add(1);

        let half = exp / 2;
        let jitter_ms = rand::thread_rng().gen_range(0..=half.as_millis() as u64);
        half + Duration::from_millis(jitter_ms)
    }
}

// --- ACTEUR ---

enum ListenerCommand {
    Listen,
    CheckConnected,
    Alarm,
}

/// Poignée vers l'acteur ChangeListener. Tous les appels sont des envois
/// de messages : l'état interne n'est jamais partagé.
#[derive(Clone)]
pub struct ListenerHandle {
    tx: mpsc::UnboundedSender<ListenerCommand>,
}

impl ListenerHandle {
    /// Redémarre l'abonnement : la génération précédente est annulée d'abord.
    pub fn listen_to_txs(&self) {
        let _ = self.tx.send(ListenerCommand::Listen);
    }

    /// Sonde de vivacité : ne redémarre que si la génération courante est morte.
    pub fn check_connected(&self) {
        let _ = self.tx.send(ListenerCommand::CheckConnected);
    }

    pub fn alarm(&self) {
        let _ = self.tx.send(ListenerCommand::Alarm);
    }

    /// Poignée détachée pour les tests du relai : les envois partent
    /// dans le vide.
    #[cfg(test)]
    pub fn noop() -> Self {
        let (tx, _rx) = mpsc::unbounded_channel();
        Self { tx }
    }
}

/// Détient l'unique abonnement aux notifications de changement de comptes
/// de la collection, et transmet chaque notification porteuse de données
/// au PoolRelay.
pub struct ChangeListener {
    ws_url: String,
    collection: Pubkey,
    relay: RelayHandle,
    store: Arc<dyn KvStore>,
    generation: u64,
    current: Option<(u64, JoinHandle<()>)>,
}

impl ChangeListener {
    /// Démarre l'acteur et sa tâche d'alarme, et rend sa poignée.
    pub fn spawn(
        ws_url: String,
        collection: Pubkey,
        relay: RelayHandle,
        store: Arc<dyn KvStore>,
    ) -> ListenerHandle {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = ListenerHandle { tx };

        let alarm_handle = handle.clone();
        crate::alarm::spawn_alarm_scheduler(store.clone(), LISTENER_ALARM_NAME, move || {
            alarm_handle.alarm();
        });

        let actor = ChangeListener {
            ws_url,
            collection,
            relay,
            store,
            generation: 0,
            current: None,
        };
        tokio::spawn(actor.run(rx));

        handle
    }

    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<ListenerCommand>) {
        if let Err(e) = check_and_set_alarm(&*self.store, LISTENER_ALARM_NAME, LISTENER_ALARM_MS) {
            warn!(error = %e, "Impossible d'armer l'alarme initiale du listener.");
        }

        while let Some(cmd) = rx.recv().await {
            match cmd {
                ListenerCommand::Listen => self.start_subscription(),
                ListenerCommand::CheckConnected => {
                    if self.is_dead() {
                        info!("Sonde de vivacité : abonnement mort, redémarrage.");
                        self.start_subscription();
                    }
                }
                ListenerCommand::Alarm => {
                    if self.is_dead() {
                        info!("Alarme : abonnement mort, redémarrage.");
                        self.start_subscription();
                    }
                    if let Err(e) =
                        check_and_set_alarm(&*self.store, LISTENER_ALARM_NAME, LISTENER_ALARM_MS)
                    {
                        warn!(error = %e, "Réarmement de l'alarme du listener impossible.");
                    }
                }
            }
        }
    }

    // Une seule génération logiquement active : pas de poignée, ou une
    // tâche déjà terminée, signifie que le flux est mort.
    fn is_dead(&self) -> bool {
        match &self.current {
            Some((_, handle)) => handle.is_finished(),
            None => true,
        }
    }

    fn start_subscription(&mut self) {
        if let Some((generation, handle)) = self.current.take() {
            handle.abort();
            info!(generation, "Génération d'abonnement précédente annulée.");
        }

        self.generation += 1;
        metrics::SUBSCRIPTION_RESTARTS.inc();

        let task = tokio::spawn(subscription_task(
            self.ws_url.clone(),
            self.collection,
            self.relay.clone(),
            self.generation,
        ));
        self.current = Some((self.generation, task));
    }
}

// La boucle de reconnexion d'une génération : chaque échec de transport
// est suivi d'une nouvelle tentative après backoff. Les erreurs de
// décodage ne passent jamais par ici, elles sont traitées en aval dans
// le relai, notification par notification.
async fn subscription_task(
    ws_url: String,
    collection: Pubkey,
    relay: RelayHandle,
    generation: u64,
) {
    let mut backoff = Backoff::new(Duration::from_millis(500), Duration::from_secs(30));

    loop {
        let started = Instant::now();
        if let Err(e) = run_subscription(&ws_url, &collection, &relay).await {
            warn!(generation, error = %e, "Flux de notifications interrompu.");
        }

        if started.elapsed() > Duration::from_secs(HEALTHY_CONNECTION_SECS) {
            backoff.reset();
        }

        let delay = backoff.next_delay();
        info!(
            generation,
            delay_ms = delay.as_millis() as u64,
            "Nouvelle tentative d'abonnement après backoff."
        );
        tokio::time::sleep(delay).await;
    }
}

async fn run_subscription(ws_url: &str, collection: &Pubkey, relay: &RelayHandle) -> Result<()> {
    let client = PubsubClient::new(ws_url)
        .await
        .context("Connexion au endpoint WebSocket impossible")?;

    // Filtre memcmp : l'adresse de la collection à son offset fixe dans
    // le layout AssetV1.
    let config = RpcProgramAccountsConfig {
        filters: Some(vec![RpcFilterType::Memcmp(Memcmp::new_base58_encoded(
            COLLECTION_MEMCMP_OFFSET,
            collection.as_ref(),
        ))]),
        account_config: RpcAccountInfoConfig {
            encoding: Some(UiAccountEncoding::Base64),
            commitment: Some(CommitmentConfig::confirmed()),
            ..Default::default()
        },
        ..Default::default()
    };

    let (mut stream, _unsubscribe) = client
        .program_subscribe(&CORE_PROGRAM_ID, Some(config))
        .await
        .context("Échec de l'abonnement aux notifications de programme")?;

    info!(program = %CORE_PROGRAM_ID, collection = %collection, "Abonnement aux changements de comptes actif.");

    while let Some(response) = stream.next().await {
        metrics::NOTIFICATIONS_RECEIVED.inc();

        let keyed = response.value;
        let data = match keyed.account.data {
            UiAccountData::Binary(encoded, _) => STANDARD.decode(encoded).unwrap_or_default(),
            _ => Vec::new(),
        };
        // Notification sans données de compte : rien à réconcilier.
        if data.is_empty() {
            continue;
        }

        relay.change_detected(keyed.pubkey, data);
    }

    Err(anyhow!(
        "Le flux de notifications s'est terminé de manière inattendue."
    ))
}
