// DANS : src/config.rs

use anyhow::{Context, Result};
use serde::Deserialize;
use solana_sdk::pubkey::Pubkey;
use std::str::FromStr;

fn default_listen_addr() -> String {
    "0.0.0.0:8787".to_string()
}

fn default_db_path() -> String {
    "relay_db".to_string()
}

#[derive(Deserialize, Debug)]
pub struct Config {
    /// URL du RPC HTTP (doit supporter l'API DAS : getAsset, searchAssets).
    pub rpc_url: String,
    /// URL du endpoint WebSocket pour les abonnements aux comptes.
    pub ws_url: String,
    /// Autorité de la pool (une des seeds de la PDA).
    pub authority_address: String,
    /// Collection mpl-core qui délimite les assets éligibles.
    pub collection_address: String,
    /// Adresse d'écoute du serveur WebSocket/HTTP.
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,
    /// Chemin du store RocksDB.
    #[serde(default = "default_db_path")]
    pub db_path: String,
}

impl Config {
    pub fn load() -> Result<Self> {
        dotenvy::dotenv().ok();
        let config = envy::from_env::<Config>()?;
        Ok(config)
    }

    /// Valide et parse l'adresse de l'autorité.
    pub fn authority(&self) -> Result<Pubkey> {
        Pubkey::from_str(&self.authority_address)
            .with_context(|| format!("AUTHORITY_ADDRESS invalide : {}", self.authority_address))
    }

    /// Valide et parse l'adresse de la collection.
    pub fn collection(&self) -> Result<Pubkey> {
        Pubkey::from_str(&self.collection_address)
            .with_context(|| format!("COLLECTION_ADDRESS invalide : {}", self.collection_address))
    }
}
