// DANS : src/das.rs

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use solana_sdk::pubkey::Pubkey;

// Taille de page maximale acceptée par searchAssets.
const SEARCH_PAGE_LIMIT: usize = 1000;

// --- MODÈLE D'ASSET (enregistrement DAS) ---

// On ne type que les champs dont le relai a besoin (id, nom, propriétaire).
// Tout le reste de l'enregistrement renvoyé par l'indexeur est conservé
// tel quel dans `extra` et retransmis intact aux clients WebSocket.

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssetMetadata {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssetContent {
    #[serde(default)]
    pub metadata: Option<AssetMetadata>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssetOwnership {
    #[serde(default)]
    pub owner: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Asset {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<AssetContent>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ownership: Option<AssetOwnership>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl Asset {
    /// Nom d'affichage utilisé pour le tri du snapshot. Les assets sans
    /// métadonnées passent en tête (chaîne vide).
    pub fn display_name(&self) -> &str {
        self.content
            .as_ref()
            .and_then(|c| c.metadata.as_ref())
            .and_then(|m| m.name.as_deref())
            .unwrap_or("")
    }
}

// --- INTERFACE DU COLLABORATEUR D'INDEXATION ---

/// Le service d'indexation vu par le relai. Derrière un trait pour que
/// les tests puissent substituer un index en mémoire au vrai endpoint DAS.
#[async_trait]
pub trait AssetIndex: Send + Sync {
    /// Récupère l'enregistrement complet d'un asset par son identifiant.
    async fn get_asset(&self, id: &str) -> Result<Asset>;

    /// Liste tous les assets détenus par `owner` dans `collection`.
    async fn search_assets(&self, owner: &Pubkey, collection: &Pubkey) -> Result<Vec<Asset>>;
}

// --- CLIENT DAS JSON-RPC ---

#[derive(Debug, Deserialize)]
struct RpcError {
    code: i64,
    message: String,
}

#[derive(Debug, Deserialize)]
struct RpcEnvelope<T> {
    result: Option<T>,
    error: Option<RpcError>,
}

#[derive(Debug, Deserialize)]
struct SearchAssetsPage {
    items: Vec<Asset>,
}

/// Client JSON-RPC minimal pour l'API DAS (getAsset / searchAssets).
pub struct DasClient {
    http: reqwest::Client,
    url: String,
}

impl DasClient {
    pub fn new(url: String) -> Self {
        Self {
            http: reqwest::Client::new(),
            url,
        }
    }

    // Les méthodes DAS attendent un objet en guise de `params`,
    // pas un tableau positionnel.
    async fn call<T: serde::de::DeserializeOwned>(
        &self,
        method: &str,
        params: serde_json::Value,
    ) -> Result<T> {
        let body = json!({
            "jsonrpc": "2.0",
            "id": "floor-relay",
            "method": method,
            "params": params,
        });

        let envelope: RpcEnvelope<T> = self
            .http
            .post(&self.url)
            .json(&body)
            .send()
            .await
            .with_context(|| format!("Échec de l'appel DAS {}", method))?
            .json()
            .await
            .with_context(|| format!("Réponse DAS illisible pour {}", method))?;

        if let Some(err) = envelope.error {
            return Err(anyhow!("Erreur DAS {} ({}) : {}", method, err.code, err.message));
        }
        envelope
            .result
            .ok_or_else(|| anyhow!("Réponse DAS {} sans résultat", method))
    }
}

#[async_trait]
impl AssetIndex for DasClient {
    async fn get_asset(&self, id: &str) -> Result<Asset> {
        self.call("getAsset", json!({ "id": id })).await
    }

    async fn search_assets(&self, owner: &Pubkey, collection: &Pubkey) -> Result<Vec<Asset>> {
        let mut items = Vec::new();
        let mut page = 1usize;

        loop {
            let result: SearchAssetsPage = self
                .call(
                    "searchAssets",
                    json!({
                        "ownerAddress": owner.to_string(),
                        "grouping": ["collection", collection.to_string()],
                        "page": page,
                        "limit": SEARCH_PAGE_LIMIT,
                    }),
                )
                .await?;

            let fetched = result.items.len();
            items.extend(result.items);

            if fetched < SEARCH_PAGE_LIMIT {
                return Ok(items);
            }
            page += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_d_un_enregistrement_das() {
        let raw = serde_json::json!({
            "id": "3z1X...asset",
            "interface": "MplCoreAsset",
            "content": {
                "json_uri": "https://example.com/1.json",
                "metadata": { "name": "Midevil #42", "symbol": "MID" }
            },
            "ownership": { "owner": "Pool1111111111111111111111111111", "frozen": false },
            "burnt": false
        });

        let asset: Asset = serde_json::from_value(raw.clone()).unwrap();
        assert_eq!(asset.id, "3z1X...asset");
        assert_eq!(asset.display_name(), "Midevil #42");
        assert_eq!(
            asset.ownership.as_ref().unwrap().owner.as_deref(),
            Some("Pool1111111111111111111111111111")
        );

        // Les champs non typés survivent à un aller-retour de sérialisation.
        let back = serde_json::to_value(&asset).unwrap();
        assert_eq!(back["interface"], "MplCoreAsset");
        assert_eq!(back["burnt"], false);
        assert_eq!(back["content"]["json_uri"], "https://example.com/1.json");
        assert_eq!(back["ownership"]["frozen"], false);
    }

    #[test]
    fn nom_d_affichage_par_defaut() {
        let asset: Asset = serde_json::from_value(serde_json::json!({ "id": "x" })).unwrap();
        assert_eq!(asset.display_name(), "");
    }
}
