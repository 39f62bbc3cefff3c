// DANS : src/storage.rs

use crate::das::Asset;
use anyhow::{Context, Result};
use rocksdb::{Direction, IteratorMode, Options, WriteBatch, DB};
use std::collections::HashMap;
use std::path::Path;

// Préfixes de clés : les assets et les alarmes des deux acteurs
// cohabitent dans le même store.
const ASSET_PREFIX: &str = "asset:";
const ALARM_PREFIX: &str = "alarm:";

/// Le store durable vu par les acteurs. C'est la source de vérité entre
/// deux activations : l'état en mémoire n'est qu'un cache reconstruit
/// depuis ce store au démarrage.
pub trait KvStore: Send + Sync {
    /// Recharge l'intégralité de l'appartenance persistée.
    fn list_assets(&self) -> Result<HashMap<String, Asset>>;

    /// Écrit un lot d'assets. L'appelant découpe en lots de 128 maximum.
    fn put_assets(&self, entries: &[(String, Asset)]) -> Result<()>;

    /// Supprime un lot d'assets. Même plafond de 128 par lot.
    fn delete_assets(&self, ids: &[String]) -> Result<()>;

    /// Échéance (ms Unix) de l'alarme en attente pour un acteur, s'il y en a une.
    fn get_alarm(&self, name: &str) -> Result<Option<i64>>;

    fn set_alarm(&self, name: &str, due_ms: i64) -> Result<()>;

    fn clear_alarm(&self, name: &str) -> Result<()>;
}

// --- IMPLÉMENTATION ROCKSDB ---

pub struct RocksStore {
    db: DB,
}

impl RocksStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        let db = DB::open(&opts, path.as_ref())
            .with_context(|| format!("Échec de l'ouverture du store {:?}", path.as_ref()))?;
        Ok(Self { db })
    }

    fn asset_key(id: &str) -> String {
        format!("{}{}", ASSET_PREFIX, id)
    }

    fn alarm_key(name: &str) -> String {
        format!("{}{}", ALARM_PREFIX, name)
    }
}

impl KvStore for RocksStore {
    fn list_assets(&self) -> Result<HashMap<String, Asset>> {
        let mut assets = HashMap::new();
        let iter = self
            .db
            .iterator(IteratorMode::From(ASSET_PREFIX.as_bytes(), Direction::Forward));

        for entry in iter {
            let (key, value) = entry.context("Itération RocksDB interrompue")?;
            if !key.starts_with(ASSET_PREFIX.as_bytes()) {
                break;
            }
            let id = String::from_utf8_lossy(&key[ASSET_PREFIX.len()..]).into_owned();
            let asset: Asset = serde_json::from_slice(&value)
                .with_context(|| format!("Asset persisté illisible : {}", id))?;
            assets.insert(id, asset);
        }
        Ok(assets)
    }

    fn put_assets(&self, entries: &[(String, Asset)]) -> Result<()> {
        let mut batch = WriteBatch::default();
        for (id, asset) in entries {
            let value = serde_json::to_vec(asset)?;
            batch.put(Self::asset_key(id), value);
        }
        self.db.write(batch).context("Échec de l'écriture du lot d'assets")
    }

    fn delete_assets(&self, ids: &[String]) -> Result<()> {
        let mut batch = WriteBatch::default();
        for id in ids {
            batch.delete(Self::asset_key(id));
        }
        self.db.write(batch).context("Échec de la suppression du lot d'assets")
    }

    fn get_alarm(&self, name: &str) -> Result<Option<i64>> {
        let raw = self.db.get(Self::alarm_key(name))?;
        Ok(raw.and_then(|bytes| bytes.try_into().ok().map(i64::from_le_bytes)))
    }

    fn set_alarm(&self, name: &str, due_ms: i64) -> Result<()> {
        self.db
            .put(Self::alarm_key(name), due_ms.to_le_bytes())
            .with_context(|| format!("Échec de l'écriture de l'alarme {}", name))
    }

    fn clear_alarm(&self, name: &str) -> Result<()> {
        self.db
            .delete(Self::alarm_key(name))
            .with_context(|| format!("Échec de la suppression de l'alarme {}", name))
    }
}

// --- DOUBLE DE TEST EN MÉMOIRE ---

/// Store en mémoire pour les tests : mêmes sémantiques, et il enregistre
/// la taille de chaque lot reçu pour vérifier le plafond de 128.
#[cfg(test)]
pub mod memory {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    pub struct MemoryStore {
        pub assets: Mutex<HashMap<String, Asset>>,
        pub alarms: Mutex<HashMap<String, i64>>,
        pub put_batch_sizes: Mutex<Vec<usize>>,
        pub delete_batch_sizes: Mutex<Vec<usize>>,
    }

    impl KvStore for MemoryStore {
        fn list_assets(&self) -> Result<HashMap<String, Asset>> {
            Ok(self.assets.lock().unwrap().clone())
        }

        fn put_assets(&self, entries: &[(String, Asset)]) -> Result<()> {
            self.put_batch_sizes.lock().unwrap().push(entries.len());
            let mut assets = self.assets.lock().unwrap();
            for (id, asset) in entries {
                assets.insert(id.clone(), asset.clone());
            }
            Ok(())
        }

        fn delete_assets(&self, ids: &[String]) -> Result<()> {
            self.delete_batch_sizes.lock().unwrap().push(ids.len());
            let mut assets = self.assets.lock().unwrap();
            for id in ids {
                assets.remove(id);
            }
            Ok(())
        }

        fn get_alarm(&self, name: &str) -> Result<Option<i64>> {
            Ok(self.alarms.lock().unwrap().get(name).copied())
        }

        fn set_alarm(&self, name: &str, due_ms: i64) -> Result<()> {
            self.alarms.lock().unwrap().insert(name.to_string(), due_ms);
            Ok(())
        }

        fn clear_alarm(&self, name: &str) -> Result<()> {
            self.alarms.lock().unwrap().remove(name);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn asset(id: &str) -> Asset {
        serde_json::from_value(serde_json::json!({
            "id": id,
            "content": { "metadata": { "name": format!("Asset {}", id) } }
        }))
        .unwrap()
    }

    #[test]
    fn aller_retour_rocksdb() {
        let dir = TempDir::new().unwrap();
        let store = RocksStore::open(dir.path()).unwrap();

        store
            .put_assets(&[("a".into(), asset("a")), ("b".into(), asset("b"))])
            .unwrap();
        let listed = store.list_assets().unwrap();
        assert_eq!(listed.len(), 2);
        assert_eq!(listed["a"], asset("a"));

        store.delete_assets(&["a".into()]).unwrap();
        let listed = store.list_assets().unwrap();
        assert_eq!(listed.len(), 1);
        assert!(listed.contains_key("b"));
    }

    #[test]
    fn les_alarmes_ne_polluent_pas_la_liste_d_assets() {
        let dir = TempDir::new().unwrap();
        let store = RocksStore::open(dir.path()).unwrap();

        store.set_alarm("relay", 12345).unwrap();
        store.put_assets(&[("x".into(), asset("x"))]).unwrap();

        assert_eq!(store.get_alarm("relay").unwrap(), Some(12345));
        assert_eq!(store.get_alarm("listener").unwrap(), None);
        assert_eq!(store.list_assets().unwrap().len(), 1);

        store.clear_alarm("relay").unwrap();
        assert_eq!(store.get_alarm("relay").unwrap(), None);
    }
}
