// DANS : src/alarm.rs

use crate::storage::KvStore;
use anyhow::Result;
use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::error;

// Granularité de la boucle de surveillance des échéances.
const POLL_INTERVAL_MS: i64 = 250;

/// Programme une alarme `delay_ms` dans le futur, seulement si aucune
/// n'est en attente ou si celle en attente est déjà dépassée. Une alarme
/// pendante dans le futur gagne toujours : on ne raccourcit jamais une
/// échéance existante.
pub fn check_and_set_alarm(store: &dyn KvStore, name: &str, delay_ms: i64) -> Result<()> {
    check_and_set_alarm_at(store, name, delay_ms, Utc::now().timestamp_millis())
}

fn check_and_set_alarm_at(store: &dyn KvStore, name: &str, delay_ms: i64, now_ms: i64) -> Result<()> {
    match store.get_alarm(name)? {
        Some(due) if due >= now_ms => {}
        _ => store.set_alarm(name, now_ms + delay_ms)?,
    }
    Ok(())
}

/// Tâche de fond qui surveille l'échéance persistée d'un acteur et
/// déclenche `on_alarm` quand elle arrive à terme. L'alarme est effacée
/// avant le déclenchement : c'est au handler de se réarmer.
pub fn spawn_alarm_scheduler<F>(
    store: Arc<dyn KvStore>,
    name: &'static str,
    on_alarm: F,
) -> JoinHandle<()>
where
    F: Fn() + Send + Sync + 'static,
{
    tokio::spawn(async move {
        loop {
            let due = match store.get_alarm(name) {
                Ok(due) => due,
                Err(e) => {
                    error!(alarm = name, error = %e, "Lecture de l'alarme impossible.");
                    tokio::time::sleep(Duration::from_millis(POLL_INTERVAL_MS as u64)).await;
                    continue;
                }
            };

            match due {
                Some(due) => {
                    let now = Utc::now().timestamp_millis();
                    if due <= now {
                        if let Err(e) = store.clear_alarm(name) {
                            error!(alarm = name, error = %e, "Effacement de l'alarme impossible.");
                        }
                        on_alarm();
                    } else {
                        let wait = (due - now).min(POLL_INTERVAL_MS);
                        tokio::time::sleep(Duration::from_millis(wait as u64)).await;
                    }
                }
                None => {
                    tokio::time::sleep(Duration::from_millis(POLL_INTERVAL_MS as u64)).await;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::MemoryStore;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn programme_une_alarme_quand_aucune_n_est_en_attente() {
        let store = MemoryStore::default();
        check_and_set_alarm_at(&store, "relay", 5000, 1_000_000).unwrap();
        assert_eq!(store.get_alarm("relay").unwrap(), Some(1_005_000));
    }

    #[test]
    fn une_alarme_future_en_attente_gagne() {
        let store = MemoryStore::default();
        store.set_alarm("relay", 1_001_000).unwrap();

        // delay=5000 à now=1_000_000 : l'échéance existante (now+1000) reste.
        check_and_set_alarm_at(&store, "relay", 5000, 1_000_000).unwrap();
        assert_eq!(store.get_alarm("relay").unwrap(), Some(1_001_000));
    }

    #[test]
    fn une_alarme_depassee_est_reprogrammee() {
        let store = MemoryStore::default();
        store.set_alarm("relay", 999_000).unwrap();

        check_and_set_alarm_at(&store, "relay", 5000, 1_000_000).unwrap();
        assert_eq!(store.get_alarm("relay").unwrap(), Some(1_005_000));
    }

    #[test]
    fn les_alarmes_des_deux_acteurs_sont_independantes() {
        let store = MemoryStore::default();
        check_and_set_alarm_at(&store, "listener", 5_000, 1_000_000).unwrap();
        check_and_set_alarm_at(&store, "relay", 600_000, 1_000_000).unwrap();
        assert_eq!(store.get_alarm("listener").unwrap(), Some(1_005_000));
        assert_eq!(store.get_alarm("relay").unwrap(), Some(1_600_000));
    }

    #[tokio::test]
    async fn le_scheduler_declenche_et_efface_l_alarme() {
        let store: Arc<dyn KvStore> = Arc::new(MemoryStore::default());
        let fired = Arc::new(AtomicUsize::new(0));

        let fired_clone = fired.clone();
        let handle = spawn_alarm_scheduler(store.clone(), "relay", move || {
            fired_clone.fetch_add(1, Ordering::SeqCst);
        });

        check_and_set_alarm(&*store, "relay", 50).unwrap();

        // Marge large : la boucle tourne avec un pas de 250 ms.
        for _ in 0..40 {
            if fired.load(Ordering::SeqCst) > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(store.get_alarm("relay").unwrap(), None);
        handle.abort();
    }
}
