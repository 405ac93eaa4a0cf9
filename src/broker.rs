// Le cœur du broker : l'état des files, la distribution équitable
// (round-robin + prefetch), le suivi des livraisons sans ACK et le cycle de
// nettoyage périodique. Tout l'état partagé vit derrière un unique verrou ;
// chaque section critique est bornée (mutation mémoire, au pire l'écriture
// du snapshot) et le verrou n'est jamais tenu pendant une requête réseau.
use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::BrokerConfig;
use crate::error::ApiError;
use crate::models::{CallbackPayload, Consumer, InFlight, Message, Queue};
use crate::persistence;
use crate::sender;

pub struct Broker {
    queues: Mutex<HashMap<String, Queue>>,
    config: BrokerConfig,
    http: reqwest::Client,
}

impl Broker {
    // Charge le snapshot avant toute requête : l'état durable précédent est
    // déjà en mémoire quand le serveur commence à écouter.
    pub fn new(config: BrokerConfig) -> Self {
        let queues = persistence::load_snapshot(&config.snapshot_file);
        Self {
            queues: Mutex::new(queues),
            config,
            http: sender::http_client(),
        }
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    // Lance la tâche périodique de nettoyage. Le corps du cycle est
    // `reaper_cycle`, appelable directement dans les tests avec une horloge
    // forgée ; ici on ne fait que cadencer.
    pub fn spawn_reaper(self: &Arc<Self>) {
        let broker = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(broker.config.reaper_period);
            // Le premier tick est immédiat, on le consomme.
            interval.tick().await;
            loop {
                interval.tick().await;
                broker.reaper_cycle(Utc::now()).await;
            }
        });
    }

    // Création idempotente : la première déclaration gagne, y compris pour le
    // drapeau de durabilité. Renvoie true si la file vient d'être créée.
    pub async fn declare(&self, name: &str, durable: bool) -> bool {
        let mut queues = self.queues.lock().await;

        if queues.contains_key(name) {
            info!("Queue '{}' already exists (idempotent declare)", name);
            return false;
        }

        queues.insert(name.to_string(), Queue::new(durable));
        info!("Queue '{}' created (durable: {})", name, durable);

        if durable {
            self.save_snapshot(&queues);
        }
        true
    }

    // Publie un message puis tente une distribution. La durabilité effective
    // exige que la publication ET la file soient durables.
    pub async fn publish(
        &self,
        name: &str,
        payload: Value,
        durable_msg: bool,
    ) -> Result<(), ApiError> {
        {
            let mut queues = self.queues.lock().await;

            let durable = match queues.get_mut(name) {
                None => {
                    warn!("Message pour la file inexistante '{}' perdu", name);
                    return Err(ApiError::LostPublish);
                }
                Some(queue) => {
                    let durable = durable_msg && queue.durable;
                    let message = Message {
                        id: Uuid::new_v4().to_string(),
                        payload,
                        enqueued_at: Utc::now(),
                        durable,
                    };
                    info!(
                        "Message {} (durable: {}) received for '{}'",
                        message.id, durable, name
                    );
                    queue.messages.push_back(message);
                    durable
                }
            };

            if durable {
                self.save_snapshot(&queues);
            }
        }

        self.try_dispatch(name).await;
        Ok(())
    }

    // Abonne un callback à une file, idempotent, puis tente une distribution
    // pour écouler l'arriéré éventuel.
    pub async fn subscribe(&self, name: &str, callback_url: &str) -> Result<(), ApiError> {
        {
            let mut queues = self.queues.lock().await;

            let Some(queue) = queues.get_mut(name) else {
                return Err(ApiError::NotFound(
                    "cola no existe, declárala primero".to_string(),
                ));
            };

            if queue.consumers.iter().any(|c| c.callback_url == callback_url) {
                info!("Consumer {} already subscribed to '{}'", callback_url, name);
            } else {
                queue.consumers.push(Consumer {
                    callback_url: callback_url.to_string(),
                    unacked_count: 0,
                });
                info!("New consumer {} subscribed to '{}'", callback_url, name);
            }
        }

        self.try_dispatch(name).await;
        Ok(())
    }

    // Acquitte une livraison. Non idempotent : un second ACK pour le même id
    // est un 404, le message est déjà détruit.
    pub async fn ack(&self, name: &str, message_id: &str) -> Result<(), ApiError> {
        {
            let mut queues = self.queues.lock().await;

            let durable = match queues.get_mut(name) {
                None => {
                    return Err(ApiError::NotFound(
                        "ack no válido o duplicado".to_string(),
                    ))
                }
                Some(queue) => {
                    let Some(flight) = queue.unacked.remove(message_id) else {
                        warn!(
                            "ACK reçu pour {} mais il n'était pas en vol",
                            message_id
                        );
                        return Err(ApiError::NotFound(
                            "ack no válido o duplicado".to_string(),
                        ));
                    };

                    match queue
                        .consumers
                        .iter_mut()
                        .find(|c| c.callback_url == flight.consumer_url)
                    {
                        Some(consumer) => {
                            consumer.unacked_count = consumer.unacked_count.saturating_sub(1);
                        }
                        // Le compteur est parti avec le consommateur.
                        None => warn!(
                            "Le consommateur {} qui a envoyé l'ACK n'est plus abonné",
                            flight.consumer_url
                        ),
                    }

                    info!("ACK received for {} on '{}'", message_id, name);
                    flight.message.durable
                }
            };

            if durable {
                self.save_snapshot(&queues);
            }
        }

        // Le consommateur vient de libérer une place : on redistribue.
        self.try_dispatch(name).await;
        Ok(())
    }

    pub async fn queue_names(&self) -> Vec<String> {
        let queues = self.queues.lock().await;
        queues.keys().cloned().collect()
    }

    // Détruit la file, ses messages et ses consommateurs.
    pub async fn delete(&self, name: &str) -> Result<(), ApiError> {
        let mut queues = self.queues.lock().await;

        let Some(queue) = queues.remove(name) else {
            return Err(ApiError::NotFound("cola no encontrada".to_string()));
        };

        info!(
            "Queue '{}' deleted ({} queued, {} in flight discarded)",
            name,
            queue.messages.len(),
            queue.unacked.len()
        );

        if queue.durable {
            self.save_snapshot(&queues);
        }
        Ok(())
    }

    // Distribution équitable : tant que la file a des messages et des
    // consommateurs, apparie le message de tête avec le premier consommateur
    // non saturé en partant du curseur round-robin. Les tâches d'envoi sont
    // lancées sans être attendues ; le verrou couvre au plus l'écriture du
    // snapshot, jamais le réseau.
    pub async fn try_dispatch(&self, name: &str) {
        let mut queues = self.queues.lock().await;

        let durable_changes = match queues.get_mut(name) {
            None => return,
            Some(queue) => {
                let mut durable_changes = false;

                while !queue.messages.is_empty() && !queue.consumers.is_empty() {
                    let count = queue.consumers.len();
                    let start = queue.rr_index % count;

                    // Premier consommateur sous son plafond de prefetch, en
                    // balayant circulairement depuis le curseur.
                    let mut found = None;
                    for offset in 0..count {
                        let idx = (start + offset) % count;
                        if queue.consumers[idx].unacked_count < self.config.prefetch_count {
                            found = Some(idx);
                            break;
                        }
                    }

                    let Some(idx) = found else {
                        info!("All consumers of '{}' are saturated, waiting for ACKs", name);
                        break;
                    };

                    queue.rr_index = (idx + 1) % count;

                    let Some(message) = queue.messages.pop_front() else {
                        break;
                    };

                    let consumer = &mut queue.consumers[idx];
                    consumer.unacked_count += 1;
                    let consumer_url = consumer.callback_url.clone();
                    info!(
                        "Message {} assigned to {} (unacked: {})",
                        message.id, consumer_url, consumer.unacked_count
                    );

                    if message.durable {
                        durable_changes = true;
                    }

                    let payload = CallbackPayload {
                        payload: message.payload.clone(),
                        message_id: message.id.clone(),
                    };
                    queue.unacked.insert(
                        message.id.clone(),
                        InFlight {
                            message,
                            sent_at: Utc::now(),
                            consumer_url: consumer_url.clone(),
                        },
                    );

                    sender::spawn_delivery(self.http.clone(), consumer_url, payload);
                }

                durable_changes
            }
        };

        if durable_changes {
            self.save_snapshot(&queues);
        }
    }

    // Un cycle du nettoyeur : expiration des messages des files sans
    // consommateurs, puis remise en file des livraisons dont l'ACK a expiré.
    // La redistribution des files touchées se fait verrou relâché.
    pub async fn reaper_cycle(&self, now: DateTime<Utc>) {
        let ack_timeout = chrono::Duration::seconds(self.config.ack_timeout.as_secs() as i64);
        let idle_expiry = chrono::Duration::seconds(self.config.idle_expiry.as_secs() as i64);
        let mut requeued_queues: Vec<String> = Vec::new();

        {
            let mut queues = self.queues.lock().await;
            let mut durable_changes = false;

            for (name, queue) in queues.iter_mut() {
                // L'expiration ne s'applique qu'aux files sans consommateurs ;
                // avec des consommateurs, c'est au dispatcher d'écouler.
                if queue.consumers.is_empty() {
                    queue.messages.retain(|message| {
                        let expired = now - message.enqueued_at > idle_expiry;
                        if expired {
                            info!(
                                "Message {} dropped from '{}' (expired without consumers)",
                                message.id, name
                            );
                            if message.durable {
                                durable_changes = true;
                            }
                        }
                        !expired
                    });
                }

                // Livraisons dont l'ACK n'est pas arrivé à temps.
                let timed_out: Vec<String> = queue
                    .unacked
                    .iter()
                    .filter(|(_, flight)| now - flight.sent_at > ack_timeout)
                    .map(|(id, _)| id.clone())
                    .collect();

                for id in &timed_out {
                    let Some(flight) = queue.unacked.remove(id) else {
                        continue;
                    };

                    warn!(
                        "Timeout d'ACK pour {} sur '{}', remise en tête de file",
                        id, name
                    );

                    // Consommateur disparu : son compteur est déjà parti.
                    if let Some(consumer) = queue
                        .consumers
                        .iter_mut()
                        .find(|c| c.callback_url == flight.consumer_url)
                    {
                        consumer.unacked_count = consumer.unacked_count.saturating_sub(1);
                    }

                    if flight.message.durable {
                        durable_changes = true;
                    }

                    // En tête : la redélivrance passe avant les publications
                    // plus récentes.
                    queue.messages.push_front(flight.message);
                }

                if !timed_out.is_empty() {
                    requeued_queues.push(name.clone());
                }
            }

            if durable_changes {
                self.save_snapshot(&queues);
            }
        }

        for name in requeued_queues {
            self.try_dispatch(&name).await;
        }
    }

    // L'échec d'un snapshot ne fait jamais échouer la requête d'origine :
    // l'état en mémoire reste la référence jusqu'à la prochaine écriture.
    fn save_snapshot(&self, queues: &HashMap<String, Queue>) {
        if let Err(e) = persistence::write_snapshot(&self.config.snapshot_file, queues) {
            error!(
                "Impossible d'écrire le snapshot {}: {}",
                self.config.snapshot_file.display(),
                e
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    // Un callback injoignable : l'envoi échoue en silence, ce qui est le
    // comportement attendu, l'état du broker ne dépend pas du POST.
    const DEAD_CALLBACK: &str = "http://127.0.0.1:9/cb";
    const DEAD_CALLBACK_2: &str = "http://127.0.0.1:9/cb2";

    fn test_broker(dir: &TempDir) -> Broker {
        let config = BrokerConfig {
            snapshot_file: dir.path().join("broker.json"),
            ..BrokerConfig::default()
        };
        Broker::new(config)
    }

    async fn assert_counters_match(broker: &Broker, name: &str) {
        let queues = broker.queues.lock().await;
        let queue = queues.get(name).unwrap();
        let total: usize = queue.consumers.iter().map(|c| c.unacked_count).sum();
        assert_eq!(total, queue.unacked.len());
    }

    #[tokio::test]
    async fn declare_is_idempotent_and_first_wins() {
        let dir = TempDir::new().unwrap();
        let broker = test_broker(&dir);

        assert!(broker.declare("q", true).await);
        assert!(!broker.declare("q", false).await);

        let queues = broker.queues.lock().await;
        assert!(queues.get("q").unwrap().durable);
    }

    #[tokio::test]
    async fn publish_to_missing_queue_is_lost() {
        let dir = TempDir::new().unwrap();
        let broker = test_broker(&dir);

        let result = broker.publish("nada", json!("x"), false).await;
        assert!(matches!(result, Err(ApiError::LostPublish)));
    }

    #[tokio::test]
    async fn subscribe_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let broker = test_broker(&dir);

        broker.declare("q", false).await;
        broker.subscribe("q", DEAD_CALLBACK).await.unwrap();
        broker.subscribe("q", DEAD_CALLBACK).await.unwrap();

        let queues = broker.queues.lock().await;
        assert_eq!(queues.get("q").unwrap().consumers.len(), 1);
    }

    #[tokio::test]
    async fn subscribe_to_missing_queue_fails() {
        let dir = TempDir::new().unwrap();
        let broker = test_broker(&dir);

        let result = broker.subscribe("nada", DEAD_CALLBACK).await;
        assert!(matches!(result, Err(ApiError::NotFound(_))));
    }

    #[tokio::test]
    async fn dispatch_respects_prefetch_and_fifo() {
        let dir = TempDir::new().unwrap();
        let broker = test_broker(&dir);

        broker.declare("q", false).await;
        broker.subscribe("q", DEAD_CALLBACK).await.unwrap();
        broker.publish("q", json!("uno"), false).await.unwrap();
        broker.publish("q", json!("dos"), false).await.unwrap();
        broker.publish("q", json!("tres"), false).await.unwrap();

        // Prefetch 1 : un seul message en vol, les autres attendent.
        let first_id = {
            let queues = broker.queues.lock().await;
            let queue = queues.get("q").unwrap();
            assert_eq!(queue.unacked.len(), 1);
            assert_eq!(queue.messages.len(), 2);
            assert_eq!(queue.consumers[0].unacked_count, 1);

            let flight = queue.unacked.values().next().unwrap();
            assert_eq!(flight.message.payload, json!("uno"));
            flight.message.id.clone()
        };

        // Chaque ACK libère une place, la distribution suit l'ordre FIFO.
        broker.ack("q", &first_id).await.unwrap();

        let queues = broker.queues.lock().await;
        let queue = queues.get("q").unwrap();
        assert_eq!(queue.unacked.len(), 1);
        assert_eq!(queue.messages.len(), 1);
        let flight = queue.unacked.values().next().unwrap();
        assert_eq!(flight.message.payload, json!("dos"));
    }

    #[tokio::test]
    async fn round_robin_alternates_between_consumers() {
        let dir = TempDir::new().unwrap();
        let broker = test_broker(&dir);

        broker.declare("q", false).await;
        broker.subscribe("q", DEAD_CALLBACK).await.unwrap();
        broker.subscribe("q", DEAD_CALLBACK_2).await.unwrap();

        for n in 0..4 {
            broker.publish("q", json!(n), false).await.unwrap();
        }

        let queues = broker.queues.lock().await;
        let queue = queues.get("q").unwrap();

        // Deux en vol (un par consommateur), deux en attente.
        assert_eq!(queue.unacked.len(), 2);
        assert_eq!(queue.messages.len(), 2);
        assert_eq!(queue.consumers[0].unacked_count, 1);
        assert_eq!(queue.consumers[1].unacked_count, 1);

        // Le curseur part de 0 : le premier message va au premier abonné.
        let to_first = queue
            .unacked
            .values()
            .find(|f| f.consumer_url == DEAD_CALLBACK)
            .unwrap();
        assert_eq!(to_first.message.payload, json!(0));
        let to_second = queue
            .unacked
            .values()
            .find(|f| f.consumer_url == DEAD_CALLBACK_2)
            .unwrap();
        assert_eq!(to_second.message.payload, json!(1));

        let total: usize = queue.consumers.iter().map(|c| c.unacked_count).sum();
        assert_eq!(total, queue.unacked.len());
    }

    #[tokio::test]
    async fn ack_is_not_idempotent() {
        let dir = TempDir::new().unwrap();
        let broker = test_broker(&dir);

        broker.declare("q", false).await;
        broker.subscribe("q", DEAD_CALLBACK).await.unwrap();
        broker.publish("q", json!("uno"), false).await.unwrap();

        let id = {
            let queues = broker.queues.lock().await;
            let queue = queues.get("q").unwrap();
            queue.unacked.keys().next().unwrap().clone()
        };

        broker.ack("q", &id).await.unwrap();
        let second = broker.ack("q", &id).await;
        assert!(matches!(second, Err(ApiError::NotFound(_))));

        assert_counters_match(&broker, "q").await;
    }

    #[tokio::test]
    async fn timed_out_delivery_is_redispatched_before_newer_messages() {
        let dir = TempDir::new().unwrap();
        let broker = test_broker(&dir);

        broker.declare("q", false).await;
        broker.subscribe("q", DEAD_CALLBACK).await.unwrap();
        broker.publish("q", json!("viejo"), false).await.unwrap();
        broker.publish("q", json!("nuevo"), false).await.unwrap();

        // "viejo" est en vol, "nuevo" attend. On vieillit la livraison
        // au-delà du timeout d'ACK.
        let old_id = {
            let mut queues = broker.queues.lock().await;
            let queue = queues.get_mut("q").unwrap();
            assert_eq!(queue.messages.len(), 1);
            let (id, flight) = queue.unacked.iter_mut().next().unwrap();
            flight.sent_at = flight.sent_at - chrono::Duration::seconds(120);
            id.clone()
        };

        broker.reaper_cycle(Utc::now()).await;

        // Le message expiré est repassé en tête puis redistribué avant
        // "nuevo" : même id de nouveau en vol, "nuevo" toujours en attente.
        let queues = broker.queues.lock().await;
        let queue = queues.get("q").unwrap();
        assert_eq!(queue.unacked.len(), 1);
        assert!(queue.unacked.contains_key(&old_id));
        assert_eq!(queue.messages.len(), 1);
        assert_eq!(queue.messages[0].payload, json!("nuevo"));
        assert_eq!(queue.consumers[0].unacked_count, 1);
    }

    #[tokio::test]
    async fn reaper_expires_only_consumerless_queues() {
        let dir = TempDir::new().unwrap();
        let broker = test_broker(&dir);

        broker.declare("sin", false).await;
        broker.publish("sin", json!("caduca"), false).await.unwrap();

        broker.declare("con", false).await;
        broker.subscribe("con", DEAD_CALLBACK).await.unwrap();
        broker.publish("con", json!("en vuelo"), false).await.unwrap();
        broker.publish("con", json!("en cola"), false).await.unwrap();

        // On vieillit tous les messages en attente au-delà de la rétention.
        {
            let mut queues = broker.queues.lock().await;
            for queue in queues.values_mut() {
                for message in queue.messages.iter_mut() {
                    message.enqueued_at = message.enqueued_at - chrono::Duration::seconds(600);
                }
            }
        }

        broker.reaper_cycle(Utc::now()).await;

        let queues = broker.queues.lock().await;
        // Sans consommateurs : le message expire.
        assert!(queues.get("sin").unwrap().messages.is_empty());
        // Avec consommateurs : la rétention ne s'applique pas.
        let con = queues.get("con").unwrap();
        assert_eq!(con.messages.len(), 1);
        assert_eq!(con.unacked.len(), 1);
    }

    #[tokio::test]
    async fn durable_publish_writes_snapshot() {
        let dir = TempDir::new().unwrap();
        let broker = test_broker(&dir);

        broker.declare("dq", true).await;
        broker.publish("dq", json!("x"), true).await.unwrap();

        let raw = std::fs::read_to_string(dir.path().join("broker.json")).unwrap();
        let doc: Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(doc["dq"]["mensajes"].as_array().unwrap().len(), 1);
        assert_eq!(doc["dq"]["mensajes"][0]["payload"], json!("x"));
    }

    #[tokio::test]
    async fn non_durable_message_in_durable_queue_is_not_written() {
        let dir = TempDir::new().unwrap();
        let broker = test_broker(&dir);

        broker.declare("dq", true).await;
        // Publication non durable : la file est dans le snapshot, pas le
        // message.
        broker.publish("dq", json!("efimero"), false).await.unwrap();

        let raw = std::fs::read_to_string(dir.path().join("broker.json")).unwrap();
        let doc: Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(doc["dq"]["mensajes"].as_array().unwrap().len(), 0);
    }

    #[tokio::test]
    async fn restart_preserves_durable_pending_messages() {
        let dir = TempDir::new().unwrap();

        {
            let broker = test_broker(&dir);
            broker.declare("dq", true).await;
            broker.subscribe("dq", DEAD_CALLBACK).await.unwrap();
            // "uno" part en vol, "dos" reste en attente ; les deux doivent
            // survivre au redémarrage, le message en vol redevenant en file.
            broker.publish("dq", json!("uno"), true).await.unwrap();
            broker.publish("dq", json!("dos"), true).await.unwrap();
        }

        let broker = test_broker(&dir);
        let queues = broker.queues.lock().await;
        let queue = queues.get("dq").unwrap();

        assert_eq!(queue.messages.len(), 2);
        // La livraison en vol revient en tête.
        assert_eq!(queue.messages[0].payload, json!("uno"));
        assert_eq!(queue.messages[1].payload, json!("dos"));
        assert!(queue.unacked.is_empty());
        assert!(queue.consumers.is_empty());
        assert_eq!(queue.rr_index, 0);
    }

    #[tokio::test]
    async fn non_durable_state_does_not_survive_restart() {
        let dir = TempDir::new().unwrap();

        {
            let broker = test_broker(&dir);
            broker.declare("efimera", false).await;
            broker.publish("efimera", json!("x"), true).await.unwrap();
            // Force une écriture du snapshot via une file durable.
            broker.declare("dq", true).await;
        }

        let broker = test_broker(&dir);
        let names = broker.queue_names().await;
        assert_eq!(names, vec!["dq".to_string()]);
    }

    #[tokio::test]
    async fn delete_destroys_queue_and_contents() {
        let dir = TempDir::new().unwrap();
        let broker = test_broker(&dir);

        broker.declare("q", false).await;
        broker.publish("q", json!("x"), false).await.unwrap();
        broker.delete("q").await.unwrap();

        assert!(broker.queue_names().await.is_empty());
        let again = broker.delete("q").await;
        assert!(matches!(again, Err(ApiError::NotFound(_))));
    }

    #[tokio::test]
    async fn delete_of_durable_queue_updates_snapshot() {
        let dir = TempDir::new().unwrap();
        let broker = test_broker(&dir);

        broker.declare("dq", true).await;
        broker.publish("dq", json!("x"), true).await.unwrap();
        broker.delete("dq").await.unwrap();

        let raw = std::fs::read_to_string(dir.path().join("broker.json")).unwrap();
        let doc: Value = serde_json::from_str(&raw).unwrap();
        assert!(doc.get("dq").is_none());
    }

    #[tokio::test]
    async fn saturated_consumers_leave_messages_queued() {
        let dir = TempDir::new().unwrap();
        let broker = test_broker(&dir);

        broker.declare("q", false).await;
        broker.subscribe("q", DEAD_CALLBACK).await.unwrap();
        broker.subscribe("q", DEAD_CALLBACK_2).await.unwrap();

        for n in 0..5 {
            broker.publish("q", json!(n), false).await.unwrap();
        }

        // Deux consommateurs saturés : les trois messages restants attendent
        // un ACK, et une distribution supplémentaire ne change rien.
        broker.try_dispatch("q").await;

        let queues = broker.queues.lock().await;
        let queue = queues.get("q").unwrap();
        assert_eq!(queue.unacked.len(), 2);
        assert_eq!(queue.messages.len(), 3);
    }
}
