// Couche de durabilité : un unique fichier JSON contenant la projection
// durable de l'état (files durables, et dans chacune les seuls messages
// durables). L'écriture passe par un fichier temporaire puis un rename,
// atomique sur le système de fichiers : un lecteur voit l'ancien état ou le
// nouveau, jamais un fichier partiel.
use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{info, warn};

use crate::models::{Message, Queue};

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("E/S: {0}")]
    Io(#[from] std::io::Error),
    #[error("sérialisation: {0}")]
    Serialize(#[from] serde_json::Error),
}

// --- Formes sérialisables, doublures des types d'exécution ---
// Les horodatages sont stockés en chaînes RFC 3339.

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredMessage {
    pub id: String,
    pub payload: Value,
    pub timestamp: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredConsumer {
    pub unacked_count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredInFlight {
    #[serde(rename = "mensaje_obj")]
    pub message: StoredMessage,
    #[serde(rename = "timestamp_envio")]
    pub sent_at: String,
    pub consumer_url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredQueue {
    #[serde(default)]
    pub durable: bool,
    #[serde(default, rename = "indice_rr")]
    pub rr_index: usize,
    #[serde(default, rename = "consumidores")]
    pub consumers: BTreeMap<String, StoredConsumer>,
    #[serde(default, rename = "mensajes")]
    pub messages: Vec<StoredMessage>,
    #[serde(default)]
    pub unacked: BTreeMap<String, StoredInFlight>,
}

fn stored_message(message: &Message) -> StoredMessage {
    StoredMessage {
        id: message.id.clone(),
        payload: message.payload.clone(),
        timestamp: message.enqueued_at.to_rfc3339(),
    }
}

// Projection durable de l'état : files non durables et messages non durables
// exclus. Les URLs des consommateurs sont conservées mais leurs compteurs ne
// sont pas dignes de confiance après un redémarrage, on écrit zéro.
fn project(queues: &HashMap<String, Queue>) -> BTreeMap<String, StoredQueue> {
    let mut stored = BTreeMap::new();

    for (name, queue) in queues {
        if !queue.durable {
            continue;
        }

        let messages = queue
            .messages
            .iter()
            .filter(|m| m.durable)
            .map(stored_message)
            .collect();

        let consumers = queue
            .consumers
            .iter()
            .map(|c| (c.callback_url.clone(), StoredConsumer { unacked_count: 0 }))
            .collect();

        let unacked = queue
            .unacked
            .iter()
            .filter(|(_, flight)| flight.message.durable)
            .map(|(id, flight)| {
                (
                    id.clone(),
                    StoredInFlight {
                        message: stored_message(&flight.message),
                        sent_at: flight.sent_at.to_rfc3339(),
                        consumer_url: flight.consumer_url.clone(),
                    },
                )
            })
            .collect();

        stored.insert(
            name.clone(),
            StoredQueue {
                durable: true,
                rr_index: queue.rr_index,
                consumers,
                messages,
                unacked,
            },
        );
    }

    stored
}

// Écrit la projection durable sur disque. À appeler avec le verrou du broker
// tenu pour que le fichier reflète un état cohérent.
pub fn write_snapshot(path: &Path, queues: &HashMap<String, Queue>) -> Result<(), SnapshotError> {
    let stored = project(queues);
    let bytes = serde_json::to_vec_pretty(&stored)?;

    let tmp = tmp_path(path);
    fs::write(&tmp, &bytes)?;
    if let Err(e) = fs::rename(&tmp, path) {
        let _ = fs::remove_file(&tmp);
        return Err(e.into());
    }

    Ok(())
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    PathBuf::from(tmp)
}

// Charge le snapshot au démarrage. Fichier absent ou illisible : on repart
// d'un état vide, le broker reste utilisable.
pub fn load_snapshot(path: &Path) -> HashMap<String, Queue> {
    let raw = match fs::read(path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            info!("No snapshot at {}, starting with empty state", path.display());
            return HashMap::new();
        }
        Err(e) => {
            warn!(
                "Lecture du snapshot {} impossible: {}. Démarrage à vide.",
                path.display(),
                e
            );
            return HashMap::new();
        }
    };

    let stored: BTreeMap<String, StoredQueue> = match serde_json::from_slice(&raw) {
        Ok(stored) => stored,
        Err(e) => {
            warn!(
                "Snapshot {} corrompu: {}. Démarrage à vide.",
                path.display(),
                e
            );
            return HashMap::new();
        }
    };

    info!("Loading state from {}", path.display());
    restore(stored)
}

fn restore(stored: BTreeMap<String, StoredQueue>) -> HashMap<String, Queue> {
    let mut queues = HashMap::new();

    for (name, stored_queue) in stored {
        if !stored_queue.durable {
            continue;
        }

        let mut queue = Queue::new(true);

        for stored_msg in &stored_queue.messages {
            match runtime_message(stored_msg) {
                Some(message) => queue.messages.push_back(message),
                None => warn!(
                    "Horodatage invalide pour le message {}, message écarté",
                    stored_msg.id
                ),
            }
        }

        // Toute livraison en vol à l'arrêt est considérée non livrée : on la
        // remet en tête de file. Redélivrance possible, c'est le compromis
        // at-least-once.
        for (id, flight) in &stored_queue.unacked {
            match runtime_message(&flight.message) {
                Some(message) => {
                    info!("Re-queueing in-flight message {} of '{}' after restart", id, name);
                    queue.messages.push_front(message);
                }
                None => warn!(
                    "Horodatage invalide pour le message en vol {}, message écarté",
                    id
                ),
            }
        }

        // Les consommateurs ne sont pas réinstaurés : le broker ne peut pas
        // savoir s'ils existent encore. rr_index repart de zéro.
        queues.insert(name, queue);
    }

    queues
}

fn runtime_message(stored: &StoredMessage) -> Option<Message> {
    let enqueued_at = DateTime::parse_from_rfc3339(&stored.timestamp)
        .ok()?
        .with_timezone(&Utc);

    Some(Message {
        id: stored.id.clone(),
        payload: stored.payload.clone(),
        enqueued_at,
        durable: true,
    })
}
