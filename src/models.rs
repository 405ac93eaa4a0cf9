// Ce fichier définit les structures de données du broker : l'état en mémoire
// des files (colas) et les corps de requêtes/réponses de l'API HTTP.
use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

// Un message accepté par le broker. Le payload est du JSON opaque : le broker
// ne l'inspecte jamais. `durable` n'est vrai que si la publication ET la file
// ont demandé la durabilité.
#[derive(Debug, Clone)]
pub struct Message {
    pub id: String,
    pub payload: Value,
    pub enqueued_at: DateTime<Utc>,
    pub durable: bool,
}

// Un consommateur abonné à une file. `unacked_count` compte les messages en
// vol vers ce callback, borné par PREFETCH_COUNT.
#[derive(Debug, Clone)]
pub struct Consumer {
    pub callback_url: String,
    pub unacked_count: usize,
}

// Une livraison en attente d'ACK.
#[derive(Debug, Clone)]
pub struct InFlight {
    pub message: Message,
    pub sent_at: DateTime<Utc>,
    pub consumer_url: String,
}

// L'état d'une file. Invariants maintenus sous le verrou du broker :
// - un message est soit dans `messages`, soit dans `unacked`, jamais les deux ;
// - la somme des `unacked_count` des consommateurs égale `unacked.len()`.
#[derive(Debug)]
pub struct Queue {
    pub durable: bool,
    // FIFO ; la remise en file après timeout se fait par l'avant.
    pub messages: VecDeque<Message>,
    // L'ordre d'insertion porte le round-robin.
    pub consumers: Vec<Consumer>,
    pub rr_index: usize,
    pub unacked: HashMap<String, InFlight>,
}

impl Queue {
    pub fn new(durable: bool) -> Self {
        Self {
            durable,
            messages: VecDeque::new(),
            consumers: Vec::new(),
            rr_index: 0,
            unacked: HashMap::new(),
        }
    }
}

// --- Corps de requêtes de l'API ---
// Les champs sont optionnels pour que l'absence d'un champ donne un 400 avec
// un corps {"error": ...} plutôt qu'un rejet de désérialisation.

#[derive(Debug, Deserialize)]
pub struct DeclareRequest {
    #[serde(rename = "nombre")]
    pub queue: Option<String>,
    #[serde(default)]
    pub durable: bool,
}

#[derive(Debug, Deserialize)]
pub struct PublishRequest {
    #[serde(rename = "nombre")]
    pub queue: Option<String>,
    #[serde(rename = "mensaje")]
    pub payload: Option<Value>,
    #[serde(default)]
    pub durable: bool,
}

#[derive(Debug, Deserialize)]
pub struct SubscribeRequest {
    #[serde(rename = "nombre")]
    pub queue: Option<String>,
    pub callback_url: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct AckRequest {
    pub message_id: Option<String>,
    #[serde(rename = "nombre_cola")]
    pub queue: Option<String>,
}

// Corps du POST envoyé au callback d'un consommateur.
#[derive(Debug, Clone, Serialize)]
pub struct CallbackPayload {
    #[serde(rename = "mensaje")]
    pub payload: Value,
    pub message_id: String,
}
