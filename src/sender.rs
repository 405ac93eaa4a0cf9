// Envoi des messages aux callbacks des consommateurs. Tâche une-fois,
// lancée hors du chemin critique : le dispatcher a déjà déplacé le message
// vers `unacked`, le succès du POST n'est pas observable depuis le broker.
// Seul l'ACK du consommateur fait foi ; en son absence, le timeout d'ACK
// remettra le message en file.
use std::time::Duration;

use tracing::{info, warn};

use crate::models::CallbackPayload;

// Timeout court du POST sortant ; au-delà on abandonne en silence.
pub const CALLBACK_TIMEOUT: Duration = Duration::from_secs(3);

// Client partagé, construit une fois par broker et cloné par tâche.
pub fn http_client() -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(CALLBACK_TIMEOUT)
        .build()
        .expect("construction du client HTTP")
}

// Un POST vers le callback, puis terminé. Ne touche jamais l'état du broker,
// ne remonte jamais d'erreur : tout échec est journalisé et oublié.
pub fn spawn_delivery(client: reqwest::Client, callback_url: String, payload: CallbackPayload) {
    tokio::spawn(async move {
        let message_id = payload.message_id.clone();

        match client.post(&callback_url).json(&payload).send().await {
            Ok(response) if response.status().is_success() => {
                info!("Message {} sent to {}", message_id, callback_url);
            }
            Ok(response) => {
                warn!(
                    "Le consommateur {} a répondu {} pour le message {}",
                    callback_url,
                    response.status(),
                    message_id
                );
            }
            Err(e) => {
                warn!(
                    "Échec de l'envoi du message {} à {}: {}",
                    message_id, callback_url, e
                );
            }
        }
    });
}
