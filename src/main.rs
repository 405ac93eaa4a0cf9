// Point d'entrée du broker : charge l'état durable, lance le nettoyeur
// périodique, tente une première distribution pour les files restaurées,
// puis sert l'API de contrôle.
use std::net::SocketAddr;
use std::sync::Arc;

use tracing::info;

use broker_server::app_state::AppState;
use broker_server::broker::Broker;
use broker_server::config::BrokerConfig;
use broker_server::handlers;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let config = BrokerConfig::from_env();
    let port = config.port;

    // Le snapshot est chargé ici, avant d'accepter la moindre requête.
    let broker = Arc::new(Broker::new(config));
    broker.spawn_reaper();

    // Première passe de distribution sur les files restaurées. Les
    // consommateurs ne sont pas réinstaurés au démarrage, les messages
    // rechargés partiront donc au fil des réabonnements.
    for name in broker.queue_names().await {
        info!("Initial dispatch attempt for restored queue '{}'", name);
        broker.try_dispatch(&name).await;
    }

    let state = AppState::new(broker);
    let app = handlers::router(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!("Broker starting on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
