// L'état partagé injecté dans les handlers Axum.
use std::sync::Arc;

use crate::broker::Broker;

#[derive(Clone)]
pub struct AppState {
    pub broker: Arc<Broker>,
}

impl AppState {
    pub fn new(broker: Arc<Broker>) -> Self {
        Self { broker }
    }
}
