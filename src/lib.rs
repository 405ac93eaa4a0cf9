// Broker de messages en mémoire avec durabilité optionnelle : files nommées,
// livraison push vers des callbacks HTTP avec round-robin et prefetch, ACK
// explicite, remise en file sur timeout, et snapshot JSON atomique.
pub mod app_state;
pub mod broker;
pub mod config;
pub mod error;
pub mod handlers;
pub mod models;
pub mod persistence;
pub mod sender;
