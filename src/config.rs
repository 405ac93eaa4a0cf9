// Constantes du broker et surcharges par variables d'environnement.
use std::env;
use std::path::PathBuf;
use std::time::Duration;

// Délai avant qu'une livraison sans ACK soit remise en file.
pub const ACK_TIMEOUT_SEC: u64 = 30;
// Nombre maximum de messages en vol vers un même consommateur.
pub const PREFETCH_COUNT: usize = 1;
// Période du cycle de nettoyage (expiration + timeouts d'ACK).
pub const REAPER_PERIOD_SEC: u64 = 10;
// Rétention des messages dans une file sans consommateurs.
pub const IDLE_EXPIRY_SEC: u64 = 300;

pub const DEFAULT_PORT: u16 = 5000;
pub const DEFAULT_SNAPSHOT_FILE: &str = "broker.json";

#[derive(Debug, Clone)]
pub struct BrokerConfig {
    pub port: u16,
    pub snapshot_file: PathBuf,
    pub ack_timeout: Duration,
    pub prefetch_count: usize,
    pub reaper_period: Duration,
    pub idle_expiry: Duration,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            snapshot_file: PathBuf::from(DEFAULT_SNAPSHOT_FILE),
            ack_timeout: Duration::from_secs(ACK_TIMEOUT_SEC),
            prefetch_count: PREFETCH_COUNT,
            reaper_period: Duration::from_secs(REAPER_PERIOD_SEC),
            idle_expiry: Duration::from_secs(IDLE_EXPIRY_SEC),
        }
    }
}

impl BrokerConfig {
    // Les valeurs par défaut, surchargées par les variables BROKER_*.
    // Une valeur illisible est ignorée : on garde le défaut.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(port) = parse_var("BROKER_PORT") {
            config.port = port;
        }
        if let Ok(path) = env::var("BROKER_SNAPSHOT_FILE") {
            config.snapshot_file = PathBuf::from(path);
        }
        if let Some(secs) = parse_var("BROKER_ACK_TIMEOUT_SEC") {
            config.ack_timeout = Duration::from_secs(secs);
        }
        if let Some(count) = parse_var("BROKER_PREFETCH_COUNT") {
            config.prefetch_count = count;
        }
        if let Some(secs) = parse_var("BROKER_REAPER_PERIOD_SEC") {
            config.reaper_period = Duration::from_secs(secs);
        }
        if let Some(secs) = parse_var("BROKER_IDLE_EXPIRY_SEC") {
            config.idle_expiry = Duration::from_secs(secs);
        }

        config
    }
}

fn parse_var<T: std::str::FromStr>(name: &str) -> Option<T> {
    env::var(name).ok().and_then(|value| value.parse().ok())
}
