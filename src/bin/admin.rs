// CLI d'administration du broker : liste et suppression de files via l'API
// de contrôle. Sort avec un code non nul en cas d'erreur de transport ou de
// réponse non 2xx.
use std::process;

use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(name = "admin", about = "Administración del broker de colas")]
struct Cli {
    /// URL base del broker
    #[arg(long, default_value = "http://127.0.0.1:5000")]
    broker_url: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Lista las colas existentes
    List,
    /// Elimina una cola y todo su contenido
    Delete { nombre: String },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    let client = reqwest::Client::new();

    let result = match cli.command {
        Command::List => list(&client, &cli.broker_url).await,
        Command::Delete { nombre } => delete(&client, &cli.broker_url, &nombre).await,
    };

    if let Err(e) = result {
        eprintln!("error: {e}");
        process::exit(1);
    }
}

async fn list(
    client: &reqwest::Client,
    base: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let body: serde_json::Value = client
        .get(format!("{base}/colas"))
        .send()
        .await?
        .error_for_status()?
        .json()
        .await?;

    if let Some(colas) = body.get("colas").and_then(|c| c.as_array()) {
        for cola in colas {
            if let Some(name) = cola.as_str() {
                println!("{name}");
            }
        }
    }
    Ok(())
}

async fn delete(
    client: &reqwest::Client,
    base: &str,
    nombre: &str,
) -> Result<(), Box<dyn std::error::Error>> {
    let response = client.delete(format!("{base}/colas/{nombre}")).send().await?;

    if response.status() == reqwest::StatusCode::NOT_FOUND {
        return Err(format!("la cola '{nombre}' no existe").into());
    }
    response.error_for_status()?;

    println!("cola '{nombre}' eliminada");
    Ok(())
}
