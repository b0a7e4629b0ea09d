use std::time::Duration;

use serde_json::{Map, Value};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::info;
use tracing_subscriber::EnvFilter;

use keywire_transport::{SecureChannel, SessionOptions};

const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: u16 = 8001;
const RESULT_TIMEOUT: Duration = Duration::from_secs(10);

// Event names shared with the reference server.
const SIGN_UP: &str = "rsa:signUp";
const SIGN_UP_RESULT: &str = "rsa:signUpResult";

#[derive(Debug)]
struct Config {
    host: String,
    port: u16,
    email: String,
    password: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args: Vec<String> = std::env::args().collect();

    let mut host = DEFAULT_HOST.to_string();
    let mut port = DEFAULT_PORT;
    let mut email = String::new();
    let mut password = String::new();

    // Minimal arg parsing
    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--host" if i + 1 < args.len() => {
                host = args[i + 1].clone();
                i += 1;
            }
            "--port" if i + 1 < args.len() => {
                port = args[i + 1].parse()?;
                i += 1;
            }
            "--email" if i + 1 < args.len() => {
                email = args[i + 1].clone();
                i += 1;
            }
            "--password" if i + 1 < args.len() => {
                password = args[i + 1].clone();
                i += 1;
            }
            _ => {}
        }
        i += 1;
    }

    if email.is_empty() || password.is_empty() {
        eprintln!(
            "usage: keywire-cli --email <email> --password <password> [--host <host>] [--port <port>]"
        );
        return Ok(());
    }

    let config = Config {
        host,
        port,
        email,
        password,
    };
    run(config).await
}

async fn run(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    let options = SessionOptions::secure(config.host.clone(), config.port);
    info!(url = %options.endpoint_url(), "connecting");

    let mut channel = SecureChannel::establish(options, || {
        info!("secure channel ready");
    })
    .await?;

    let (result_tx, mut result_rx) = mpsc::unbounded_channel::<Value>();
    channel.on(SIGN_UP_RESULT, move |payload, _, _| {
        let _ = result_tx.send(payload.clone());
    });

    let mut fields = Map::new();
    fields.insert("email".to_string(), Value::String(config.email.clone()));
    fields.insert(
        "password".to_string(),
        Value::String(config.password.clone()),
    );
    let req_id = channel.send_secure(SIGN_UP, fields).await?;
    info!(%req_id, "sign-up sent");

    let sealed = match timeout(RESULT_TIMEOUT, result_rx.recv()).await {
        Ok(Some(payload)) => payload,
        Ok(None) | Err(_) => {
            eprintln!("no sign-up result from the server");
            channel.close(true, Some(1000), "giving up")?;
            return Ok(());
        }
    };

    let sealed = sealed
        .as_object()
        .cloned()
        .ok_or("sign-up result is not an object")?;
    let opened = channel.open_envelope(sealed).await?;
    match opened.get("status").and_then(Value::as_str) {
        Some("OK") => println!("Account created for {}", config.email),
        Some("TAKEN") => println!("Email {} is already registered", config.email),
        other => println!("Unexpected status: {:?}", other),
    }

    channel.close(true, Some(1000), "done")?;
    Ok(())
}
