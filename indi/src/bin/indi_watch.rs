//! indi-watch: connect to an INDI server and log everything it does

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use astrocontrol_indi::{
    BlobMode, BlobValue, IndiClient, IndiClientConfig, IndiEvent, IndiServer, Property,
    TracingSink, INDI_DEFAULT_PORT,
};
use clap::Parser;
use tokio::sync::broadcast::error::RecvError;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Watch an INDI server's property stream
#[derive(Parser, Debug)]
#[command(name = "indi-watch")]
#[command(about = "Connect to an INDI server and log devices, properties and messages")]
struct Args {
    /// Server host
    #[arg(long, env = "INDI_HOST", default_value = "localhost")]
    host: String,

    /// Server port
    #[arg(short, long, env = "INDI_PORT", default_value_t = INDI_DEFAULT_PORT)]
    port: u16,

    /// Switch every device to connected as it is defined
    #[arg(long)]
    auto_connect: bool,

    /// Enable BLOBs and save every received one into this directory
    #[arg(long)]
    blob_dir: Option<PathBuf>,

    /// Log every raw inbound chunk at trace level
    #[arg(long)]
    raw: bool,

    /// Keep retrying with backoff when the connection drops
    #[arg(long)]
    reconnect: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    let args = Args::parse();
    if let Some(dir) = &args.blob_dir {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("creating BLOB directory {}", dir.display()))?;
    }

    let config = IndiClientConfig {
        auto_connect_devices: args.auto_connect,
        ..Default::default()
    };
    let client = IndiClient::with_config(IndiServer::new(args.host.clone(), args.port), config);
    if args.raw {
        client.set_raw_input_sink(Some(std::sync::Arc::new(TracingSink)));
    }

    let (_, mut events) = client.subscribe_channel();
    let watcher = {
        let client = client.clone();
        let blob_dir = args.blob_dir.clone();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => handle_event(&client, &event, blob_dir.as_deref()).await,
                    Err(RecvError::Lagged(missed)) => warn!("Event log fell behind, {} events dropped", missed),
                    Err(RecvError::Closed) => break,
                }
            }
        })
    };

    client
        .try_connect()
        .await
        .with_context(|| format!("connecting to {}", client.server()))?;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = tokio::time::sleep(Duration::from_secs(1)) => {}
        }
        if !client.is_connected() {
            if !args.reconnect {
                warn!("Connection to {} lost", client.server());
                break;
            }
            if let Err(e) = client.reconnect_with_backoff().await {
                error!("{}", e);
                break;
            }
        }
    }

    client.disconnect().await;
    let stats = client.message_stats();
    info!(
        "Processed {} messages ({} skipped, {} failed)",
        stats.applied, stats.skipped, stats.failed
    );
    watcher.abort();
    Ok(())
}

async fn handle_event(client: &IndiClient, event: &IndiEvent, blob_dir: Option<&Path>) {
    match event {
        IndiEvent::ServerConnected => info!("Connected to {}", client.server()),
        IndiEvent::ServerDisconnected => info!("Disconnected from {}", client.server()),
        IndiEvent::DeviceFound(device) => {
            info!("Device found: {}", device);
            if blob_dir.is_some() {
                if let Err(e) = client.enable_blob(device, None, BlobMode::Also).await {
                    warn!("Could not enable BLOBs for {}: {}", device, e);
                }
            }
        }
        IndiEvent::DeviceRemoved(device) => info!("Device removed: {}", device),
        IndiEvent::PropertyDefined { device, name, value } => {
            info!("{}.{} defined: {}", device, name, summarize(value));
            save_blobs(device, value, blob_dir);
        }
        IndiEvent::PropertyChanged { device, name, next, .. } => {
            info!("{}.{} = {}", device, name, summarize(next));
            save_blobs(device, next, blob_dir);
        }
        IndiEvent::PropertyDeleted { device, name, .. } => info!("{}.{} deleted", device, name),
        IndiEvent::Notification { device, message } => match device {
            Some(device) => info!("[{}] {}", device, message),
            None => info!("{}", message),
        },
        IndiEvent::MessageSent(_) | IndiEvent::MessageReceived(_) => {}
    }
}

fn summarize(property: &Property) -> String {
    let values = property
        .values()
        .iter()
        .map(|v| v.to_string())
        .collect::<Vec<_>>()
        .join(", ");
    match property.state() {
        Some(state) => format!("[{}] {}", state, values),
        None => values,
    }
}

fn save_blobs(device: &str, property: &Property, blob_dir: Option<&Path>) {
    let (Some(dir), Some(blobs)) = (blob_dir, property.as_vector::<BlobValue>()) else {
        return;
    };
    for blob in blobs.iter().filter(|b| !b.is_empty()) {
        let extension = blob
            .detected_format()
            .unwrap_or_else(|_| blob.file_extension());
        let file = dir.join(format!(
            "{}_{}_{}_{}{}",
            sanitize(device),
            sanitize(property.name()),
            sanitize(&blob.name),
            chrono::Utc::now().format("%Y%m%dT%H%M%S%.3f"),
            extension
        ));
        match blob.write_to_file(&file) {
            Ok(()) => info!("Saved {}", file.display()),
            Err(e) => warn!("Could not save BLOB {}: {}", blob.name, e),
        }
    }
}

fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
        .collect()
}
