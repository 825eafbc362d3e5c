use std::error::Error;
use std::sync::Arc;

use tracing::info;
use hypo_transport::status::{run_status_server, StatusState};
use hypo_transport::{
    LanServer, Message, MessageType, Origin, ProtocolLimits, Transport, TransportConfiguration,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    // Initialize tracing
    tracing_subscriber::fmt::init();

    info!("Starting LAN server example...");

    let server = Arc::new(LanServer::new(
        TransportConfiguration::new("127.0.0.1:7010"),
        ProtocolLimits::default(),
    ));
    server.on_message(Arc::new(handle_message));
    server.connect().await?;

    // Health and peer list on a side port
    let status = StatusState {
        server: server.clone(),
        resolve_name: None,
    };
    let status_addr = "127.0.0.1:7011".parse()?;
    tokio::spawn(async move {
        if let Err(e) = run_status_server(status, status_addr).await {
            tracing::error!("Status endpoint failed: {}", e);
        }
    });

    info!("Press Ctrl-C to stop");
    tokio::signal::ctrl_c().await?;

    server.disconnect().await?;
    info!("Server stopped");
    Ok(())
}

/// Handle incoming messages from peers
fn handle_message(message: &Message, origin: Origin) {
    match message.msg_type {
        MessageType::Clipboard => {
            let text = message.payload.get("text").and_then(|t| t.as_str()).unwrap_or("");
            info!("{}: clipboard update ({} chars)", origin, text.chars().count());
        }
        MessageType::Control => {
            info!("{}: control message {}", origin, message.payload);
        }
    }
}
