use std::error::Error;
use std::time::Duration;

use tracing::info;
use hypo_transport::{ClientTransport, Message, Transport, TransportConfiguration};

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    // Initialize tracing
    tracing_subscriber::fmt::init();

    info!("Starting LAN client example...");

    let config = TransportConfiguration::for_lan_peer("127.0.0.1:7010", "demo-client");
    let client = ClientTransport::lan(config);
    client.connect().await?;

    // A small update goes out as one frame
    info!("Sending clipboard text...");
    client
        .send(&Message::clipboard(serde_json::json!({ "text": "Hello from the demo client!" })))
        .await?;

    // A large one is split into chunks
    info!("Sending a large clipboard payload...");
    let large = "x".repeat(200_000);
    client
        .send(&Message::clipboard(serde_json::json!({ "text": large })))
        .await?;

    tokio::time::sleep(Duration::from_millis(200)).await;

    info!("Closing connection...");
    client.disconnect().await?;

    info!("Client example completed successfully!");
    Ok(())
}
