//! Connect to an OBU with the default configuration and print whatever it
//! sends until ctrl-c.

use obulink::{BluestTransport, LinkConfig, ObuLink};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("obulink=info")),
        )
        .init();

    let transport = BluestTransport::new().await?;
    let link = ObuLink::new(LinkConfig::default(), transport);

    let mut status = link.status();
    let mut positions = link.obu_position();
    let mut messages = link.its_messages();

    link.connect();

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                link.disconnect();
                break;
            }
            event = status.recv() => if let Ok(event) = event {
                match &event.error {
                    Some(error) => println!("[{:?}] {error}", event.state),
                    None => println!("[{:?}]", event.state),
                }
            },
            message = positions.recv() => if let Ok(message) = message {
                println!("OBU position: {}", hex::encode(&message.payload));
            },
            message = messages.recv() => if let Ok(message) = message {
                println!("ITS message: {}", hex::encode(&message.payload));
            },
        }
    }

    Ok(())
}
