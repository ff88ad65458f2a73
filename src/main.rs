use std::io::Write;
use std::sync::Arc;

use chat_relay::backend::{ChatBackend, HttpBackend};
use chat_relay::config::RelayConfig;
use chat_relay::events::DeliveryEvent;
use chat_relay::session::SessionCoordinator;
use tokio::sync::broadcast::error::RecvError;

const USAGE: &str = "usage: chat-relay <conversation-id> [message...]";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let config = RelayConfig::from_env().unwrap_or_else(|e| {
        eprintln!("Error: {}", e);
        eprintln!("  export CHAT_RELAY_URL=http://localhost:8069");
        std::process::exit(1);
    });

    let mut args = std::env::args().skip(1);
    let conversation: i64 = match args.next().map(|s| s.parse()) {
        Some(Ok(id)) => id,
        _ => {
            eprintln!("{USAGE}");
            std::process::exit(2);
        }
    };
    let text = args.collect::<Vec<_>>().join(" ");

    eprintln!("💬 Chat Relay v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Backend: {}", config.base_url);
    eprintln!("   Delivery: {:?}", config.delivery);
    eprintln!("   Conversation: {}\n", conversation);

    let backend: Arc<dyn ChatBackend> = Arc::new(HttpBackend::from_config(&config));
    let mut coordinator = SessionCoordinator::new(backend, &config);
    let mut events = coordinator.subscribe();

    coordinator.open(conversation).await?;
    for message in coordinator.messages() {
        println!("[{}] {}", message.kind, message.body);
    }

    let Some(id) = coordinator.active() else {
        return Ok(());
    };
    if text.trim().is_empty() && !coordinator.is_processing(id) {
        return Ok(());
    }
    if !text.trim().is_empty() {
        coordinator.send_message(&text).await?;
    }

    // ── Wait for the reply ───────────────────────────────────────────────
    let mut streamed = false;
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(DeliveryEvent::Chunk { text, .. }) => {
                    streamed = true;
                    print!("{text}");
                    std::io::stdout().flush()?;
                }
                Ok(DeliveryEvent::Warning { message, .. }) => {
                    eprintln!("⚠️  {message}");
                }
                Ok(DeliveryEvent::Notice { message, .. }) => {
                    eprintln!("\n❌ {message}");
                }
                Ok(DeliveryEvent::Processing { processing: false, .. }) => {
                    // Polled replies arrive whole, with no chunks.
                    let last = coordinator.messages().pop();
                    match last {
                        Some(reply) if !streamed && reply.is_assistant() => {
                            println!("[{}] {}", reply.kind, reply.body);
                        }
                        _ => println!(),
                    }
                    break;
                }
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => {
                    tracing::warn!(skipped, "Event receiver lagged");
                }
                Err(RecvError::Closed) => break,
            },
            _ = tokio::signal::ctrl_c() => {
                eprintln!("\nInterrupted.");
                coordinator.cancel();
                break;
            }
        }
    }

    coordinator.close();
    Ok(())
}
