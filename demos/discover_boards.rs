//! Basic example: Discover nearby Pillow Case boards
//!
//! Run with: cargo run --example discover_boards

use pillowcase_ble::{BgxTransport, BoardEvent, BoardManager, MemoryStore, Result};
use std::time::Duration;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("pillowcase_ble=debug".parse().unwrap()),
        )
        .init();

    println!("Starting Pillow Case board discovery...");

    let transport = BgxTransport::new().await?;
    let manager = BoardManager::new(transport, MemoryStore::new());
    let mut events = manager.subscribe();

    // No saved board and no auto-connect: every discovery is reported.
    manager.configure(true, false);

    println!("Scanning (scan stops automatically after 10 seconds)...");
    println!("Press Ctrl+C to exit early.\n");

    let listing = async {
        while let Ok(event) = events.recv().await {
            match event {
                BoardEvent::DevicesFound(devices) => {
                    println!("Discovered boards:");
                    for device in devices {
                        println!(
                            "  {} - {} (RSSI: {:?})",
                            device.identifier,
                            device.name.as_deref().unwrap_or("unnamed"),
                            device.rssi
                        );
                    }
                }
                BoardEvent::RadioStateChanged(state) => {
                    println!("Radio state: {state:?}");
                }
                _ => {}
            }
        }
    };

    tokio::select! {
        _ = listing => {}
        _ = tokio::time::sleep(Duration::from_secs(30)) => {}
        _ = tokio::signal::ctrl_c() => {
            println!("\nInterrupted!");
        }
    }

    println!("\n--- Scan Complete ---");
    println!("Total boards found: {}", manager.device_count());

    manager.shutdown().await;
    println!("Done!");

    Ok(())
}
