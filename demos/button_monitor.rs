//! Connect to a board and print every button press.
//!
//! Connects to the first board found, remembers it, and reconnects to it on
//! subsequent runs. If the board's configuration is out of date, the update
//! run is driven automatically before buttons start flowing.
//!
//! Run with: cargo run --example button_monitor

use pillowcase_ble::{BgxTransport, BoardEvent, BoardManager, FileStore, Result};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("pillowcase_ble=info".parse().unwrap()),
        )
        .init();

    let store = FileStore::new(std::env::temp_dir().join("pillowcase-board-id.txt"));
    let transport = BgxTransport::new().await?;
    let manager = BoardManager::new(transport, store);
    let mut events = manager.subscribe();

    // Connect to whichever board shows up first.
    manager.configure(false, true);

    println!("Waiting for a board... Press Ctrl+C to exit.\n");

    let monitor = async {
        while let Ok(event) = events.recv().await {
            match event {
                BoardEvent::ConnectionStateChanged(state) => {
                    println!("Connection: {state}");
                }
                BoardEvent::UpdateRunningChanged(true) => {
                    println!("Updating board configuration...");
                }
                BoardEvent::UpdateRunningChanged(false) => {
                    println!("Board ready.");
                }
                BoardEvent::UpdateStalled { step } => {
                    eprintln!("Update stalled at step {step}; reconnect the board to retry.");
                }
                BoardEvent::ButtonPressed(number) => {
                    println!("Button {number} pressed!");
                }
                _ => {}
            }
        }
    };

    tokio::select! {
        _ = monitor => {}
        _ = tokio::signal::ctrl_c() => {
            println!("\nInterrupted!");
        }
    }

    manager.shutdown().await;
    Ok(())
}
