//! btleplug-backed transport for BGX serial-bridge boards.
//!
//! Implements [`Transport`] against the Silicon Labs BGX Xpress Streaming
//! Service. All BLE traffic for a board flows through here; the manager core
//! only ever sees [`TransportEvent`]s.

use btleplug::api::{
    Central, CentralEvent, CentralState, Characteristic, Manager as _, Peripheral as _,
    ScanFilter, WriteType,
};
use btleplug::platform::{Adapter, Manager, Peripheral, PeripheralId};
use bytes::Bytes;
use futures::stream::StreamExt;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use crate::ble::transport::{
    BusMode, DeviceRef, DeviceState, RadioState, Transport, TransportEvent,
};
use crate::ble::uuids::*;
use crate::error::{Error, Result};

/// Wire values of the BGX bus mode characteristic.
fn bus_mode_to_byte(mode: BusMode) -> u8 {
    match mode {
        BusMode::Unknown => 0,
        BusMode::Stream => 1,
        BusMode::LocalCommand => 2,
        BusMode::RemoteCommand => 3,
        BusMode::Unsupported => 4,
    }
}

fn bus_mode_from_byte(byte: u8) -> BusMode {
    match byte {
        1 => BusMode::Stream,
        2 => BusMode::LocalCommand,
        3 => BusMode::RemoteCommand,
        0 => BusMode::Unknown,
        _ => BusMode::Unsupported,
    }
}

/// Serial link state for a connected board.
struct DeviceLink {
    peripheral: Peripheral,
    /// Write target for command strings.
    serial_rx: Characteristic,
    /// Bus mode characteristic (write + notify).
    mode: Characteristic,
    /// Notification pump for this board.
    notify_handle: tokio::task::JoinHandle<()>,
}

/// BGX transport over btleplug.
pub struct BgxTransport {
    /// The BLE adapter to use.
    adapter: Adapter,
    /// Whether scanning is currently active.
    is_scanning: Arc<RwLock<bool>>,
    /// Peripherals seen during scanning, by identifier.
    peripherals: Arc<RwLock<HashMap<String, Peripheral>>>,
    /// Active serial links, by identifier.
    links: Arc<RwLock<HashMap<String, DeviceLink>>>,
    /// Channel for transport events.
    event_tx: broadcast::Sender<TransportEvent>,
    /// Handle to the central event pump.
    pump_handle: RwLock<Option<tokio::task::JoinHandle<()>>>,
}

impl BgxTransport {
    /// Create a transport on the first available Bluetooth adapter.
    ///
    /// # Errors
    ///
    /// Returns an error if Bluetooth is not available.
    pub async fn new() -> Result<Self> {
        let manager = Manager::new()
            .await
            .map_err(|_e| Error::BluetoothUnavailable)?;

        let adapters = manager.adapters().await.map_err(Error::Bluetooth)?;

        let adapter = adapters
            .into_iter()
            .next()
            .ok_or(Error::BluetoothUnavailable)?;

        info!(
            "Using Bluetooth adapter: {:?}",
            adapter.adapter_info().await.ok()
        );

        Ok(Self::with_adapter(adapter))
    }

    /// Create a transport with a specific adapter.
    pub fn with_adapter(adapter: Adapter) -> Self {
        let (event_tx, _) = broadcast::channel(100);

        let transport = Self {
            adapter,
            is_scanning: Arc::new(RwLock::new(false)),
            peripherals: Arc::new(RwLock::new(HashMap::new())),
            links: Arc::new(RwLock::new(HashMap::new())),
            event_tx,
            pump_handle: RwLock::new(None),
        };
        transport.start_event_pump();
        transport
    }

    /// Start the task translating central events into transport events.
    fn start_event_pump(&self) {
        let adapter = self.adapter.clone();
        let is_scanning = self.is_scanning.clone();
        let peripherals = self.peripherals.clone();
        let links = self.links.clone();
        let event_tx = self.event_tx.clone();

        let handle = tokio::spawn(async move {
            let mut events = match adapter.events().await {
                Ok(events) => events,
                Err(e) => {
                    error!("Failed to get adapter events: {}", e);
                    return;
                }
            };

            // btleplug only surfaces state *transitions*; an adapter we could
            // open is reported as powered on so scans can start right away.
            let _ = event_tx.send(TransportEvent::RadioStateChanged(RadioState::PoweredOn));

            while let Some(event) = events.next().await {
                match event {
                    CentralEvent::DeviceDiscovered(id) | CentralEvent::DeviceUpdated(id) => {
                        if *is_scanning.read() {
                            Self::process_peripheral(&adapter, id, &peripherals, &event_tx).await;
                        }
                    }
                    CentralEvent::DeviceConnected(id) => {
                        debug!("Device connected at BLE level: {:?}", id);
                    }
                    CentralEvent::DeviceDisconnected(id) => {
                        let identifier = id.to_string();
                        // Links torn down by an explicit disconnect have
                        // already reported Disconnected.
                        let link = links.write().remove(&identifier);
                        if let Some(link) = link {
                            info!("Board {} connection lost", identifier);
                            link.notify_handle.abort();
                            let _ = event_tx.send(TransportEvent::DeviceStateChanged {
                                identifier,
                                state: DeviceState::Disconnected,
                            });
                        }
                    }
                    CentralEvent::StateUpdate(state) => {
                        let state = match state {
                            CentralState::PoweredOn => RadioState::PoweredOn,
                            CentralState::PoweredOff => RadioState::PoweredOff,
                            CentralState::Unknown => RadioState::Unknown,
                        };
                        debug!("Radio state update: {:?}", state);
                        let _ = event_tx.send(TransportEvent::RadioStateChanged(state));
                    }
                    CentralEvent::ManufacturerDataAdvertisement { .. } => {}
                    CentralEvent::ServiceDataAdvertisement { .. } => {}
                    CentralEvent::ServicesAdvertisement { .. } => {}
                }
            }

            debug!("Central event pump ended");
        });

        *self.pump_handle.write() = Some(handle);
    }

    /// Process a discovered or updated peripheral.
    async fn process_peripheral(
        adapter: &Adapter,
        id: PeripheralId,
        peripherals: &Arc<RwLock<HashMap<String, Peripheral>>>,
        event_tx: &broadcast::Sender<TransportEvent>,
    ) {
        let peripheral = match adapter.peripheral(&id).await {
            Ok(p) => p,
            Err(e) => {
                trace!("Failed to get peripheral: {}", e);
                return;
            }
        };

        let properties = match peripheral.properties().await {
            Ok(Some(p)) => p,
            _ => return,
        };

        // Only boards exposing the Xpress service are of interest.
        let is_board = properties.services.iter().any(is_xpress_service)
            || properties
                .local_name
                .as_ref()
                .map(|n| n.starts_with("PillCase") || n.contains("BGX"))
                .unwrap_or(false);

        if !is_board {
            return;
        }

        let identifier = id.to_string();
        trace!("Board advertisement: {}", identifier);

        peripherals
            .write()
            .insert(identifier.clone(), peripheral);

        let _ = event_tx.send(TransportEvent::DeviceDiscovered(DeviceRef {
            identifier,
            name: properties.local_name,
            rssi: properties.rssi,
            firmware_revision: None,
        }));
    }

    /// Establish the serial link: service discovery, subscriptions, firmware
    /// revision, notification pump.
    async fn interrogate(
        peripheral: Peripheral,
        identifier: String,
        links: Arc<RwLock<HashMap<String, DeviceLink>>>,
        event_tx: broadcast::Sender<TransportEvent>,
    ) -> Result<()> {
        peripheral
            .discover_services()
            .await
            .map_err(Error::Bluetooth)?;

        let mut characteristics: HashMap<Uuid, Characteristic> = HashMap::new();
        for service in peripheral.services() {
            for characteristic in service.characteristics {
                trace!(
                    "Found characteristic {} in service {}",
                    characteristic.uuid,
                    service.uuid
                );
                characteristics.insert(characteristic.uuid, characteristic);
            }
        }

        let find = |uuid: Uuid| -> Result<Characteristic> {
            characteristics
                .get(&uuid)
                .cloned()
                .ok_or_else(|| Error::CharacteristicNotFound {
                    uuid: uuid.to_string(),
                })
        };

        let serial_rx = find(XPRESS_RX_UUID)?;
        let serial_tx = find(XPRESS_TX_UUID)?;
        let mode = find(XPRESS_MODE_UUID)?;

        peripheral
            .subscribe(&serial_tx)
            .await
            .map_err(Error::Bluetooth)?;
        peripheral.subscribe(&mode).await.map_err(Error::Bluetooth)?;

        // Firmware revision is optional; older boards never expose it.
        let firmware_revision = match characteristics.get(&FIRMWARE_REVISION_UUID) {
            Some(characteristic) => peripheral
                .read(characteristic)
                .await
                .ok()
                .and_then(|data| String::from_utf8(data).ok()),
            None => None,
        };

        if let Some(ref revision) = firmware_revision {
            debug!("Board {} firmware revision: {}", identifier, revision);
        }

        // Let the discovered set learn what interrogation found.
        let name = peripheral
            .properties()
            .await
            .ok()
            .flatten()
            .and_then(|p| p.local_name);
        let _ = event_tx.send(TransportEvent::DeviceDiscovered(DeviceRef {
            identifier: identifier.clone(),
            name,
            rssi: None,
            firmware_revision,
        }));

        let notify_handle = Self::start_notification_pump(
            peripheral.clone(),
            identifier.clone(),
            event_tx.clone(),
        )
        .await?;

        links.write().insert(
            identifier,
            DeviceLink {
                peripheral,
                serial_rx,
                mode,
                notify_handle,
            },
        );

        Ok(())
    }

    /// Pump serial and mode notifications into transport events.
    async fn start_notification_pump(
        peripheral: Peripheral,
        identifier: String,
        event_tx: broadcast::Sender<TransportEvent>,
    ) -> Result<tokio::task::JoinHandle<()>> {
        let mut notifications = peripheral.notifications().await.map_err(Error::Bluetooth)?;

        Ok(tokio::spawn(async move {
            while let Some(notification) = notifications.next().await {
                if notification.uuid == XPRESS_TX_UUID {
                    trace!(
                        "Serial data from {}: {} bytes",
                        identifier,
                        notification.value.len()
                    );
                    let _ = event_tx.send(TransportEvent::DataReceived {
                        identifier: identifier.clone(),
                        data: Bytes::from(notification.value),
                    });
                } else if notification.uuid == XPRESS_MODE_UUID {
                    let mode = notification
                        .value
                        .first()
                        .copied()
                        .map(bus_mode_from_byte)
                        .unwrap_or(BusMode::Unknown);
                    let _ = event_tx.send(TransportEvent::BusModeChanged {
                        identifier: identifier.clone(),
                        mode,
                    });
                }
            }
            debug!("Notification pump for {} ended", identifier);
        }))
    }

    fn link_characteristic(
        &self,
        identifier: &str,
        select: impl Fn(&DeviceLink) -> Characteristic,
    ) -> Result<(Peripheral, Characteristic)> {
        let links = self.links.read();
        let link = links.get(identifier).ok_or_else(|| Error::NotConnected {
            identifier: identifier.to_string(),
        })?;
        Ok((link.peripheral.clone(), select(link)))
    }
}

#[async_trait::async_trait]
impl Transport for BgxTransport {
    async fn start_scan(&self) -> Result<()> {
        if *self.is_scanning.read() {
            debug!("Already scanning, ignoring start request");
            return Ok(());
        }

        info!("Starting BLE scan for boards");

        self.adapter
            .start_scan(ScanFilter {
                services: vec![XPRESS_SERVICE_UUID],
            })
            .await
            .map_err(Error::Bluetooth)?;

        *self.is_scanning.write() = true;
        Ok(())
    }

    async fn stop_scan(&self) -> Result<()> {
        if !*self.is_scanning.read() {
            debug!("Not scanning, ignoring stop request");
            return Ok(());
        }

        info!("Stopping BLE scan");

        *self.is_scanning.write() = false;
        self.adapter.stop_scan().await.map_err(Error::Bluetooth)
    }

    async fn connect_device(&self, identifier: &str) -> Result<()> {
        let peripheral = self
            .peripherals
            .read()
            .get(identifier)
            .cloned()
            .ok_or_else(|| Error::DeviceNotFound {
                identifier: identifier.to_string(),
            })?;

        let identifier = identifier.to_string();
        let links = self.links.clone();
        let event_tx = self.event_tx.clone();

        // Connection runs in the background; progress is reported as state
        // change events.
        tokio::spawn(async move {
            let _ = event_tx.send(TransportEvent::DeviceStateChanged {
                identifier: identifier.clone(),
                state: DeviceState::Connecting,
            });

            if let Err(e) = peripheral.connect().await {
                error!("Failed to connect to board {}: {}", identifier, e);
                let _ = event_tx.send(TransportEvent::DeviceStateChanged {
                    identifier,
                    state: DeviceState::Disconnected,
                });
                return;
            }

            let _ = event_tx.send(TransportEvent::DeviceStateChanged {
                identifier: identifier.clone(),
                state: DeviceState::Interrogating,
            });

            match Self::interrogate(peripheral.clone(), identifier.clone(), links, event_tx.clone())
                .await
            {
                Ok(()) => {
                    info!("Board {} connected", identifier);
                    let _ = event_tx.send(TransportEvent::DeviceStateChanged {
                        identifier,
                        state: DeviceState::Connected,
                    });
                }
                Err(e) => {
                    error!("Interrogation of board {} failed: {}", identifier, e);
                    let _ = peripheral.disconnect().await;
                    let _ = event_tx.send(TransportEvent::DeviceStateChanged {
                        identifier,
                        state: DeviceState::Disconnected,
                    });
                }
            }
        });

        Ok(())
    }

    async fn disconnect_device(&self, identifier: &str) -> Result<()> {
        let link = self.links.write().remove(identifier);

        let peripheral = match link {
            Some(link) => {
                link.notify_handle.abort();
                link.peripheral
            }
            None => self
                .peripherals
                .read()
                .get(identifier)
                .cloned()
                .ok_or_else(|| Error::DeviceNotFound {
                    identifier: identifier.to_string(),
                })?,
        };

        let identifier = identifier.to_string();
        let event_tx = self.event_tx.clone();

        tokio::spawn(async move {
            let _ = event_tx.send(TransportEvent::DeviceStateChanged {
                identifier: identifier.clone(),
                state: DeviceState::Disconnecting,
            });

            if let Err(e) = peripheral.disconnect().await {
                warn!("Failed to disconnect from board {}: {}", identifier, e);
            }

            let _ = event_tx.send(TransportEvent::DeviceStateChanged {
                identifier,
                state: DeviceState::Disconnected,
            });
        });

        Ok(())
    }

    async fn set_bus_mode(&self, identifier: &str, mode: BusMode) -> Result<()> {
        let (peripheral, characteristic) =
            self.link_characteristic(identifier, |link| link.mode.clone())?;

        debug!("Setting bus mode of {} to {:?}", identifier, mode);

        peripheral
            .write(
                &characteristic,
                &[bus_mode_to_byte(mode)],
                WriteType::WithResponse,
            )
            .await
            .map_err(Error::Bluetooth)
    }

    async fn send_command(&self, identifier: &str, command: &str) -> Result<()> {
        let (peripheral, characteristic) =
            self.link_characteristic(identifier, |link| link.serial_rx.clone())?;

        trace!("Sending command to {}: {}", identifier, command);

        peripheral
            .write(
                &characteristic,
                format!("{command}\r\n").as_bytes(),
                WriteType::WithResponse,
            )
            .await
            .map_err(Error::Bluetooth)?;

        // The link carries one write at a time; a completed write with
        // response is the acknowledgement.
        let _ = self.event_tx.send(TransportEvent::WriteComplete {
            identifier: identifier.to_string(),
        });
        Ok(())
    }

    fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        self.event_tx.subscribe()
    }
}

impl Drop for BgxTransport {
    fn drop(&mut self) {
        if let Some(handle) = self.pump_handle.write().take() {
            handle.abort();
        }
        for (_, link) in self.links.write().drain() {
            link.notify_handle.abort();
        }
    }
}
