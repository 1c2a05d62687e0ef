//! Board manager: connection lifecycle and event routing.
//!
//! [`BoardManager`] is the public handle. It owns nothing but a channel to the
//! core task, which holds every piece of mutable state: the discovered set,
//! the selected board, the connection state, the scan flags, and the update
//! sequencer. Intents return immediately; outcomes arrive as [`BoardEvent`]s.

use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio::time::{self, Duration, Instant};
use tracing::{debug, info, warn};

use crate::ble::transport::{
    DeviceRef, DeviceState, RadioState, Transport, TransportEvent,
};
use crate::error::{Error, Result};
use crate::sequencer::UpdateSequencer;
use crate::storage::IdentifierStore;

/// How long a non-indefinite scan runs before it is stopped automatically.
pub const SCAN_WINDOW: Duration = Duration::from_secs(10);

/// Notification delivered to the host.
#[derive(Debug, Clone, PartialEq)]
pub enum BoardEvent {
    /// A button on the board was pressed.
    ButtonPressed(u8),
    /// The discovered set changed and no saved board is being waited for;
    /// the host picks one and calls [`BoardManager::connect`].
    DevicesFound(Vec<DeviceRef>),
    /// The managed board's connection state changed.
    ConnectionStateChanged(DeviceState),
    /// The host radio changed state.
    RadioStateChanged(RadioState),
    /// A configuration update run started (`true`) or finished (`false`).
    UpdateRunningChanged(bool),
    /// An update run was abandoned because an acknowledgement never arrived.
    UpdateStalled {
        /// Script position at which the run stalled.
        step: usize,
    },
}

/// Callback handle for unregistering callbacks.
pub struct CallbackHandle {
    id: u64,
    unregister_fn: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl CallbackHandle {
    /// Create a new callback handle.
    pub(crate) fn new(id: u64, unregister_fn: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            id,
            unregister_fn: Some(Box::new(unregister_fn)),
        }
    }

    /// Unregister this callback.
    pub fn unregister(mut self) {
        if let Some(f) = self.unregister_fn.take() {
            f();
        }
    }

    /// Get the callback ID.
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl Drop for CallbackHandle {
    fn drop(&mut self) {
        if let Some(f) = self.unregister_fn.take() {
            f();
        }
    }
}

/// Request sent from the handle to the core task.
#[derive(Debug)]
enum Intent {
    Configure {
        force_reset: bool,
        auto_connect_any: bool,
    },
    Connect {
        identifier: String,
    },
    ConnectDevice {
        device: DeviceRef,
    },
    Disconnect {
        reset: bool,
    },
    Scan {
        indefinite: bool,
    },
    Shutdown,
}

/// State snapshot shared with the handle.
///
/// The core task is the only writer; the handle and its getters only read.
#[derive(Debug, Default)]
struct SharedState {
    connection_state: DeviceState,
    discovered: HashMap<String, DeviceRef>,
    selected: Option<DeviceRef>,
    saved_identifier: Option<String>,
    radio_ready: bool,
    is_scanning: bool,
    is_updating: bool,
}

/// Central manager for a single Pillow Case board.
///
/// Construct one per host application and keep it alive for the session; the
/// core task shuts down when the manager is dropped or [`shutdown`] is called.
///
/// ```rust,no_run
/// use pillowcase_ble::{BgxTransport, BoardEvent, BoardManager, FileStore, Result};
///
/// #[tokio::main]
/// async fn main() -> Result<()> {
///     let transport = BgxTransport::new().await?;
///     let store = FileStore::new("pillowcase-board-id.txt");
///     let manager = BoardManager::new(transport, store);
///
///     let mut events = manager.subscribe();
///     manager.configure(false, false);
///
///     while let Ok(event) = events.recv().await {
///         if let BoardEvent::ButtonPressed(number) = event {
///             println!("Button {number} pressed");
///         }
///     }
///     Ok(())
/// }
/// ```
///
/// [`shutdown`]: Self::shutdown
pub struct BoardManager {
    /// Channel into the core task.
    intents: mpsc::UnboundedSender<Intent>,
    /// Host notification channel.
    events: broadcast::Sender<BoardEvent>,
    /// State snapshot maintained by the core task.
    shared: Arc<RwLock<SharedState>>,
    /// Callback ID counter.
    callback_counter: AtomicU64,
    /// Core task handle.
    core_handle: RwLock<Option<tokio::task::JoinHandle<()>>>,
}

impl BoardManager {
    /// Create a manager driving the given transport, with saved-identifier
    /// persistence behind `store`.
    ///
    /// Spawns the core task, so this must be called from within a Tokio
    /// runtime. Nothing happens until [`configure`] is called.
    ///
    /// [`configure`]: Self::configure
    pub fn new<T, S>(transport: T, store: S) -> Self
    where
        T: Transport,
        S: IdentifierStore,
    {
        let shared = Arc::new(RwLock::new(SharedState::default()));
        let (events, _) = broadcast::channel(64);
        let (intent_tx, intent_rx) = mpsc::unbounded_channel();

        // Subscribe before spawning so no transport event can slip past the
        // core task while it is being scheduled.
        let transport_rx = transport.subscribe();

        let core = Core {
            transport: Arc::new(transport),
            store,
            shared: shared.clone(),
            events: events.clone(),
            scan_indefinitely: false,
            connect_to_any: false,
            scan_stop_at: None,
            sequencer: UpdateSequencer::new(),
        };

        let handle = tokio::spawn(core.run(intent_rx, transport_rx));

        Self {
            intents: intent_tx,
            events,
            shared,
            callback_counter: AtomicU64::new(0),
            core_handle: RwLock::new(Some(handle)),
        }
    }

    /// Start the manager with config options and begin scanning for boards.
    ///
    /// # Arguments
    ///
    /// * `force_reset` - Forget the saved board and any previously discovered
    ///   devices before starting.
    /// * `auto_connect_any` - Connect to the first board discovered, whichever
    ///   it is. Primarily used for development and testing.
    pub fn configure(&self, force_reset: bool, auto_connect_any: bool) {
        self.send(Intent::Configure {
            force_reset,
            auto_connect_any,
        });
    }

    /// Connect to the discovered board with the given identifier.
    ///
    /// # Errors
    ///
    /// Returns [`Error::DeviceNotFound`] if no board with that identifier is
    /// in the discovered set. The connection itself completes asynchronously;
    /// watch for [`BoardEvent::ConnectionStateChanged`].
    pub fn connect(&self, identifier: &str) -> Result<()> {
        if !self.shared.read().discovered.contains_key(identifier) {
            return Err(Error::DeviceNotFound {
                identifier: identifier.to_string(),
            });
        }

        self.try_send(Intent::Connect {
            identifier: identifier.to_string(),
        })
    }

    /// Connect to a board previously reported via [`BoardEvent::DevicesFound`].
    pub fn connect_device(&self, device: DeviceRef) {
        self.send(Intent::ConnectDevice { device });
    }

    /// Disconnect from the current board.
    ///
    /// # Arguments
    ///
    /// * `reset` - Also forget the saved board identifier and the discovered
    ///   set, preventing automatic reconnection.
    pub fn disconnect(&self, reset: bool) {
        self.send(Intent::Disconnect { reset });
    }

    /// Scan for boards.
    ///
    /// Ignored while the radio is not powered on or a scan is already
    /// running. Unless `indefinite` (or a saved board is being waited for),
    /// the scan stops automatically after [`SCAN_WINDOW`].
    pub fn scan(&self, indefinite: bool) {
        self.send(Intent::Scan { indefinite });
    }

    /// Shut down the core task, stopping any scan and disconnecting.
    pub async fn shutdown(&self) {
        info!("Shutting down board manager");
        self.send(Intent::Shutdown);
        let handle = self.core_handle.write().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    // === State snapshot ===

    /// Get the current connection state.
    pub fn connection_state(&self) -> DeviceState {
        self.shared.read().connection_state
    }

    /// Get all discovered boards.
    pub fn devices(&self) -> Vec<DeviceRef> {
        self.shared.read().discovered.values().cloned().collect()
    }

    /// Get the number of discovered boards.
    pub fn device_count(&self) -> usize {
        self.shared.read().discovered.len()
    }

    /// Get the currently selected board, if any.
    pub fn selected_device(&self) -> Option<DeviceRef> {
        self.shared.read().selected.clone()
    }

    /// Get the persisted identifier of the last successfully connected board.
    pub fn saved_identifier(&self) -> Option<String> {
        self.shared.read().saved_identifier.clone()
    }

    /// Check if a configuration update run is in progress.
    pub fn is_updating(&self) -> bool {
        self.shared.read().is_updating
    }

    /// Check if a scan is active.
    pub fn is_scanning(&self) -> bool {
        self.shared.read().is_scanning
    }

    /// Check if the host radio is powered on.
    pub fn is_radio_ready(&self) -> bool {
        self.shared.read().radio_ready
    }

    // === Notifications ===

    /// Subscribe to board events.
    pub fn subscribe(&self) -> broadcast::Receiver<BoardEvent> {
        self.events.subscribe()
    }

    /// Register a callback for every board event.
    pub fn on_event<F>(&self, callback: F) -> CallbackHandle
    where
        F: Fn(BoardEvent) + Send + Sync + 'static,
    {
        let callback_id = self.callback_counter.fetch_add(1, Ordering::SeqCst);
        let mut rx = self.events.subscribe();

        let handle = tokio::spawn(async move {
            while let Ok(event) = rx.recv().await {
                callback(event);
            }
        });

        CallbackHandle::new(callback_id, move || {
            handle.abort();
        })
    }

    /// Register a callback for button presses.
    pub fn on_button_pressed<F>(&self, callback: F) -> CallbackHandle
    where
        F: Fn(u8) + Send + Sync + 'static,
    {
        let callback_id = self.callback_counter.fetch_add(1, Ordering::SeqCst);
        let mut rx = self.events.subscribe();

        let handle = tokio::spawn(async move {
            while let Ok(event) = rx.recv().await {
                if let BoardEvent::ButtonPressed(number) = event {
                    callback(number);
                }
            }
        });

        CallbackHandle::new(callback_id, move || {
            handle.abort();
        })
    }

    fn send(&self, intent: Intent) {
        if self.intents.send(intent).is_err() {
            warn!("Board manager core task is gone, intent dropped");
        }
    }

    fn try_send(&self, intent: Intent) -> Result<()> {
        self.intents.send(intent).map_err(|_| Error::ManagerClosed)
    }
}

impl Drop for BoardManager {
    fn drop(&mut self) {
        let _ = self.intents.send(Intent::Shutdown);
    }
}

/// The core task: single owner of all mutable manager state.
struct Core<T: Transport, S: IdentifierStore> {
    transport: Arc<T>,
    store: S,
    shared: Arc<RwLock<SharedState>>,
    events: broadcast::Sender<BoardEvent>,
    /// Keep scanning until the wanted board shows up, instead of stopping
    /// after [`SCAN_WINDOW`].
    scan_indefinitely: bool,
    /// Accept the first discovered board.
    connect_to_any: bool,
    /// Deadline for the automatic scan stop; `None` cancels it.
    scan_stop_at: Option<Instant>,
    sequencer: UpdateSequencer,
}

impl<T: Transport, S: IdentifierStore> Core<T, S> {
    async fn run(
        mut self,
        mut intents: mpsc::UnboundedReceiver<Intent>,
        mut transport_events: broadcast::Receiver<TransportEvent>,
    ) {
        debug!("Board manager core task started");

        loop {
            let scan_deadline = self.scan_stop_at;
            let update_deadline = self.sequencer.deadline();

            tokio::select! {
                intent = intents.recv() => {
                    match intent {
                        None | Some(Intent::Shutdown) => break,
                        Some(intent) => {
                            if let Err(e) = self.handle_intent(intent).await {
                                warn!("Intent failed: {e}");
                            }
                        }
                    }
                }
                event = transport_events.recv() => {
                    match event {
                        Ok(event) => {
                            if let Err(e) = self.handle_transport_event(event).await {
                                warn!("Transport event handling failed: {e}");
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(missed)) => {
                            warn!("Dropped {missed} transport events");
                        }
                        Err(broadcast::error::RecvError::Closed) => {
                            warn!("Transport event stream closed");
                            break;
                        }
                    }
                }
                _ = time::sleep_until(scan_deadline.unwrap_or_else(Instant::now)),
                        if scan_deadline.is_some() => {
                    if let Err(e) = self.handle_scan_deadline().await {
                        warn!("Stopping scan failed: {e}");
                    }
                }
                _ = time::sleep_until(update_deadline.unwrap_or_else(Instant::now)),
                        if update_deadline.is_some() => {
                    self.sequencer.handle_deadline(&self.events);
                    self.sync_updating_flag();
                }
            }
        }

        if let Err(e) = self.cleanup().await {
            warn!("Cleanup failed: {e}");
        }

        debug!("Board manager core task ended");
    }

    // === Intents ===

    async fn handle_intent(&mut self, intent: Intent) -> Result<()> {
        debug!("Handling intent: {intent:?}");

        match intent {
            Intent::Configure {
                force_reset,
                auto_connect_any,
            } => self.configure(force_reset, auto_connect_any).await,
            Intent::Connect { identifier } => self.connect_by_identifier(&identifier).await,
            Intent::ConnectDevice { device } => self.connect_device(device).await,
            Intent::Disconnect { reset } => self.disconnect(reset).await,
            Intent::Scan { indefinite } => {
                if indefinite {
                    self.scan_indefinitely = true;
                    self.scan_stop_at = None;
                }
                self.get_devices().await
            }
            Intent::Shutdown => Ok(()),
        }
    }

    async fn configure(&mut self, force_reset: bool, auto_connect_any: bool) -> Result<()> {
        if force_reset {
            self.reset().await?;
        }

        self.connect_to_any = auto_connect_any;

        let saved = self.store.load();
        info!(
            "Configured (auto_connect_any: {auto_connect_any}, saved board: {})",
            saved.as_deref().unwrap_or("none")
        );

        // With a board to wait for there is no point timing the scan out.
        self.scan_indefinitely = saved.is_some() || auto_connect_any;
        self.shared.write().saved_identifier = saved;

        self.get_devices().await
    }

    async fn connect_by_identifier(&mut self, identifier: &str) -> Result<()> {
        if self.shared.read().selected.is_some() {
            self.disconnect(false).await?;
        }

        let device = match self.shared.read().discovered.get(identifier) {
            Some(device) => device.clone(),
            None => {
                // The set changed between the handle's check and now.
                return Err(Error::DeviceNotFound {
                    identifier: identifier.to_string(),
                });
            }
        };

        self.store.store(Some(identifier));
        {
            let mut shared = self.shared.write();
            shared.saved_identifier = Some(identifier.to_string());
            shared.selected = Some(device);
        }

        info!("Connecting to board {identifier}");
        self.transport.connect_device(identifier).await
    }

    async fn connect_device(&mut self, device: DeviceRef) -> Result<()> {
        let identifier = device.identifier.clone();

        self.store.store(Some(&identifier));
        {
            let mut shared = self.shared.write();
            shared.saved_identifier = Some(identifier.clone());
            shared.selected = Some(device);
        }

        // Future reconnects should wait for this board as long as it takes.
        self.scan_indefinitely = true;
        self.scan_stop_at = None;

        info!("Connecting to board {identifier}");
        self.transport.connect_device(&identifier).await?;

        self.transport.stop_scan().await?;
        self.shared.write().is_scanning = false;
        Ok(())
    }

    async fn disconnect(&mut self, reset: bool) -> Result<()> {
        let selected = self.shared.read().selected.clone();
        let Some(device) = selected else {
            debug!("Disconnect requested with no board selected");
            return Ok(());
        };

        info!("Disconnecting from board {}", device.identifier);
        self.scan_indefinitely = false;
        self.transport.disconnect_device(&device.identifier).await?;
        self.shared.write().selected = None;

        if reset {
            self.reset().await?;
        }
        Ok(())
    }

    /// Start a scan unless the radio is not ready or one is already running.
    async fn get_devices(&mut self) -> Result<()> {
        let (ready, scanning) = {
            let shared = self.shared.read();
            (shared.radio_ready, shared.is_scanning)
        };

        if !ready {
            debug!("Radio not ready, ignoring scan request");
            return Ok(());
        }
        if scanning {
            debug!("Already scanning, ignoring scan request");
            return Ok(());
        }

        info!("Starting scan for boards");
        self.shared.write().is_scanning = true;
        self.transport.start_scan().await?;

        if !self.scan_indefinitely {
            self.scan_stop_at = Some(Instant::now() + SCAN_WINDOW);
        }
        Ok(())
    }

    /// Forget the saved board, the discovered set, and any selection.
    async fn reset(&mut self) -> Result<()> {
        info!("Resetting board manager state");

        self.store.store(None);
        {
            let mut shared = self.shared.write();
            shared.saved_identifier = None;
            shared.selected = None;
            shared.discovered.clear();
            shared.is_scanning = false;
        }
        self.scan_stop_at = None;
        self.transport.stop_scan().await
    }

    /// The scan window elapsed without being canceled.
    async fn handle_scan_deadline(&mut self) -> Result<()> {
        self.scan_stop_at = None;

        // A policy change since the deadline was armed supersedes it.
        if self.scan_indefinitely || !self.shared.read().is_scanning {
            return Ok(());
        }

        info!("Scan window elapsed, stopping scan");
        self.transport.stop_scan().await?;
        self.shared.write().is_scanning = false;
        Ok(())
    }

    async fn cleanup(&mut self) -> Result<()> {
        if self.shared.read().is_scanning {
            self.transport.stop_scan().await?;
            self.shared.write().is_scanning = false;
        }

        let selected = self.shared.read().selected.clone();
        if let Some(device) = selected {
            self.transport.disconnect_device(&device.identifier).await?;
            self.shared.write().selected = None;
        }
        Ok(())
    }

    // === Event routing ===

    async fn handle_transport_event(&mut self, event: TransportEvent) -> Result<()> {
        match event {
            TransportEvent::RadioStateChanged(state) => self.handle_radio_state(state).await,
            TransportEvent::DeviceDiscovered(device) => self.handle_discovery(device).await,
            TransportEvent::DeviceStateChanged { identifier, state } => {
                self.handle_device_state(identifier, state).await
            }
            TransportEvent::DataReceived { identifier, data } => {
                if self.is_selected(&identifier) {
                    self.handle_data(&data);
                }
                Ok(())
            }
            TransportEvent::BusModeChanged { identifier, mode } => {
                debug!("Board {identifier} bus mode changed to {mode:?}");
                if self.is_selected(&identifier) {
                    let transport = Arc::clone(&self.transport);
                    self.sequencer
                        .handle_bus_mode_changed(transport.as_ref(), &identifier, mode, &self.events)
                        .await?;
                    self.sync_updating_flag();
                }
                Ok(())
            }
            TransportEvent::WriteComplete { identifier } => {
                if self.is_selected(&identifier) {
                    let transport = Arc::clone(&self.transport);
                    self.sequencer
                        .handle_write_complete(transport.as_ref(), &identifier)
                        .await?;
                }
                Ok(())
            }
        }
    }

    async fn handle_radio_state(&mut self, state: RadioState) -> Result<()> {
        let _ = self.events.send(BoardEvent::RadioStateChanged(state));

        if state.is_powered_on() {
            info!("Radio powered on");
            {
                let mut shared = self.shared.write();
                shared.radio_ready = true;
                shared.selected = None;
                shared.discovered.clear();
            }
            self.get_devices().await
        } else {
            info!("Radio not ready ({state:?})");
            {
                let mut shared = self.shared.write();
                shared.radio_ready = false;
                shared.is_scanning = false;
            }
            self.scan_stop_at = None;
            Ok(())
        }
    }

    async fn handle_discovery(&mut self, device: DeviceRef) -> Result<()> {
        debug!(
            "Discovered board {} ({})",
            device.identifier,
            device.name.as_deref().unwrap_or("unnamed")
        );

        let (saved, have_selection, devices) = {
            let mut shared = self.shared.write();
            shared
                .discovered
                .insert(device.identifier.clone(), device.clone());
            (
                shared.saved_identifier.clone(),
                shared.selected.is_some(),
                shared.discovered.values().cloned().collect::<Vec<_>>(),
            )
        };

        if self.connect_to_any {
            if !have_selection {
                info!("Auto-connecting to first discovered board");
                self.connect_device(device).await?;
            }
        } else if let Some(saved) = saved {
            if !have_selection {
                let matched = self.shared.read().discovered.get(&saved).cloned();
                if let Some(matched) = matched {
                    info!("Saved board {saved} discovered, reconnecting");
                    self.connect_device(matched).await?;
                }
            }
        } else {
            // No board to wait for; the host chooses.
            let _ = self.events.send(BoardEvent::DevicesFound(devices));
        }
        Ok(())
    }

    async fn handle_device_state(&mut self, identifier: String, state: DeviceState) -> Result<()> {
        // Only the board this manager drives is of interest. Disconnection is
        // accepted regardless, since the selection is cleared before the
        // transport confirms.
        let relevant = self.is_selected(&identifier) || state == DeviceState::Disconnected;
        if !relevant {
            debug!("Ignoring state change for unmanaged board {identifier}");
            return Ok(());
        }

        info!("Board {identifier} is now {state}");
        self.shared.write().connection_state = state;
        let _ = self.events.send(BoardEvent::ConnectionStateChanged(state));

        match state {
            DeviceState::Connected => {
                self.store.store(Some(&identifier));
                let version = {
                    let mut shared = self.shared.write();
                    shared.saved_identifier = Some(identifier.clone());
                    // Refresh the selection from the discovered set; the
                    // transport may have learned more during interrogation.
                    if let Some(device) = shared.discovered.get(&identifier).cloned() {
                        shared.selected = Some(device);
                    }
                    shared
                        .selected
                        .as_ref()
                        .and_then(|d| d.firmware_revision.clone())
                };

                let transport = Arc::clone(&self.transport);
                self.sequencer
                    .check_for_updates(transport.as_ref(), &identifier, version.as_deref())
                    .await?;
                self.sync_updating_flag();
                Ok(())
            }
            DeviceState::Disconnected => {
                {
                    let mut shared = self.shared.write();
                    shared.selected = None;
                    shared.is_scanning = false;
                }
                // A run in flight is abandoned, cursor and all.
                self.sequencer.abort(&self.events);
                self.sync_updating_flag();
                self.get_devices().await
            }
            _ => Ok(()),
        }
    }

    fn handle_data(&self, data: &[u8]) {
        match parse_button_press(data) {
            Some(number) => {
                debug!("Button {number} pressed");
                let _ = self.events.send(BoardEvent::ButtonPressed(number));
            }
            None => {
                debug!("Ignoring unrecognized payload: {:02X?}", data);
            }
        }
    }

    fn is_selected(&self, identifier: &str) -> bool {
        self.shared
            .read()
            .selected
            .as_ref()
            .map(|d| d.identifier == identifier)
            .unwrap_or(false)
    }

    fn sync_updating_flag(&self) {
        self.shared.write().is_updating = self.sequencer.is_updating();
    }
}

/// Decode a streamed payload as a button press.
///
/// Button presses arrive as `in_<N>` text, possibly with a trailing line
/// ending. Anything else is not a button press.
fn parse_button_press(data: &[u8]) -> Option<u8> {
    let text = std::str::from_utf8(data).ok()?;
    let text = text.trim_end_matches(|c| c == '\r' || c == '\n');
    text.strip_prefix("in_")?.parse().ok()
}
