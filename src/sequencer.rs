//! Update sequencer for scripted board configuration.
//!
//! When a board connects with firmware below [`REQUIRED_BOARD_VERSION`], the
//! sequencer flips the serial link into remote command mode and walks
//! [`UPDATE_SCRIPT`] one command at a time. Each write acknowledgement is the
//! sole trigger for the next command; when the cursor reaches the end of the
//! script the link is switched back to stream mode and the run is done.
//!
//! The board gives no per-command acknowledgement matching, and none is
//! needed: the link delivers one write at a time, in order.

use std::str::FromStr;
use tokio::sync::broadcast;
use tokio::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::ble::transport::{BusMode, Transport};
use crate::error::Result;
use crate::manager::BoardEvent;
use crate::version::BoardVersion;

/// Minimum firmware configuration version a board must report to skip the
/// update run.
pub const REQUIRED_BOARD_VERSION: BoardVersion = BoardVersion::new(1, 0, 0);

/// How long to wait for a write acknowledgement or a mode-switch confirmation
/// before declaring the run stalled.
pub const STEP_TIMEOUT: Duration = Duration::from_secs(5);

/// The fixed configuration script, executed in declared order.
///
/// Later commands depend on earlier ones having taken effect: the input labels
/// assume the function units and event bindings exist, and `save` persists
/// everything that came before it.
pub const UPDATE_SCRIPT: [&str; 33] = [
    // Function unit levels for the seven call buttons.
    "gfu 1 ufu_level",
    "gfu 2 ufu_level",
    "gfu 3 ufu_level",
    "gfu 4 ufu_level",
    "gfu 5 ufu_level",
    "gfu 6 ufu_level",
    "gfu 7 ufu_level",
    // Digital inputs: weak pull-up, 0ms debounce.
    "gdi 1 ipuw db0",
    "gdi 2 ipuw db0",
    "gdi 3 ipuw db0",
    "gdi 4 ipuw db0",
    "gdi 5 ipuw db0",
    "gdi 6 ipuw db0",
    "gdi 7 ipuw db0",
    // Event bindings: connection plus one rising edge per input.
    "uevt 0 con",
    "uevt 1 hi 1",
    "uevt 2 hi 2",
    "uevt 3 hi 3",
    "uevt 4 hi 4",
    "uevt 5 hi 5",
    "uevt 6 hi 6",
    "uevt 7 hi 7",
    // Per-input payloads streamed on each button press.
    "ufu 1 send \"in_1\"",
    "ufu 2 send \"in_2\"",
    "ufu 3 send \"in_3\"",
    "ufu 4 send \"in_4\"",
    "ufu 5 send \"in_5\"",
    "ufu 6 send \"in_6\"",
    "ufu 7 send \"in_7\"",
    // Identity strings.
    "set sy d n \"PillCase-#####\"",
    "set sy i m \"Hatchmed\"",
    "set sy i p \"Pillow Case\"",
    // Persist everything above.
    "save",
];

/// Phase of the update run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum UpdatePhase {
    /// No run in progress.
    #[default]
    Idle,
    /// Waiting for confirmation of the switch into remote command mode.
    EnteringCommandMode,
    /// Walking the script, one command per acknowledgement.
    Running,
    /// Waiting for confirmation of the switch back to stream mode.
    ExitingCommandMode,
}

/// Walks [`UPDATE_SCRIPT`] against a connected board.
///
/// Owned by the manager core task; all methods are called from that single
/// task, so the cursor and phase need no synchronization.
#[derive(Debug, Default)]
pub(crate) struct UpdateSequencer {
    /// Index of the next command to send, 0..=script length.
    cursor: usize,
    phase: UpdatePhase,
    updating: bool,
    /// Deadline for the acknowledgement the current phase is waiting on.
    deadline: Option<Instant>,
}

impl UpdateSequencer {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Whether an update run is currently in progress.
    pub(crate) fn is_updating(&self) -> bool {
        self.updating
    }

    /// Current cursor position into the script.
    #[cfg_attr(not(test), allow(dead_code))]
    pub(crate) fn cursor(&self) -> usize {
        self.cursor
    }

    /// Deadline for the pending acknowledgement, if one is outstanding.
    pub(crate) fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Decide whether a reported version requires the update run.
    ///
    /// A missing or unreadable version is treated as out of date; running the
    /// script on an already configured board is harmless, skipping it on an
    /// unconfigured one is not.
    pub(crate) fn update_needed(version: Option<&str>) -> bool {
        match version {
            None => true,
            Some(reported) => match BoardVersion::from_str(reported) {
                Ok(parsed) => parsed < REQUIRED_BOARD_VERSION,
                Err(e) => {
                    warn!("Unreadable board version {reported:?}: {e}");
                    true
                }
            },
        }
    }

    /// Begin an update run if the reported version requires one.
    ///
    /// Resets the cursor and, when a run is needed, requests the switch into
    /// remote command mode. The script starts only once that switch is
    /// confirmed via [`handle_bus_mode_changed`].
    ///
    /// [`handle_bus_mode_changed`]: Self::handle_bus_mode_changed
    pub(crate) async fn check_for_updates<T: Transport>(
        &mut self,
        transport: &T,
        identifier: &str,
        version: Option<&str>,
    ) -> Result<()> {
        self.cursor = 0;

        if !Self::update_needed(version) {
            debug!(
                "Board {} reports version {:?}, no update needed",
                identifier, version
            );
            return Ok(());
        }

        info!(
            "Board {} needs configuration update (reported version: {:?})",
            identifier, version
        );

        self.phase = UpdatePhase::EnteringCommandMode;
        self.deadline = Some(Instant::now() + STEP_TIMEOUT);
        transport.set_bus_mode(identifier, BusMode::RemoteCommand).await
    }

    /// React to a bus-mode change on the board.
    ///
    /// Mode changes are informational except as run boundaries: confirmation
    /// of remote command mode starts the script, confirmation of stream mode
    /// ends the run.
    pub(crate) async fn handle_bus_mode_changed<T: Transport>(
        &mut self,
        transport: &T,
        identifier: &str,
        mode: BusMode,
        events: &broadcast::Sender<BoardEvent>,
    ) -> Result<()> {
        match (self.phase, mode) {
            (UpdatePhase::EnteringCommandMode, BusMode::RemoteCommand) => {
                info!(
                    "Board {} in command mode, running {} update steps",
                    identifier,
                    UPDATE_SCRIPT.len()
                );
                self.updating = true;
                self.phase = UpdatePhase::Running;
                let _ = events.send(BoardEvent::UpdateRunningChanged(true));
                self.send_step(transport, identifier).await
            }
            (UpdatePhase::ExitingCommandMode, BusMode::Stream) => {
                info!("Board {} update complete", identifier);
                self.updating = false;
                self.phase = UpdatePhase::Idle;
                self.deadline = None;
                let _ = events.send(BoardEvent::UpdateRunningChanged(false));
                Ok(())
            }
            _ => {
                debug!("Board {} bus mode now {:?}", identifier, mode);
                Ok(())
            }
        }
    }

    /// React to a write acknowledgement.
    ///
    /// This is the only trigger that advances the cursor. When the script is
    /// exhausted, the single switch back to stream mode is requested here.
    pub(crate) async fn handle_write_complete<T: Transport>(
        &mut self,
        transport: &T,
        identifier: &str,
    ) -> Result<()> {
        if self.phase != UpdatePhase::Running {
            return Ok(());
        }

        if self.cursor < UPDATE_SCRIPT.len() {
            self.send_step(transport, identifier).await
        } else {
            self.phase = UpdatePhase::ExitingCommandMode;
            self.deadline = Some(Instant::now() + STEP_TIMEOUT);
            transport.set_bus_mode(identifier, BusMode::Stream).await
        }
    }

    /// The pending acknowledgement never arrived.
    ///
    /// The run is abandoned; the host learns about it through
    /// [`BoardEvent::UpdateStalled`].
    pub(crate) fn handle_deadline(&mut self, events: &broadcast::Sender<BoardEvent>) {
        let step = self.cursor;
        warn!("Update stalled waiting for acknowledgement at step {step}");
        let _ = events.send(BoardEvent::UpdateStalled { step });
        self.abort(events);
    }

    /// Abandon any run in progress, leaving the cursor where it was.
    ///
    /// Used on disconnect and on stall; there is no resume-from-midpoint, the
    /// next connected transition starts the script over.
    pub(crate) fn abort(&mut self, events: &broadcast::Sender<BoardEvent>) {
        self.phase = UpdatePhase::Idle;
        self.deadline = None;
        if self.updating {
            self.updating = false;
            let _ = events.send(BoardEvent::UpdateRunningChanged(false));
        }
    }

    /// Send the command at the cursor and advance it.
    async fn send_step<T: Transport>(&mut self, transport: &T, identifier: &str) -> Result<()> {
        let command = UPDATE_SCRIPT[self.cursor];
        debug!(
            "Update step {}/{}: {}",
            self.cursor + 1,
            UPDATE_SCRIPT.len(),
            command
        );
        self.cursor += 1;
        self.deadline = Some(Instant::now() + STEP_TIMEOUT);
        transport.send_command(identifier, command).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ble::transport::{Transport, TransportEvent};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use pretty_assertions::assert_eq;
    use std::sync::Arc;

    /// Records every intent issued by the sequencer.
    #[derive(Clone, Default)]
    struct RecordingTransport {
        calls: Arc<Mutex<Vec<Call>>>,
    }

    #[derive(Debug, Clone, PartialEq)]
    enum Call {
        SetBusMode(String, BusMode),
        SendCommand(String, String),
    }

    impl RecordingTransport {
        fn calls(&self) -> Vec<Call> {
            self.calls.lock().clone()
        }
    }

    #[async_trait]
    impl Transport for RecordingTransport {
        async fn start_scan(&self) -> crate::Result<()> {
            Ok(())
        }

        async fn stop_scan(&self) -> crate::Result<()> {
            Ok(())
        }

        async fn connect_device(&self, _identifier: &str) -> crate::Result<()> {
            Ok(())
        }

        async fn disconnect_device(&self, _identifier: &str) -> crate::Result<()> {
            Ok(())
        }

        async fn set_bus_mode(&self, identifier: &str, mode: BusMode) -> crate::Result<()> {
            self.calls
                .lock()
                .push(Call::SetBusMode(identifier.to_string(), mode));
            Ok(())
        }

        async fn send_command(&self, identifier: &str, command: &str) -> crate::Result<()> {
            self.calls
                .lock()
                .push(Call::SendCommand(identifier.to_string(), command.to_string()));
            Ok(())
        }

        fn subscribe(&self) -> tokio::sync::broadcast::Receiver<TransportEvent> {
            let (tx, rx) = tokio::sync::broadcast::channel(1);
            drop(tx);
            rx
        }
    }

    fn events_channel() -> (
        broadcast::Sender<BoardEvent>,
        broadcast::Receiver<BoardEvent>,
    ) {
        broadcast::channel(128)
    }

    fn drain(rx: &mut broadcast::Receiver<BoardEvent>) -> Vec<BoardEvent> {
        let mut out = Vec::new();
        while let Ok(event) = rx.try_recv() {
            out.push(event);
        }
        out
    }

    #[test]
    fn test_update_needed() {
        assert!(UpdateSequencer::update_needed(None));
        assert!(UpdateSequencer::update_needed(Some("0.9.0")));
        assert!(UpdateSequencer::update_needed(Some("not-a-version")));
        assert!(!UpdateSequencer::update_needed(Some("1.0.0")));
        assert!(!UpdateSequencer::update_needed(Some("1.10.0")));
    }

    #[test]
    fn test_current_version_skips_run() {
        tokio_test::block_on(async {
            let transport = RecordingTransport::default();
            let mut sequencer = UpdateSequencer::new();

            sequencer
                .check_for_updates(&transport, "board-1", Some("1.2.0"))
                .await
                .unwrap();

            assert!(transport.calls().is_empty());
            assert!(!sequencer.is_updating());
            assert_eq!(sequencer.deadline(), None);
        });
    }

    #[test]
    fn test_full_run_in_order() {
        tokio_test::block_on(async {
            let transport = RecordingTransport::default();
            let (events, mut rx) = events_channel();
            let mut sequencer = UpdateSequencer::new();

            sequencer
                .check_for_updates(&transport, "board-1", Some("0.9.0"))
                .await
                .unwrap();
            assert_eq!(
                transport.calls(),
                vec![Call::SetBusMode("board-1".into(), BusMode::RemoteCommand)]
            );
            assert!(!sequencer.is_updating());

            // Command mode confirmed: first step goes out and the run is live.
            sequencer
                .handle_bus_mode_changed(&transport, "board-1", BusMode::RemoteCommand, &events)
                .await
                .unwrap();
            assert!(sequencer.is_updating());
            assert_eq!(drain(&mut rx), vec![BoardEvent::UpdateRunningChanged(true)]);
            assert_eq!(sequencer.cursor(), 1);

            // Each acknowledgement advances the cursor by exactly one.
            for expected_cursor in 2..=UPDATE_SCRIPT.len() {
                sequencer
                    .handle_write_complete(&transport, "board-1")
                    .await
                    .unwrap();
                assert_eq!(sequencer.cursor(), expected_cursor);
            }

            // Final acknowledgement: no further command, one switch to stream.
            sequencer
                .handle_write_complete(&transport, "board-1")
                .await
                .unwrap();
            assert_eq!(sequencer.cursor(), UPDATE_SCRIPT.len());

            let calls = transport.calls();
            let commands: Vec<&str> = calls
                .iter()
                .filter_map(|c| match c {
                    Call::SendCommand(_, command) => Some(command.as_str()),
                    _ => None,
                })
                .collect();
            assert_eq!(commands, UPDATE_SCRIPT.to_vec());
            assert_eq!(
                *calls.last().unwrap(),
                Call::SetBusMode("board-1".into(), BusMode::Stream)
            );
            let stream_switches = calls
                .iter()
                .filter(|c| matches!(c, Call::SetBusMode(_, BusMode::Stream)))
                .count();
            assert_eq!(stream_switches, 1);

            // Stream mode confirmed: the run is over.
            sequencer
                .handle_bus_mode_changed(&transport, "board-1", BusMode::Stream, &events)
                .await
                .unwrap();
            assert!(!sequencer.is_updating());
            assert_eq!(
                drain(&mut rx),
                vec![BoardEvent::UpdateRunningChanged(false)]
            );

            // A stray acknowledgement after completion does nothing.
            let call_count = transport.calls().len();
            sequencer
                .handle_write_complete(&transport, "board-1")
                .await
                .unwrap();
            assert_eq!(transport.calls().len(), call_count);
        });
    }

    #[test]
    fn test_mode_change_outside_run_is_informational() {
        tokio_test::block_on(async {
            let transport = RecordingTransport::default();
            let (events, mut rx) = events_channel();
            let mut sequencer = UpdateSequencer::new();

            sequencer
                .handle_bus_mode_changed(&transport, "board-1", BusMode::Stream, &events)
                .await
                .unwrap();
            sequencer
                .handle_bus_mode_changed(&transport, "board-1", BusMode::RemoteCommand, &events)
                .await
                .unwrap();

            assert!(transport.calls().is_empty());
            assert!(drain(&mut rx).is_empty());
        });
    }

    #[test]
    fn test_abort_mid_run() {
        tokio_test::block_on(async {
            let transport = RecordingTransport::default();
            let (events, mut rx) = events_channel();
            let mut sequencer = UpdateSequencer::new();

            sequencer
                .check_for_updates(&transport, "board-1", None)
                .await
                .unwrap();
            sequencer
                .handle_bus_mode_changed(&transport, "board-1", BusMode::RemoteCommand, &events)
                .await
                .unwrap();
            drain(&mut rx);

            sequencer.abort(&events);
            assert!(!sequencer.is_updating());
            assert_eq!(sequencer.deadline(), None);
            assert_eq!(
                drain(&mut rx),
                vec![BoardEvent::UpdateRunningChanged(false)]
            );

            // Acknowledgements from the abandoned run are ignored.
            let call_count = transport.calls().len();
            sequencer
                .handle_write_complete(&transport, "board-1")
                .await
                .unwrap();
            assert_eq!(transport.calls().len(), call_count);
        });
    }

    #[test]
    fn test_stall_reports_step_and_aborts() {
        tokio_test::block_on(async {
            let transport = RecordingTransport::default();
            let (events, mut rx) = events_channel();
            let mut sequencer = UpdateSequencer::new();

            sequencer
                .check_for_updates(&transport, "board-1", None)
                .await
                .unwrap();
            sequencer
                .handle_bus_mode_changed(&transport, "board-1", BusMode::RemoteCommand, &events)
                .await
                .unwrap();
            for _ in 0..4 {
                sequencer
                    .handle_write_complete(&transport, "board-1")
                    .await
                    .unwrap();
            }
            drain(&mut rx);

            sequencer.handle_deadline(&events);

            assert!(!sequencer.is_updating());
            assert_eq!(sequencer.deadline(), None);
            assert_eq!(
                drain(&mut rx),
                vec![
                    BoardEvent::UpdateStalled { step: 5 },
                    BoardEvent::UpdateRunningChanged(false),
                ]
            );
        });
    }

    #[test]
    fn test_run_restarts_from_zero() {
        tokio_test::block_on(async {
            let transport = RecordingTransport::default();
            let (events, _rx) = events_channel();
            let mut sequencer = UpdateSequencer::new();

            sequencer
                .check_for_updates(&transport, "board-1", None)
                .await
                .unwrap();
            sequencer
                .handle_bus_mode_changed(&transport, "board-1", BusMode::RemoteCommand, &events)
                .await
                .unwrap();
            sequencer.abort(&events);
            assert_eq!(sequencer.cursor(), 1);

            // A fresh check resets the cursor before anything else.
            sequencer
                .check_for_updates(&transport, "board-1", Some("1.0.0"))
                .await
                .unwrap();
            assert_eq!(sequencer.cursor(), 0);
        });
    }

    #[test]
    fn test_script_shape() {
        assert_eq!(UPDATE_SCRIPT.len(), 33);
        // The persist command must come last.
        assert_eq!(*UPDATE_SCRIPT.last().unwrap(), "save");
        // Labels follow the event bindings they depend on.
        let first_label = UPDATE_SCRIPT.iter().position(|c| c.contains("send")).unwrap();
        let last_binding = UPDATE_SCRIPT
            .iter()
            .rposition(|c| c.starts_with("uevt"))
            .unwrap();
        assert!(first_label > last_binding);
    }
}
