//! Upgrade state machine.
//!
//! Orchestrates one firmware upgrade:
//! 1. Validate - re-check the package digests
//! 2. Upload(i) - stream every image slot in package order
//! 3. Test - mark each image for a trial boot
//! 4. Confirm - make the images permanent, optionally erasing app settings
//! 5. Reset - reboot and wait for the peripheral to come back
//!
//! Cancellation is honored at chunk boundaries and between states.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::config::{UpgradeConfiguration, COMMAND_TIMEOUT};
use super::error::{DfuError, DfuResult, FailureReason};
use super::package::ImagePackage;
use super::transport::{Connection, DeviceCommand, PeripheralHandle, Transport};
use super::upload::{lock, UploadEngine, UploadSession};

/// State of an upgrade run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "data", rename_all = "camelCase")]
pub enum UpgradeState {
    Idle,
    Validate,
    Upload { slot: u32 },
    Test,
    Confirm,
    Reset,
    Success,
    Failed { reason: FailureReason },
    Cancelled,
}

impl UpgradeState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            UpgradeState::Success | UpgradeState::Failed { .. } | UpgradeState::Cancelled
        )
    }
}

impl fmt::Display for UpgradeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UpgradeState::Idle => f.write_str("Idle"),
            UpgradeState::Validate => f.write_str("Validate"),
            UpgradeState::Upload { slot } => write!(f, "Upload({})", slot),
            UpgradeState::Test => f.write_str("Test"),
            UpgradeState::Confirm => f.write_str("Confirm"),
            UpgradeState::Reset => f.write_str("Reset"),
            UpgradeState::Success => f.write_str("Success"),
            UpgradeState::Failed { reason } => write!(f, "Failed({:?})", reason.kind),
            UpgradeState::Cancelled => f.write_str("Cancelled"),
        }
    }
}

/// Final result of an upgrade run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", content = "reason", rename_all = "camelCase")]
pub enum UpgradeOutcome {
    Success,
    Failed(FailureReason),
    Cancelled,
}

impl UpgradeOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, UpgradeOutcome::Success)
    }
}

/// Upload progress after one acknowledged chunk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressReport {
    pub slot: u32,
    pub bytes_acknowledged: u64,
    pub total: u64,
    /// Bytes acknowledged across every slot of the package.
    pub package_acknowledged: u64,
    pub package_total: u64,
    pub timestamp: DateTime<Utc>,
}

/// Event emitted by a running upgrade.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data", rename_all = "camelCase")]
pub enum UpgradeEvent {
    StateChanged {
        previous: UpgradeState,
        new: UpgradeState,
    },
    Progress(ProgressReport),
    Terminal(UpgradeOutcome),
}

impl UpgradeEvent {
    /// Linear percentage for this event. Failure events return -1.0 and
    /// should not move a progress bar.
    pub fn percent(&self) -> f32 {
        match self {
            UpgradeEvent::StateChanged { new, .. } => state_percent(new),
            UpgradeEvent::Progress(report) => {
                if report.package_total == 0 {
                    2.0
                } else {
                    2.0 + (report.package_acknowledged as f32 / report.package_total as f32)
                        * 88.0
                }
            }
            UpgradeEvent::Terminal(UpgradeOutcome::Success) => 100.0,
            UpgradeEvent::Terminal(_) => -1.0,
        }
    }

    /// Human-readable message for this event.
    pub fn message(&self) -> String {
        match self {
            UpgradeEvent::StateChanged { new, .. } => match new {
                UpgradeState::Idle => "Idle".into(),
                UpgradeState::Validate => "Validating firmware package...".into(),
                UpgradeState::Upload { slot } => format!("Uploading image {}...", slot),
                UpgradeState::Test => "Verifying uploaded images...".into(),
                UpgradeState::Confirm => "Confirming images...".into(),
                UpgradeState::Reset => "Waiting for device to restart...".into(),
                UpgradeState::Success => "Update complete!".into(),
                UpgradeState::Failed { reason } => format!("Update failed: {}", reason),
                UpgradeState::Cancelled => "Update cancelled".into(),
            },
            UpgradeEvent::Progress(report) => {
                let percent = if report.total == 0 {
                    0
                } else {
                    (report.bytes_acknowledged * 100) / report.total
                };
                format!("Uploading image {}... {}%", report.slot, percent)
            }
            UpgradeEvent::Terminal(UpgradeOutcome::Success) => "Update complete!".into(),
            UpgradeEvent::Terminal(UpgradeOutcome::Failed(reason)) => {
                format!("Update failed: {}", reason)
            }
            UpgradeEvent::Terminal(UpgradeOutcome::Cancelled) => "Update cancelled".into(),
        }
    }
}

fn state_percent(state: &UpgradeState) -> f32 {
    match state {
        UpgradeState::Idle => 0.0,
        UpgradeState::Validate => 1.0,
        UpgradeState::Upload { .. } => 2.0,
        UpgradeState::Test => 91.0,
        UpgradeState::Confirm => 94.0,
        UpgradeState::Reset => 96.0,
        UpgradeState::Success => 100.0,
        UpgradeState::Failed { .. } | UpgradeState::Cancelled => -1.0,
    }
}

/// Tracks the current state and reports each transition once.
struct Machine<'a, E: FnMut(UpgradeEvent)> {
    peripheral: &'a str,
    state: UpgradeState,
    shared: &'a Mutex<UpgradeState>,
    emit: E,
}

impl<'a, E: FnMut(UpgradeEvent)> Machine<'a, E> {
    fn transition(&mut self, new: UpgradeState) {
        let previous = std::mem::replace(&mut self.state, new.clone());
        *lock(self.shared) = new.clone();
        log::info!("Upgrade of {}: {} -> {}", self.peripheral, previous, new);
        (self.emit)(UpgradeEvent::StateChanged { previous, new });
    }
}

/// Everything one upgrade run needs; consumed by the worker thread.
pub(crate) struct UpgradeRun {
    pub transport: Arc<dyn Transport>,
    pub handle: PeripheralHandle,
    pub package: ImagePackage,
    pub config: UpgradeConfiguration,
    pub cancel: Arc<AtomicBool>,
    pub state: Arc<Mutex<UpgradeState>>,
}

impl UpgradeRun {
    /// Drive the run to a terminal state. Emits every transition (including
    /// the one into the terminal state) and returns the outcome; the caller
    /// publishes the terminal event.
    pub fn run<E: FnMut(UpgradeEvent)>(&self, emit: E) -> UpgradeOutcome {
        let mut machine = Machine {
            peripheral: self.handle.id(),
            state: UpgradeState::Idle,
            shared: &self.state,
            emit,
        };
        let mut conn: Option<Box<dyn Connection>> = None;

        let result = self.drive(&mut machine, &mut conn);
        if let Some(mut conn) = conn.take() {
            conn.close();
        }

        match result {
            Ok(()) => {
                machine.transition(UpgradeState::Success);
                UpgradeOutcome::Success
            }
            Err(DfuError::Cancelled) => {
                machine.transition(UpgradeState::Cancelled);
                UpgradeOutcome::Cancelled
            }
            Err(e) => {
                log::warn!("Upgrade of {} failed: {} [{}]", self.handle.id(), e, e.error_code());
                let reason = FailureReason::from(&e);
                machine.transition(UpgradeState::Failed {
                    reason: reason.clone(),
                });
                UpgradeOutcome::Failed(reason)
            }
        }
    }

    fn check_cancel(&self) -> DfuResult<()> {
        if self.cancel.load(Ordering::SeqCst) {
            Err(DfuError::Cancelled)
        } else {
            Ok(())
        }
    }

    fn drive<E: FnMut(UpgradeEvent)>(
        &self,
        machine: &mut Machine<'_, E>,
        conn: &mut Option<Box<dyn Connection>>,
    ) -> DfuResult<()> {
        machine.transition(UpgradeState::Validate);
        self.package.verify().map_err(|e| {
            DfuError::invalid_format(format!("package failed validation: {}", e))
        })?;
        self.check_cancel()?;

        *conn = Some(self.transport.open(&self.handle)?);

        // Upload
        let engine = UploadEngine::new(
            self.transport.as_ref(),
            &self.handle,
            &self.config,
            &self.cancel,
        );
        let package_total = self.package.total_len() as u64;
        let mut completed = 0u64;

        for slot in self.package.slots() {
            self.check_cancel()?;
            machine.transition(UpgradeState::Upload {
                slot: slot.slot_index(),
            });

            let session = Mutex::new(UploadSession::new(
                slot.slot_index(),
                slot.len() as u32,
                self.config.chunk_size as u32,
                self.config.pipeline_depth,
            ));
            let c = connection(conn)?;
            engine.upload(c, slot, &session, |acked, total, timestamp| {
                (machine.emit)(UpgradeEvent::Progress(ProgressReport {
                    slot: slot.slot_index(),
                    bytes_acknowledged: acked,
                    total,
                    package_acknowledged: completed + acked,
                    package_total,
                    timestamp,
                }));
            })?;
            completed += slot.len() as u64;
        }

        // Test
        self.check_cancel()?;
        machine.transition(UpgradeState::Test);
        for slot in self.package.slots() {
            let command = DeviceCommand::TestImage {
                hash: slot.expected_hash(),
            };
            connection(conn)?.request(&command, COMMAND_TIMEOUT)?;
        }

        // Confirm
        self.check_cancel()?;
        machine.transition(UpgradeState::Confirm);
        for slot in self.package.slots() {
            let command = DeviceCommand::ConfirmImage {
                hash: slot.expected_hash(),
            };
            connection(conn)?.request(&command, COMMAND_TIMEOUT)?;
        }
        if self.config.erase_app_settings {
            connection(conn)?.request(&DeviceCommand::EraseAppSettings, COMMAND_TIMEOUT)?;
        }

        // Reset
        self.check_cancel()?;
        machine.transition(UpgradeState::Reset);
        match connection(conn)?.request(&DeviceCommand::Reset, COMMAND_TIMEOUT) {
            Ok(()) => {}
            // The device may reboot before it answers.
            Err(e) if e.is_retriable() => log::debug!("Reset not acknowledged: {}", e),
            Err(e) => return Err(e),
        }
        if let Some(mut old) = conn.take() {
            old.close();
        }

        *conn = Some(self.wait_for_reconnect()?);
        Ok(())
    }

    /// Poll `open` until the device is back or the swap time runs out.
    fn wait_for_reconnect(&self) -> DfuResult<Box<dyn Connection>> {
        let deadline = Instant::now() + self.config.estimated_swap_time;

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(DfuError::timeout("device reconnect after reset"));
            }
            std::thread::sleep(self.config.reconnect_poll_interval.min(remaining));
            self.check_cancel()?;

            match self.transport.open(&self.handle) {
                Ok(conn) => return Ok(conn),
                Err(e) => log::debug!("Waiting for {} after reset: {}", self.handle.id(), e),
            }
        }
    }
}

fn connection(conn: &mut Option<Box<dyn Connection>>) -> DfuResult<&mut Box<dyn Connection>> {
    conn.as_mut().ok_or_else(|| DfuError::link_lost("upgrade"))
}
