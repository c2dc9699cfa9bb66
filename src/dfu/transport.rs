//! Transport capability for DFU communication.
//!
//! The core never talks to a Bluetooth stack directly. It depends on the
//! [`Transport`] and [`Connection`] traits so that the platform link, the
//! serial bridge and the in-process simulator can be swapped freely.

use std::fmt;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use super::error::{DfuError, DfuResult};
use super::package::ImageHash;

/// Connection state of a peripheral, as published by its transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    /// The link dropped without a local `close`.
    Lost,
}

/// Reference to a peripheral owned by the platform layer.
///
/// Clones share the same state cell: the transport publishes connection
/// changes through it and the upgrade core only reads them.
#[derive(Clone)]
pub struct PeripheralHandle {
    id: String,
    state: Arc<RwLock<ConnectionState>>,
}

impl PeripheralHandle {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            state: Arc::new(RwLock::new(ConnectionState::Disconnected)),
        }
    }

    /// Opaque peripheral identifier (BLE address, port name, ...).
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> ConnectionState {
        match self.state.read() {
            Ok(state) => *state,
            Err(poisoned) => *poisoned.into_inner(),
        }
    }

    /// Publish a connection-state change. Called by transports.
    pub fn set_state(&self, new_state: ConnectionState) {
        match self.state.write() {
            Ok(mut state) => *state = new_state,
            Err(poisoned) => *poisoned.into_inner() = new_state,
        }
    }

    /// Fail with `LinkLost` if the transport has reported the link as gone.
    pub fn ensure_linked(&self, operation: &str) -> DfuResult<()> {
        match self.state() {
            ConnectionState::Lost | ConnectionState::Disconnected => {
                Err(DfuError::link_lost(operation))
            }
            ConnectionState::Connecting | ConnectionState::Connected => Ok(()),
        }
    }
}

impl fmt::Debug for PeripheralHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeripheralHandle")
            .field("id", &self.id)
            .field("state", &self.state())
            .finish()
    }
}

/// One chunk of an image handed to the transport.
#[derive(Debug, Clone, Copy)]
pub struct Chunk<'a> {
    pub slot: u32,
    pub offset: u32,
    pub total_len: u32,
    pub data: &'a [u8],
}

/// Acknowledgement of a chunk; identifies the chunk by its echoed offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkAck {
    pub slot: u32,
    pub offset: u32,
}

/// Commands sent to the device outside the chunk stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceCommand {
    /// Mark the uploaded image for a trial boot.
    TestImage { hash: ImageHash },
    /// Make the image permanent.
    ConfirmImage { hash: ImageHash },
    /// Erase application settings so the new firmware starts clean.
    EraseAppSettings,
    /// Reboot so the bootloader performs the swap.
    Reset,
}

impl DeviceCommand {
    pub fn name(&self) -> &'static str {
        match self {
            DeviceCommand::TestImage { .. } => "test image",
            DeviceCommand::ConfirmImage { .. } => "confirm image",
            DeviceCommand::EraseAppSettings => "erase app settings",
            DeviceCommand::Reset => "reset",
        }
    }
}

/// Opens connections to peripherals.
pub trait Transport: Send + Sync {
    /// Open a connection, failing with `LinkUnavailable` if the peripheral
    /// cannot be reached.
    fn open(&self, handle: &PeripheralHandle) -> DfuResult<Box<dyn Connection>>;
}

/// An open, chunked request/response channel to one peripheral.
pub trait Connection: Send {
    /// Dispatch a chunk without waiting for its acknowledgement.
    fn write_chunk(&mut self, chunk: &Chunk<'_>) -> DfuResult<()>;

    /// Wait for the next chunk acknowledgement.
    ///
    /// Acks may arrive out of order; a device-side rejection surfaces as
    /// `DeviceRejected`.
    fn wait_ack(&mut self, timeout: Duration) -> DfuResult<ChunkAck>;

    /// Send a device command and wait for its response.
    fn request(&mut self, command: &DeviceCommand, timeout: Duration) -> DfuResult<()>;

    /// Release the link. Further calls on the connection are invalid.
    fn close(&mut self);

    /// Write one chunk and block until that chunk is acknowledged.
    fn send_chunk(&mut self, chunk: &Chunk<'_>, timeout: Duration) -> DfuResult<ChunkAck> {
        self.write_chunk(chunk)?;
        let ack = self.wait_ack(timeout)?;
        if ack.slot != chunk.slot || ack.offset != chunk.offset {
            return Err(DfuError::UnexpectedResponse {
                reason: format!(
                    "ack for {}@{} while waiting for {}@{}",
                    ack.slot, ack.offset, chunk.slot, chunk.offset
                ),
            });
        }
        Ok(ack)
    }
}
