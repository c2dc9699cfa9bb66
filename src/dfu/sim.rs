//! In-process simulated peripheral.
//!
//! Implements [`Transport`] against an emulated MCUboot-style device that
//! stores uploaded chunks, verifies test/confirm hashes and reboots on reset.
//! Faults can be injected per chunk offset and every exchange is logged so
//! tests can assert on exactly what went over the link.

use std::collections::{HashMap, VecDeque};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use super::error::{DfuError, DfuResult};
use super::package::ImageHash;
use super::transport::{
    Chunk, ChunkAck, Connection, ConnectionState, DeviceCommand, PeripheralHandle, Transport,
};
use super::upload::lock;

/// Return code the simulated device uses for a failed image check.
pub const RC_BAD_IMAGE: u8 = 0x03;

/// Fault injected on a chunk write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkFault {
    /// The link drops during the write.
    LinkLost,
    /// The chunk is stored but its ack never arrives.
    DropAck,
}

/// One `write_chunk` call as seen by the device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkRecord {
    pub slot: u32,
    pub offset: u32,
    pub len: usize,
}

#[derive(Debug)]
enum PendingAck {
    Ack(ChunkAck),
    Rejected { offset: u32, rc: u8 },
}

struct WriteGate {
    at_write: usize,
    reached: Sender<()>,
    release: Receiver<()>,
}

#[derive(Default)]
struct DeviceState {
    images: HashMap<u32, Vec<u8>>,
    chunk_log: Vec<ChunkRecord>,
    commands: Vec<DeviceCommand>,
    chunk_faults: HashMap<u32, (ChunkFault, u32)>,
    chunk_rejects: HashMap<u32, u8>,
    command_rejects: HashMap<&'static str, u8>,
    corrupt_writes: bool,
    reorder_acks: bool,
    unreachable: bool,
    /// Failed open attempts before the device is back after a reset.
    /// `None` means it never comes back.
    reconnect_after_reset: Option<u32>,
    rebooting: bool,
    attempts_since_reset: u32,
    open_count: u32,
    outstanding: usize,
    peak_outstanding: usize,
    gate: Option<WriteGate>,
}

/// Handle for a paused chunk write, see [`SimulatedPeripheral::pause_before_write`].
pub struct WritePause {
    reached: Receiver<()>,
    release: Sender<()>,
}

impl WritePause {
    /// Block until the device is holding the paused write.
    pub fn wait_reached(&self, timeout: Duration) -> bool {
        self.reached.recv_timeout(timeout).is_ok()
    }

    /// Let the paused write complete.
    pub fn release(&self) {
        self.release.send(()).ok();
    }
}

/// Emulated peripheral shared between the test and its transport.
#[derive(Clone)]
pub struct SimulatedPeripheral {
    state: Arc<Mutex<DeviceState>>,
}

impl Default for SimulatedPeripheral {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedPeripheral {
    /// A healthy device that reconnects on the first poll after a reset.
    pub fn new() -> Self {
        let state = DeviceState {
            reconnect_after_reset: Some(0),
            ..Default::default()
        };
        Self {
            state: Arc::new(Mutex::new(state)),
        }
    }

    pub fn transport(&self) -> SimulatedTransport {
        SimulatedTransport {
            state: Arc::clone(&self.state),
        }
    }

    // ------------------------------------------------------------------
    // Fault injection
    // ------------------------------------------------------------------

    /// Inject `fault` on the next `times` writes of the chunk at `offset`.
    pub fn fail_chunk(&self, offset: u32, fault: ChunkFault, times: u32) {
        lock(&self.state).chunk_faults.insert(offset, (fault, times));
    }

    /// Reject the chunk at `offset` with a device return code.
    pub fn reject_chunk(&self, offset: u32, rc: u8) {
        lock(&self.state).chunk_rejects.insert(offset, rc);
    }

    /// Reject every command named `command` (see [`DeviceCommand::name`]).
    pub fn reject_command(&self, command: &'static str, rc: u8) {
        lock(&self.state).command_rejects.insert(command, rc);
    }

    /// Flip a bit in every stored chunk so image checks fail on the device.
    pub fn corrupt_writes(&self, enabled: bool) {
        lock(&self.state).corrupt_writes = enabled;
    }

    /// Deliver pending acks newest first.
    pub fn reorder_acks(&self, enabled: bool) {
        lock(&self.state).reorder_acks = enabled;
    }

    /// Refuse every `open`.
    pub fn set_unreachable(&self, unreachable: bool) {
        lock(&self.state).unreachable = unreachable;
    }

    /// Number of failed reconnect attempts after a reset, `None` for never.
    pub fn reconnect_after_reset(&self, attempts: Option<u32>) {
        lock(&self.state).reconnect_after_reset = attempts;
    }

    /// Hold the `index`th chunk write (zero-based) until released.
    pub fn pause_before_write(&self, index: usize) -> WritePause {
        let (reached_tx, reached_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel();
        lock(&self.state).gate = Some(WriteGate {
            at_write: index,
            reached: reached_tx,
            release: release_rx,
        });
        WritePause {
            reached: reached_rx,
            release: release_tx,
        }
    }

    // ------------------------------------------------------------------
    // Inspection
    // ------------------------------------------------------------------

    pub fn chunk_log(&self) -> Vec<ChunkRecord> {
        lock(&self.state).chunk_log.clone()
    }

    pub fn commands(&self) -> Vec<DeviceCommand> {
        lock(&self.state).commands.clone()
    }

    pub fn stored_image(&self, slot: u32) -> Option<Vec<u8>> {
        lock(&self.state).images.get(&slot).cloned()
    }

    pub fn open_count(&self) -> u32 {
        lock(&self.state).open_count
    }

    /// Most chunks written but not yet acknowledged at any one time.
    pub fn peak_outstanding(&self) -> usize {
        lock(&self.state).peak_outstanding
    }
}

/// [`Transport`] backed by a [`SimulatedPeripheral`].
#[derive(Clone)]
pub struct SimulatedTransport {
    state: Arc<Mutex<DeviceState>>,
}

impl Transport for SimulatedTransport {
    fn open(&self, handle: &PeripheralHandle) -> DfuResult<Box<dyn Connection>> {
        let mut state = lock(&self.state);

        let unavailable = |reason: &str| DfuError::LinkUnavailable {
            peripheral: handle.id().to_string(),
            reason: reason.to_string(),
        };

        if state.unreachable {
            return Err(unavailable("peripheral out of range"));
        }
        if state.rebooting {
            let attempt = state.attempts_since_reset;
            state.attempts_since_reset += 1;
            let back = matches!(state.reconnect_after_reset, Some(needed) if attempt >= needed);
            if !back {
                return Err(unavailable("peripheral is rebooting"));
            }
            state.rebooting = false;
        }

        state.open_count += 1;
        state.outstanding = 0;
        handle.set_state(ConnectionState::Connected);

        Ok(Box::new(SimulatedConnection {
            state: Arc::clone(&self.state),
            handle: handle.clone(),
            pending: VecDeque::new(),
            open: true,
        }))
    }
}

struct SimulatedConnection {
    state: Arc<Mutex<DeviceState>>,
    handle: PeripheralHandle,
    pending: VecDeque<PendingAck>,
    open: bool,
}

impl SimulatedConnection {
    fn check_open(&self, operation: &str) -> DfuResult<()> {
        if self.open {
            Ok(())
        } else {
            Err(DfuError::link_lost(operation))
        }
    }

    fn drop_link(&mut self, state: &mut DeviceState) {
        self.open = false;
        self.pending.clear();
        state.outstanding = 0;
        self.handle.set_state(ConnectionState::Lost);
    }

    /// Block on the write gate if this write is the paused one.
    fn pass_gate(&self) {
        let gate = {
            let mut state = lock(&self.state);
            let index = state.chunk_log.len();
            let hit = matches!(&state.gate, Some(gate) if gate.at_write == index);
            if hit {
                state.gate.take()
            } else {
                None
            }
        };
        if let Some(gate) = gate {
            gate.reached.send(()).ok();
            gate.release.recv_timeout(Duration::from_secs(10)).ok();
        }
    }
}

impl Connection for SimulatedConnection {
    fn write_chunk(&mut self, chunk: &Chunk<'_>) -> DfuResult<()> {
        let operation = format!("chunk at offset {}", chunk.offset);
        self.check_open(&operation)?;
        self.pass_gate();

        let state_arc = Arc::clone(&self.state);
        let mut state = lock(&state_arc);
        state.chunk_log.push(ChunkRecord {
            slot: chunk.slot,
            offset: chunk.offset,
            len: chunk.data.len(),
        });

        let fault = match state.chunk_faults.get_mut(&chunk.offset) {
            Some((fault, remaining)) if *remaining > 0 => {
                *remaining -= 1;
                Some(*fault)
            }
            _ => None,
        };
        if fault == Some(ChunkFault::LinkLost) {
            self.drop_link(&mut state);
            return Err(DfuError::link_lost(operation));
        }

        let corrupt = state.corrupt_writes;
        let image = state.images.entry(chunk.slot).or_default();
        let end = chunk.offset as usize + chunk.data.len();
        if image.len() < end {
            image.resize(end, 0);
        }
        image[chunk.offset as usize..end].copy_from_slice(chunk.data);
        if corrupt {
            image[chunk.offset as usize] ^= 0x01;
        }

        if fault == Some(ChunkFault::DropAck) {
            return Ok(());
        }

        let reply = match state.chunk_rejects.get(&chunk.offset) {
            Some(&rc) => PendingAck::Rejected {
                offset: chunk.offset,
                rc,
            },
            None => PendingAck::Ack(ChunkAck {
                slot: chunk.slot,
                offset: chunk.offset,
            }),
        };
        self.pending.push_back(reply);
        state.outstanding += 1;
        state.peak_outstanding = state.peak_outstanding.max(state.outstanding);
        Ok(())
    }

    fn wait_ack(&mut self, _timeout: Duration) -> DfuResult<ChunkAck> {
        self.check_open("chunk acknowledgement")?;

        let mut state = lock(&self.state);
        let reply = if state.reorder_acks {
            self.pending.pop_back()
        } else {
            self.pending.pop_front()
        };

        match reply {
            Some(PendingAck::Ack(ack)) => {
                state.outstanding = state.outstanding.saturating_sub(1);
                Ok(ack)
            }
            Some(PendingAck::Rejected { offset, rc }) => {
                state.outstanding = state.outstanding.saturating_sub(1);
                Err(DfuError::DeviceRejected {
                    operation: format!("chunk at offset {}", offset),
                    rc,
                })
            }
            None => Err(DfuError::timeout("chunk acknowledgement")),
        }
    }

    fn request(&mut self, command: &DeviceCommand, _timeout: Duration) -> DfuResult<()> {
        self.check_open(command.name())?;

        let state_arc = Arc::clone(&self.state);
        let mut state = lock(&state_arc);
        state.commands.push(command.clone());

        if let Some(&rc) = state.command_rejects.get(command.name()) {
            return Err(DfuError::DeviceRejected {
                operation: command.name().to_string(),
                rc,
            });
        }

        match command {
            DeviceCommand::TestImage { hash } | DeviceCommand::ConfirmImage { hash } => {
                let known = state.images.values().any(|image| ImageHash::of(image) == *hash);
                if !known {
                    return Err(DfuError::DeviceRejected {
                        operation: command.name().to_string(),
                        rc: RC_BAD_IMAGE,
                    });
                }
            }
            DeviceCommand::EraseAppSettings => {}
            DeviceCommand::Reset => {
                state.rebooting = true;
                state.attempts_since_reset = 0;
                self.open = false;
                self.pending.clear();
                state.outstanding = 0;
                self.handle.set_state(ConnectionState::Disconnected);
            }
        }
        Ok(())
    }

    fn close(&mut self) {
        if self.open {
            self.open = false;
            self.pending.clear();
            lock(&self.state).outstanding = 0;
            if self.handle.state() == ConnectionState::Connected {
                self.handle.set_state(ConnectionState::Disconnected);
            }
        }
    }
}
