//! Serial byte-link transport for DFU communication.
//!
//! Talks the framed protocol from [`super::frame`] over a serial port, which
//! is how a USB BLE bridge dongle exposes a peripheral to the host. The byte
//! link is behind the [`Link`] trait so the framing can be tested with a mock.

use std::collections::{HashMap, VecDeque};
use std::io::{Read, Write};
use std::time::{Duration, Instant};

#[cfg(test)]
use mockall::automock;

use serialport::SerialPort;

use super::config::{DFU_BAUD_RATE, MAX_OPEN_RETRIES, OPEN_RETRY_DELAY, SERIAL_READ_TIMEOUT};
use super::error::{DfuError, DfuResult};
use super::frame::{build_chunk_body, ChunkAckBody, Frame, Opcode, MAX_FRAME_SIZE, STATUS_OK};
use super::slip::SlipDecoder;
use super::transport::{
    Chunk, ChunkAck, Connection, ConnectionState, DeviceCommand, PeripheralHandle, Transport,
};

/// Raw byte link underneath a framed connection.
#[cfg_attr(test, automock)]
pub trait Link: Send {
    /// Write all of `data` to the link.
    fn write(&mut self, data: &[u8]) -> DfuResult<()>;

    /// Read into `buffer`, returning 0 if nothing arrived within `timeout`.
    fn read(&mut self, buffer: &mut [u8], timeout: Duration) -> DfuResult<usize>;

    /// Clear any pending input data from the receive buffer.
    fn clear_input(&mut self) -> DfuResult<()>;

    /// Check if the link still looks usable.
    fn is_healthy(&mut self) -> bool;
}

/// Serial port link implementation.
pub struct SerialLink {
    port: Box<dyn SerialPort>,
}

impl SerialLink {
    /// Open a serial port at the standard DFU baud rate (115200 8N1).
    pub fn open(port_name: &str) -> DfuResult<Self> {
        Self::open_with_baud(port_name, DFU_BAUD_RATE)
    }

    /// Open a serial port with a specific baud rate.
    ///
    /// Transient failures seen while a USB bridge re-enumerates are retried.
    pub fn open_with_baud(port_name: &str, baud_rate: u32) -> DfuResult<Self> {
        let normalized_name = normalize_port_name(port_name);
        let mut last_error: Option<serialport::Error> = None;

        for attempt in 0..MAX_OPEN_RETRIES {
            match serialport::new(&normalized_name, baud_rate)
                .timeout(SERIAL_READ_TIMEOUT)
                .data_bits(serialport::DataBits::Eight)
                .parity(serialport::Parity::None)
                .stop_bits(serialport::StopBits::One)
                .flow_control(serialport::FlowControl::None)
                .open()
            {
                Ok(port) => {
                    port.clear(serialport::ClearBuffer::Input).ok();
                    return Ok(Self { port });
                }
                Err(e) => {
                    let err_str = e.to_string().to_lowercase();
                    let is_transient = err_str.contains("not functioning")
                        || err_str.contains("temporarily unavailable")
                        || err_str.contains("interrupted");

                    if is_transient && attempt < MAX_OPEN_RETRIES - 1 {
                        std::thread::sleep(OPEN_RETRY_DELAY);
                        last_error = Some(e);
                        continue;
                    }

                    return Err(open_error(port_name, e));
                }
            }
        }

        Err(match last_error {
            Some(e) => open_error(port_name, e),
            None => DfuError::LinkUnavailable {
                peripheral: port_name.to_string(),
                reason: "no open attempts made".to_string(),
            },
        })
    }
}

fn open_error(port_name: &str, e: serialport::Error) -> DfuError {
    let err_str = e.to_string().to_lowercase();
    let reason = match e.kind() {
        serialport::ErrorKind::Io(std::io::ErrorKind::PermissionDenied) => {
            "permission denied".to_string()
        }
        serialport::ErrorKind::Io(std::io::ErrorKind::NotFound)
        | serialport::ErrorKind::NoDevice => "device not found".to_string(),
        _ if err_str.contains("busy") || err_str.contains("in use") => {
            "port is in use by another application".to_string()
        }
        _ => e.to_string(),
    };
    DfuError::LinkUnavailable {
        peripheral: port_name.to_string(),
        reason,
    }
}

impl Link for SerialLink {
    fn write(&mut self, data: &[u8]) -> DfuResult<()> {
        self.port.write_all(data).map_err(DfuError::Io)
    }

    fn read(&mut self, buffer: &mut [u8], timeout: Duration) -> DfuResult<usize> {
        self.port.set_timeout(timeout).map_err(DfuError::Serial)?;

        match self.port.read(buffer) {
            Ok(n) => Ok(n),
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => Ok(0),
            Err(e) => Err(DfuError::Io(e)),
        }
    }

    fn clear_input(&mut self) -> DfuResult<()> {
        self.port
            .clear(serialport::ClearBuffer::Input)
            .map_err(DfuError::Serial)
    }

    fn is_healthy(&mut self) -> bool {
        self.port.baud_rate().is_ok()
    }
}

/// Normalize a port name for cross-platform compatibility.
fn normalize_port_name(name: &str) -> String {
    #[cfg(target_os = "macos")]
    {
        // Prefer cu. over tty. for better compatibility
        if name.starts_with("/dev/tty.") {
            return name.replace("/dev/tty.", "/dev/cu.");
        }
    }

    #[cfg(target_os = "windows")]
    {
        // COM ports > 9 need \\.\\ prefix
        if name.starts_with("COM") {
            if let Ok(n) = name[3..].parse::<u32>() {
                if n > 9 {
                    return format!("\\\\.\\{}", name);
                }
            }
        }
    }

    name.to_string()
}

// ============================================================================
// Framed Connection
// ============================================================================

/// Request/response channel speaking DFU frames over a [`Link`].
///
/// Sequence numbers are per connection. Chunk acks are matched by the offset
/// they echo, so the device may answer them in any order.
pub struct FramedConnection<L: Link> {
    link: Option<L>,
    handle: PeripheralHandle,
    decoder: SlipDecoder,
    inbox: VecDeque<Frame>,
    next_seq: u8,
    /// seq -> offset for chunks written but not yet acknowledged.
    pending_chunks: HashMap<u8, u32>,
}

impl<L: Link> FramedConnection<L> {
    pub fn new(link: L, handle: PeripheralHandle) -> Self {
        Self {
            link: Some(link),
            handle,
            decoder: SlipDecoder::new(MAX_FRAME_SIZE),
            inbox: VecDeque::new(),
            next_seq: 0,
            pending_chunks: HashMap::new(),
        }
    }

    fn take_seq(&mut self) -> u8 {
        let seq = self.next_seq;
        self.next_seq = self.next_seq.wrapping_add(1);
        seq
    }

    /// Mark the link lost and build the matching error.
    fn lose_link(&mut self, operation: &str) -> DfuError {
        self.handle.set_state(ConnectionState::Lost);
        self.link = None;
        DfuError::link_lost(operation)
    }

    fn send_frame(&mut self, frame: &Frame, operation: &str) -> DfuResult<()> {
        self.handle.ensure_linked(operation)?;
        let link = self
            .link
            .as_mut()
            .ok_or_else(|| DfuError::link_lost(operation))?;

        if !link.is_healthy() {
            return Err(self.lose_link(operation));
        }
        match link.write(&frame.encode()) {
            Ok(()) => Ok(()),
            Err(DfuError::Io(_)) | Err(DfuError::Serial(_)) => Err(self.lose_link(operation)),
            Err(e) => Err(e),
        }
    }

    /// Read the next complete frame, waiting until `deadline`.
    ///
    /// Frames that fail SLIP or CRC checks are dropped, so a mangled reply
    /// surfaces as a timeout.
    fn next_frame(&mut self, deadline: Instant, operation: &str) -> DfuResult<Frame> {
        let mut buffer = [0u8; 512];

        loop {
            if let Some(frame) = self.inbox.pop_front() {
                return Ok(frame);
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(DfuError::timeout(operation));
            }

            self.handle.ensure_linked(operation)?;
            let link = self
                .link
                .as_mut()
                .ok_or_else(|| DfuError::link_lost(operation))?;

            let bytes_read = match link.read(&mut buffer, remaining) {
                Ok(n) => n,
                Err(DfuError::Io(_)) | Err(DfuError::Serial(_)) => {
                    return Err(self.lose_link(operation))
                }
                Err(e) => return Err(e),
            };

            for &byte in &buffer[..bytes_read] {
                let Some(result) = self.decoder.feed(byte) else {
                    continue;
                };
                match result.and_then(|data| Frame::decode(&data)) {
                    Ok(frame) => self.inbox.push_back(frame),
                    Err(e) => {
                        log::debug!("Dropping undecodable frame during {}: {}", operation, e)
                    }
                }
            }
        }
    }
}

impl<L: Link> Connection for FramedConnection<L> {
    fn write_chunk(&mut self, chunk: &Chunk<'_>) -> DfuResult<()> {
        let slot = u8::try_from(chunk.slot).map_err(|_| {
            DfuError::invalid_format(format!("image slot {} does not fit the link", chunk.slot))
        })?;

        let seq = self.take_seq();
        let body = build_chunk_body(slot, chunk.offset, chunk.total_len, chunk.data);
        let frame = Frame::request(Opcode::WriteChunk, seq, body);

        let operation = format!("chunk at offset {}", chunk.offset);
        self.send_frame(&frame, &operation)?;
        self.pending_chunks.insert(seq, chunk.offset);
        Ok(())
    }

    fn wait_ack(&mut self, timeout: Duration) -> DfuResult<ChunkAck> {
        let deadline = Instant::now() + timeout;

        loop {
            let frame = self.next_frame(deadline, "chunk acknowledgement")?;
            if frame.opcode != Opcode::WriteChunk || !frame.is_response {
                log::debug!("Skipping stray {:?} frame (seq {})", frame.opcode, frame.seq);
                continue;
            }

            let offset = self.pending_chunks.remove(&frame.seq);
            if frame.status != STATUS_OK {
                return Err(DfuError::DeviceRejected {
                    operation: match offset {
                        Some(offset) => format!("chunk at offset {}", offset),
                        None => "chunk".to_string(),
                    },
                    rc: frame.status,
                });
            }

            let ack = ChunkAckBody::parse(&frame.body)?;
            return Ok(ChunkAck {
                slot: ack.slot as u32,
                offset: ack.offset,
            });
        }
    }

    fn request(&mut self, command: &DeviceCommand, timeout: Duration) -> DfuResult<()> {
        let (opcode, body) = match command {
            DeviceCommand::TestImage { hash } => (Opcode::TestImage, hash.as_bytes().to_vec()),
            DeviceCommand::ConfirmImage { hash } => {
                (Opcode::ConfirmImage, hash.as_bytes().to_vec())
            }
            DeviceCommand::EraseAppSettings => (Opcode::EraseAppSettings, Vec::new()),
            DeviceCommand::Reset => (Opcode::Reset, Vec::new()),
        };

        let seq = self.take_seq();
        self.send_frame(&Frame::request(opcode, seq, body), command.name())?;

        let deadline = Instant::now() + timeout;
        loop {
            let frame = self.next_frame(deadline, command.name())?;
            if frame.opcode != opcode || !frame.is_response || frame.seq != seq {
                log::debug!("Skipping stray {:?} frame (seq {})", frame.opcode, frame.seq);
                continue;
            }
            if frame.status != STATUS_OK {
                return Err(DfuError::DeviceRejected {
                    operation: command.name().to_string(),
                    rc: frame.status,
                });
            }
            return Ok(());
        }
    }

    fn close(&mut self) {
        if self.link.take().is_some() && self.handle.state() != ConnectionState::Lost {
            self.handle.set_state(ConnectionState::Disconnected);
        }
        self.pending_chunks.clear();
        self.inbox.clear();
        self.decoder.reset();
    }
}

/// Transport opening framed connections over serial ports.
///
/// The peripheral id is the port name of the bridge.
#[derive(Debug, Default, Clone)]
pub struct SerialTransport;

impl SerialTransport {
    pub fn new() -> Self {
        Self
    }
}

impl Transport for SerialTransport {
    fn open(&self, handle: &PeripheralHandle) -> DfuResult<Box<dyn Connection>> {
        handle.set_state(ConnectionState::Connecting);

        let mut link = match SerialLink::open(handle.id()) {
            Ok(link) => link,
            Err(e) => {
                handle.set_state(ConnectionState::Disconnected);
                return Err(e);
            }
        };
        link.clear_input().ok();

        handle.set_state(ConnectionState::Connected);
        Ok(Box::new(FramedConnection::new(link, handle.clone())))
    }
}
