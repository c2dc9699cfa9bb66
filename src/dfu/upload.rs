//! Upload engine: streams one image slot over a connection.
//!
//! Chunks are dispatched in offset order through a sliding window of at most
//! `pipeline_depth` in-flight chunks. Acks echo their offset, so they may
//! arrive in any order. A Timeout or LinkLost fails every chunk in flight;
//! they are resent from the lowest unacknowledged offset, and the chunk that
//! hit the failure is charged one retry.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard};

use chrono::{DateTime, Utc};

use super::config::UpgradeConfiguration;
use super::error::{DfuError, DfuResult};
use super::package::ImageSlot;
use super::transport::{Chunk, Connection, PeripheralHandle, Transport};

/// Per-image transfer bookkeeping.
///
/// `bytes_acknowledged + in_flight_bytes() <= total_length` and
/// `in_flight_count() <= window_depth` hold at all times.
#[derive(Debug, Clone)]
pub struct UploadSession {
    slot_index: u32,
    total_length: u32,
    chunk_size: u32,
    window_depth: usize,
    bytes_acknowledged: u64,
    /// offset -> length
    in_flight: BTreeMap<u32, u32>,
    /// Offsets that failed and must be sent again before new data.
    resend: BTreeSet<u32>,
    next_offset: u32,
    retries: HashMap<u32, u8>,
    peak_in_flight: usize,
}

impl UploadSession {
    pub fn new(slot_index: u32, total_length: u32, chunk_size: u32, window_depth: usize) -> Self {
        Self {
            slot_index,
            total_length,
            chunk_size: chunk_size.max(1),
            window_depth: window_depth.max(1),
            bytes_acknowledged: 0,
            in_flight: BTreeMap::new(),
            resend: BTreeSet::new(),
            next_offset: 0,
            retries: HashMap::new(),
            peak_in_flight: 0,
        }
    }

    pub fn slot_index(&self) -> u32 {
        self.slot_index
    }

    pub fn total_length(&self) -> u64 {
        self.total_length as u64
    }

    pub fn bytes_acknowledged(&self) -> u64 {
        self.bytes_acknowledged
    }

    pub fn window_depth(&self) -> usize {
        self.window_depth
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    pub fn in_flight_bytes(&self) -> u64 {
        self.in_flight.values().map(|&len| len as u64).sum()
    }

    /// Highest number of chunks that were ever in flight at once.
    pub fn peak_in_flight(&self) -> usize {
        self.peak_in_flight
    }

    pub fn is_complete(&self) -> bool {
        self.bytes_acknowledged == self.total_length as u64
    }

    fn window_open(&self) -> bool {
        self.in_flight.len() < self.window_depth
    }

    /// Next chunk to dispatch: failed chunks first, then fresh data.
    fn peek_next(&self) -> Option<(u32, u32)> {
        if let Some(&offset) = self.resend.iter().next() {
            return Some((offset, self.chunk_len(offset)));
        }
        if self.next_offset < self.total_length {
            return Some((self.next_offset, self.chunk_len(self.next_offset)));
        }
        None
    }

    fn chunk_len(&self, offset: u32) -> u32 {
        self.chunk_size.min(self.total_length - offset)
    }

    fn mark_sent(&mut self, offset: u32, len: u32) {
        if !self.resend.remove(&offset) {
            self.next_offset = offset + len;
        }
        self.in_flight.insert(offset, len);
        self.peak_in_flight = self.peak_in_flight.max(self.in_flight.len());
    }

    /// Record an ack. Returns `false` for offsets that are not in flight.
    fn acknowledge(&mut self, offset: u32) -> bool {
        match self.in_flight.remove(&offset) {
            Some(len) => {
                self.bytes_acknowledged += len as u64;
                true
            }
            None => false,
        }
    }

    fn oldest_in_flight(&self) -> Option<u32> {
        self.in_flight.keys().next().copied()
    }

    /// Fail every chunk in flight (plus `failed`) back into the resend queue.
    fn requeue(&mut self, failed: u32) {
        let in_flight = std::mem::take(&mut self.in_flight);
        self.resend.extend(in_flight.into_keys());
        if failed < self.next_offset {
            self.resend.insert(failed);
        }
    }

    /// Charge one retry against `offset`. Returns `false` once over budget.
    fn charge_retry(&mut self, offset: u32, max_retries: u8) -> bool {
        let attempts = self.retries.entry(offset).or_insert(0);
        *attempts = attempts.saturating_add(1);
        *attempts <= max_retries
    }
}

/// Lock a mutex, recovering the data if a holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Drives the chunk stream for one upgrade run.
pub struct UploadEngine<'a> {
    transport: &'a dyn Transport,
    handle: &'a PeripheralHandle,
    config: &'a UpgradeConfiguration,
    cancel: &'a AtomicBool,
}

impl<'a> UploadEngine<'a> {
    pub fn new(
        transport: &'a dyn Transport,
        handle: &'a PeripheralHandle,
        config: &'a UpgradeConfiguration,
        cancel: &'a AtomicBool,
    ) -> Self {
        Self {
            transport,
            handle,
            config,
            cancel,
        }
    }

    /// Upload `slot` through `conn`, calling `on_progress` after every ack.
    ///
    /// `session` must be fresh for this slot. The connection may be replaced
    /// if the link drops and a retry reopens it.
    pub fn upload<F>(
        &self,
        conn: &mut Box<dyn Connection>,
        slot: &ImageSlot,
        session: &Mutex<UploadSession>,
        mut on_progress: F,
    ) -> DfuResult<()>
    where
        F: FnMut(u64, u64, DateTime<Utc>),
    {
        let data = slot.image_bytes();
        let total_len = u32::try_from(data.len()).map_err(|_| {
            DfuError::invalid_format(format!("image {} exceeds 4 GiB", slot.slot_index()))
        })?;

        loop {
            // Fill the window.
            loop {
                let next = {
                    let session = lock(session);
                    if !session.window_open() {
                        None
                    } else {
                        session.peek_next()
                    }
                };
                let Some((offset, len)) = next else { break };

                if self.cancel.load(Ordering::SeqCst) {
                    return Err(DfuError::Cancelled);
                }

                let operation = format!("chunk at offset {}", offset);
                let sent = self.handle.ensure_linked(&operation).and_then(|()| {
                    conn.write_chunk(&Chunk {
                        slot: slot.slot_index(),
                        offset,
                        total_len,
                        data: &data[offset as usize..(offset + len) as usize],
                    })
                });

                match sent {
                    Ok(()) => lock(session).mark_sent(offset, len),
                    Err(e) if e.is_retriable() => self.recover(conn, session, offset, e)?,
                    Err(e) => return Err(e),
                }
            }

            let oldest = {
                let session = lock(session);
                if session.is_complete() {
                    return Ok(());
                }
                session.oldest_in_flight()
            };
            let Some(oldest) = oldest else { continue };

            match conn.wait_ack(self.config.ack_timeout) {
                Ok(ack) => {
                    let progress = {
                        let mut session = lock(session);
                        let accepted =
                            ack.slot == slot.slot_index() && session.acknowledge(ack.offset);
                        accepted.then(|| (session.bytes_acknowledged(), session.total_length()))
                    };
                    match progress {
                        Some((acked, total)) => on_progress(acked, total, Utc::now()),
                        None => log::debug!(
                            "Ignoring ack for {}@{} (not in flight)",
                            ack.slot,
                            ack.offset
                        ),
                    }
                }
                Err(e) if e.is_retriable() => self.recover(conn, session, oldest, e)?,
                Err(e) => return Err(e),
            }
        }
    }

    /// Requeue in-flight chunks after a link failure and reopen the link if
    /// the transport reported it gone. Fails with `error` once the chunk at
    /// `failed_offset` has used up its retries.
    fn recover(
        &self,
        conn: &mut Box<dyn Connection>,
        session: &Mutex<UploadSession>,
        failed_offset: u32,
        error: DfuError,
    ) -> DfuResult<()> {
        {
            let mut session = lock(session);
            session.requeue(failed_offset);
            if !session.charge_retry(failed_offset, self.config.max_chunk_retries) {
                return Err(error);
            }
        }
        log::debug!("Retrying from chunk at offset {} after: {}", failed_offset, error);

        if self.handle.ensure_linked("retry").is_err() {
            conn.close();
            *conn = self.transport.open(self.handle).map_err(|open_err| {
                log::debug!("Reopen for retry failed: {}", open_err);
                error
            })?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dfu::sim::{ChunkFault, SimulatedPeripheral};
    use std::time::Duration;

    fn image(len: usize) -> ImageSlot {
        let bytes: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
        ImageSlot::from_bytes(0, bytes).unwrap()
    }

    fn config(depth: usize) -> UpgradeConfiguration {
        UpgradeConfiguration {
            pipeline_depth: depth,
            chunk_size: 512,
            ack_timeout: Duration::from_millis(50),
            ..Default::default()
        }
    }

    struct Run {
        result: DfuResult<()>,
        progress: Vec<(u64, u64)>,
        session: UploadSession,
    }

    fn run(sim: &SimulatedPeripheral, slot: &ImageSlot, config: &UpgradeConfiguration) -> Run {
        let transport = sim.transport();
        let handle = PeripheralHandle::new("sim");
        let cancel = AtomicBool::new(false);
        let mut conn = transport.open(&handle).unwrap();
        let session = Mutex::new(UploadSession::new(
            slot.slot_index(),
            slot.len() as u32,
            config.chunk_size as u32,
            config.pipeline_depth,
        ));

        let engine = UploadEngine::new(&transport, &handle, config, &cancel);
        let mut progress = Vec::new();
        let result = engine.upload(&mut conn, slot, &session, |acked, total, _| {
            progress.push((acked, total))
        });

        let session = session.into_inner().unwrap();
        Run {
            result,
            progress,
            session,
        }
    }

    #[test]
    fn test_session_chunking_with_short_tail() {
        let mut session = UploadSession::new(0, 1300, 512, 4);
        let mut chunks = Vec::new();
        while let Some((offset, len)) = session.peek_next() {
            session.mark_sent(offset, len);
            chunks.push((offset, len));
        }
        assert_eq!(chunks, vec![(0, 512), (512, 512), (1024, 276)]);
        assert_eq!(session.in_flight_bytes(), 1300);
    }

    #[test]
    fn test_session_ignores_unknown_ack() {
        let mut session = UploadSession::new(0, 1024, 512, 2);
        session.mark_sent(0, 512);

        assert!(!session.acknowledge(512));
        assert!(session.acknowledge(0));
        assert!(!session.acknowledge(0));
        assert_eq!(session.bytes_acknowledged(), 512);
    }

    #[test]
    fn test_session_requeue_resends_lowest_first() {
        let mut session = UploadSession::new(0, 2048, 512, 3);
        for _ in 0..3 {
            let (offset, len) = session.peek_next().unwrap();
            session.mark_sent(offset, len);
        }
        session.acknowledge(0);

        session.requeue(512);
        assert_eq!(session.in_flight_count(), 0);
        assert_eq!(session.peek_next(), Some((512, 512)));
        session.mark_sent(512, 512);
        assert_eq!(session.peek_next(), Some((1024, 512)));
        session.mark_sent(1024, 512);
        assert_eq!(session.peek_next(), Some((1536, 512)));
    }

    #[test]
    fn test_session_retry_budget() {
        let mut session = UploadSession::new(0, 512, 512, 1);
        assert!(session.charge_retry(0, 1));
        assert!(!session.charge_retry(0, 1));
    }

    #[test]
    fn test_upload_40k_depth_2() {
        let sim = SimulatedPeripheral::new();
        let slot = image(40_960);

        let run = run(&sim, &slot, &config(2));

        assert!(run.result.is_ok());
        assert_eq!(run.progress.len(), 80);
        assert_eq!(run.progress.last(), Some(&(40_960, 40_960)));
        assert!(run.session.is_complete());
        assert_eq!(sim.stored_image(0).unwrap(), slot.image_bytes());

        let log = sim.chunk_log();
        assert_eq!(log.len(), 80);
        assert!(log.iter().all(|c| c.len == 512));
    }

    #[test]
    fn test_upload_short_last_chunk() {
        let sim = SimulatedPeripheral::new();
        let slot = image(79 * 512 + 32);

        let run = run(&sim, &slot, &config(2));

        assert!(run.result.is_ok());
        let log = sim.chunk_log();
        assert_eq!(log.len(), 80);
        assert_eq!(log.last().map(|c| c.len), Some(32));
        assert_eq!(run.progress.last(), Some(&(40_480, 40_480)));
    }

    #[test]
    fn test_progress_is_monotonic_with_reordered_acks() {
        let sim = SimulatedPeripheral::new();
        sim.reorder_acks(true);
        let slot = image(10_000);

        let run = run(&sim, &slot, &config(4));

        assert!(run.result.is_ok());
        assert!(run.progress.windows(2).all(|w| w[0].0 <= w[1].0));
        assert_eq!(run.progress.last().map(|p| p.0), Some(10_000));
        assert_eq!(sim.stored_image(0).unwrap(), slot.image_bytes());
    }

    #[test]
    fn test_window_never_exceeds_depth() {
        for depth in [1, 2, 5] {
            let sim = SimulatedPeripheral::new();
            sim.reorder_acks(true);
            let run = run(&sim, &image(8192), &config(depth));

            assert!(run.result.is_ok());
            assert!(run.session.peak_in_flight() <= depth);
            assert!(sim.peak_outstanding() <= depth);
        }
    }

    #[test]
    fn test_link_lost_once_is_retried() {
        let sim = SimulatedPeripheral::new();
        sim.fail_chunk(10 * 512, ChunkFault::LinkLost, 1);
        let slot = image(40_960);

        let run = run(&sim, &slot, &config(1));

        assert!(run.result.is_ok());
        let attempts = sim.chunk_log().iter().filter(|c| c.offset == 5120).count();
        assert_eq!(attempts, 2);
        assert_eq!(sim.open_count(), 2);
        assert_eq!(sim.stored_image(0).unwrap(), slot.image_bytes());
    }

    #[test]
    fn test_link_lost_twice_fails_without_later_chunks() {
        let sim = SimulatedPeripheral::new();
        sim.fail_chunk(10 * 512, ChunkFault::LinkLost, 2);

        let run = run(&sim, &image(40_960), &config(1));

        assert!(matches!(run.result, Err(DfuError::LinkLost { .. })));
        let log = sim.chunk_log();
        assert_eq!(log.iter().filter(|c| c.offset == 5120).count(), 2);
        assert!(log.iter().all(|c| c.offset <= 5120));
        assert_eq!(run.progress.last().map(|p| p.0), Some(5120));
    }

    #[test]
    fn test_ack_timeout_retries_whole_window() {
        let sim = SimulatedPeripheral::new();
        sim.fail_chunk(2048, ChunkFault::DropAck, 1);
        let slot = image(8192);

        let run = run(&sim, &slot, &config(3));

        assert!(run.result.is_ok());
        assert_eq!(run.progress.last().map(|p| p.0), Some(8192));
        assert_eq!(sim.stored_image(0).unwrap(), slot.image_bytes());
    }

    #[test]
    fn test_device_rejection_is_not_retried() {
        let sim = SimulatedPeripheral::new();
        sim.reject_chunk(1024, 0x05);

        let run = run(&sim, &image(4096), &config(1));

        assert!(matches!(
            run.result,
            Err(DfuError::DeviceRejected { rc: 0x05, .. })
        ));
        assert_eq!(sim.chunk_log().iter().filter(|c| c.offset == 1024).count(), 1);
    }

    #[test]
    fn test_cancel_before_first_chunk() {
        let sim = SimulatedPeripheral::new();
        let transport = sim.transport();
        let handle = PeripheralHandle::new("sim");
        let cancel = AtomicBool::new(true);
        let config = config(1);
        let slot = image(1024);
        let mut conn = transport.open(&handle).unwrap();
        let session = Mutex::new(UploadSession::new(0, 1024, 512, 1));

        let engine = UploadEngine::new(&transport, &handle, &config, &cancel);
        let result = engine.upload(&mut conn, &slot, &session, |_, _, _| {});

        assert!(matches!(result, Err(DfuError::Cancelled)));
        assert!(sim.chunk_log().is_empty());
    }
}
