//! Upgrade sessions and the per-peripheral registry.
//!
//! [`UpgradeManager::start`] runs the state machine on a background thread
//! and returns an [`UpgradeSession`]. Events travel over a channel and are
//! dispatched to an [`UpgradeObserver`] on whichever thread pumps the
//! session, so presentation code never runs on the worker.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use chrono::{DateTime, Utc};

use super::config::UpgradeConfiguration;
use super::error::{DfuError, DfuResult, ErrorKind, FailureReason};
use super::package::ImagePackage;
use super::transport::{PeripheralHandle, Transport};
use super::upgrade::{UpgradeEvent, UpgradeOutcome, UpgradeRun, UpgradeState};
use super::upload::lock;

/// Receives upgrade callbacks. Every method has an empty default.
pub trait UpgradeObserver {
    fn on_state_change(&mut self, _previous: &UpgradeState, _new: &UpgradeState) {}

    fn on_progress(&mut self, _bytes_acknowledged: u64, _total: u64, _timestamp: DateTime<Utc>) {}

    fn on_terminal(&mut self, _outcome: &UpgradeOutcome) {}
}

/// Cloneable cancellation flag for a running session.
#[derive(Debug, Clone)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    /// Request cancellation; honored at the next chunk or state boundary.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Releases a peripheral's registry entry when dropped.
struct ActiveGuard {
    active: Arc<Mutex<HashMap<String, CancelToken>>>,
    peripheral: String,
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        lock(&self.active).remove(&self.peripheral);
    }
}

/// Starts upgrades and allows at most one active session per peripheral.
///
/// The registry lives in the manager and is shared by its clones. Separate
/// managers do not see each other's sessions, so an application should own
/// one manager per transport and clone it where needed.
#[derive(Clone)]
pub struct UpgradeManager {
    transport: Arc<dyn Transport>,
    active: Arc<Mutex<HashMap<String, CancelToken>>>,
}

impl UpgradeManager {
    pub fn new(transport: Arc<dyn Transport>) -> Self {
        Self {
            transport,
            active: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Whether a non-terminal session exists for `handle`.
    pub fn is_active(&self, handle: &PeripheralHandle) -> bool {
        lock(&self.active).contains_key(handle.id())
    }

    /// Cancel the active session for `peripheral_id`, if there is one.
    pub fn cancel(&self, peripheral_id: &str) -> bool {
        match lock(&self.active).get(peripheral_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    /// Validate `config` and start an upgrade of `handle` in the background.
    ///
    /// Fails with `InvalidConfiguration` before anything starts, or with
    /// `SessionActive` if `handle` already has a running session.
    pub fn start(
        &self,
        handle: &PeripheralHandle,
        package: ImagePackage,
        config: UpgradeConfiguration,
    ) -> DfuResult<UpgradeSession> {
        config.validate()?;

        let cancel = Arc::new(AtomicBool::new(false));
        let guard = {
            let mut active = lock(&self.active);
            if active.contains_key(handle.id()) {
                return Err(DfuError::SessionActive {
                    peripheral: handle.id().to_string(),
                });
            }
            active.insert(handle.id().to_string(), CancelToken(Arc::clone(&cancel)));
            ActiveGuard {
                active: Arc::clone(&self.active),
                peripheral: handle.id().to_string(),
            }
        };

        let state = Arc::new(Mutex::new(UpgradeState::Idle));
        let run = UpgradeRun {
            transport: Arc::clone(&self.transport),
            handle: handle.clone(),
            package,
            config,
            cancel: Arc::clone(&cancel),
            state: Arc::clone(&state),
        };

        let (tx, rx) = mpsc::channel::<UpgradeEvent>();
        log::info!("Starting upgrade of {}", handle.id());

        let worker = std::thread::Builder::new()
            .name(format!("dfu-{}", handle.id()))
            .spawn(move || {
                let outcome = run.run(|event| {
                    let _ = tx.send(event);
                });
                // Free the peripheral before the terminal event is observable.
                drop(guard);
                log::info!("Upgrade of {} finished: {:?}", run.handle.id(), outcome);
                let _ = tx.send(UpgradeEvent::Terminal(outcome.clone()));
                outcome
            })?;

        Ok(UpgradeSession {
            peripheral: handle.id().to_string(),
            cancel: CancelToken(cancel),
            state,
            events: rx,
            worker: Some(worker),
            outcome: None,
        })
    }
}

/// A running (or finished) upgrade.
pub struct UpgradeSession {
    peripheral: String,
    cancel: CancelToken,
    state: Arc<Mutex<UpgradeState>>,
    events: Receiver<UpgradeEvent>,
    worker: Option<JoinHandle<UpgradeOutcome>>,
    outcome: Option<UpgradeOutcome>,
}

impl UpgradeSession {
    pub fn peripheral(&self) -> &str {
        &self.peripheral
    }

    /// Request cooperative cancellation.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Token that can cancel this session from another thread.
    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Current state as last published by the state machine.
    pub fn state(&self) -> UpgradeState {
        lock(&self.state).clone()
    }

    /// Next event, waiting up to `timeout`. `None` on timeout or after the
    /// terminal event has been consumed.
    pub fn next_event(&self, timeout: Duration) -> Option<UpgradeEvent> {
        match self.events.recv_timeout(timeout) {
            Ok(event) => Some(event),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
        }
    }

    /// Deliver every event queued so far to `observer` without blocking.
    /// Returns the outcome once the terminal event has been delivered.
    pub fn dispatch(&mut self, observer: &mut dyn UpgradeObserver) -> Option<UpgradeOutcome> {
        while let Ok(event) = self.events.try_recv() {
            if let Some(outcome) = deliver(observer, &event) {
                self.outcome = Some(outcome);
            }
        }
        self.outcome.clone()
    }

    /// Blocking iterator over events; ends after the terminal event.
    ///
    /// Events taken here bypass [`UpgradeSession::dispatch`].
    pub fn events(&self) -> mpsc::Iter<'_, UpgradeEvent> {
        self.events.iter()
    }

    /// Block until the session ends, delivering every event to `observer`.
    pub fn wait(mut self, observer: &mut dyn UpgradeObserver) -> UpgradeOutcome {
        while let Ok(event) = self.events.recv() {
            if let Some(outcome) = deliver(observer, &event) {
                self.outcome = Some(outcome);
            }
        }
        self.finish()
    }

    /// Block until the session ends, discarding events.
    pub fn join(self) -> UpgradeOutcome {
        struct Ignore;
        impl UpgradeObserver for Ignore {}
        self.wait(&mut Ignore)
    }

    fn finish(&mut self) -> UpgradeOutcome {
        let joined = self.worker.take().map(|worker| worker.join());
        match (self.outcome.take(), joined) {
            (Some(outcome), _) | (None, Some(Ok(outcome))) => outcome,
            (None, Some(Err(_))) | (None, None) => UpgradeOutcome::Failed(FailureReason {
                kind: ErrorKind::Protocol,
                code: "DFU-000".to_string(),
                message: format!("upgrade worker for {} stopped unexpectedly", self.peripheral),
            }),
        }
    }
}

fn deliver(observer: &mut dyn UpgradeObserver, event: &UpgradeEvent) -> Option<UpgradeOutcome> {
    match event {
        UpgradeEvent::StateChanged { previous, new } => {
            observer.on_state_change(previous, new);
            None
        }
        UpgradeEvent::Progress(report) => {
            observer.on_progress(report.bytes_acknowledged, report.total, report.timestamp);
            None
        }
        UpgradeEvent::Terminal(outcome) => {
            observer.on_terminal(outcome);
            Some(outcome.clone())
        }
    }
}
