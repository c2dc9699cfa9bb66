//! Async commands for DFU (Device Firmware Update) operations.
//!
//! These wrap the blocking upgrade core for an async host. Errors are
//! returned as display strings carrying the support error code.

use serde::Serialize;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedSender;

use crate::dfu::{
    package, ContainerKind, DfuError, PeripheralHandle, UpgradeConfiguration, UpgradeEvent,
    UpgradeManager, UpgradeOutcome, UpgradeState,
};
use crate::traits::FileProvider;

/// Progress event sent to the host during DFU.
#[derive(Debug, Clone, Serialize)]
pub struct DfuProgressEvent {
    /// Current stage name.
    pub stage: String,
    /// Image slot being uploaded (for uploading stage).
    pub slot: Option<u32>,
    /// Bytes acknowledged (for uploading stage).
    pub sent: Option<u64>,
    /// Image length in bytes (for uploading stage).
    pub total: Option<u64>,
    /// Progress percentage (0-100), or -1 on failure.
    pub percent: f32,
    /// Human-readable message.
    pub message: String,
}

impl From<&UpgradeEvent> for DfuProgressEvent {
    fn from(event: &UpgradeEvent) -> Self {
        let (stage_name, slot, sent, total) = match event {
            UpgradeEvent::StateChanged { new, .. } => match new {
                UpgradeState::Idle => ("idle", None, None, None),
                UpgradeState::Validate => ("validating", None, None, None),
                UpgradeState::Upload { slot } => ("uploading", Some(*slot), None, None),
                UpgradeState::Test => ("testing", None, None, None),
                UpgradeState::Confirm => ("confirming", None, None, None),
                UpgradeState::Reset => ("resetting", None, None, None),
                UpgradeState::Success => ("complete", None, None, None),
                UpgradeState::Failed { .. } => ("failed", None, None, None),
                UpgradeState::Cancelled => ("cancelled", None, None, None),
            },
            UpgradeEvent::Progress(report) => (
                "uploading",
                Some(report.slot),
                Some(report.bytes_acknowledged),
                Some(report.total),
            ),
            UpgradeEvent::Terminal(outcome) => match outcome {
                UpgradeOutcome::Success => ("complete", None, None, None),
                UpgradeOutcome::Failed(_) => ("failed", None, None, None),
                UpgradeOutcome::Cancelled => ("cancelled", None, None, None),
            },
        };

        Self {
            stage: stage_name.to_string(),
            slot,
            sent,
            total,
            percent: event.percent(),
            message: event.message(),
        }
    }
}

/// Information about a firmware package.
#[derive(Debug, Clone, Serialize)]
pub struct FirmwareInfo {
    /// Container the package was read from.
    pub container: ContainerKind,
    /// Package name from the manifest, if any.
    pub name: Option<String>,
    /// Images in upload order.
    pub images: Vec<FirmwareImageInfo>,
    /// Sum of all image sizes in bytes.
    pub total_size: usize,
}

/// One image of a firmware package.
#[derive(Debug, Clone, Serialize)]
pub struct FirmwareImageInfo {
    pub slot: u32,
    pub size: usize,
    /// Hex SHA-256 digest.
    pub sha256: String,
    pub version: Option<String>,
}

fn error_string(error: &DfuError) -> String {
    format!("{} [{}]", error, error.error_code())
}

/// Validate that a firmware package is well formed and its digests match.
pub async fn validate_firmware_package(
    provider: Arc<dyn FileProvider>,
    firmware_path: String,
) -> Result<FirmwareInfo, String> {
    tokio::task::spawn_blocking(move || {
        let raw = provider
            .read(Path::new(&firmware_path))
            .map_err(|e| error_string(&e))?;
        let package = package::parse(&raw).map_err(|e| error_string(&e))?;

        Ok(FirmwareInfo {
            container: package.kind(),
            name: package.name().map(str::to_string),
            images: package
                .slots()
                .iter()
                .map(|slot| FirmwareImageInfo {
                    slot: slot.slot_index(),
                    size: slot.len(),
                    sha256: slot.expected_hash().to_hex(),
                    version: slot.version().map(str::to_string),
                })
                .collect(),
            total_size: package.total_len(),
        })
    })
    .await
    .map_err(|e| format!("Validation failed: {}", e))?
}

/// Flash a firmware package to a peripheral.
///
/// # Arguments
/// * `manager` - Registry that owns the peripheral's session
/// * `handle` - Peripheral to upgrade
/// * `firmware` - Raw package bytes (zip or bare MCUboot image)
/// * `config` - Upgrade configuration, validated before anything starts
/// * `progress` - Channel for progress updates
pub async fn flash_firmware(
    manager: UpgradeManager,
    handle: PeripheralHandle,
    firmware: Vec<u8>,
    config: UpgradeConfiguration,
    progress: UnboundedSender<DfuProgressEvent>,
) -> Result<(), String> {
    let outcome = tokio::task::spawn_blocking(move || {
        let package = package::parse(&firmware).map_err(|e| error_string(&e))?;
        let session = manager
            .start(&handle, package, config)
            .map_err(|e| error_string(&e))?;

        for event in session.events() {
            let _ = progress.send(DfuProgressEvent::from(&event));
        }
        Ok::<_, String>(session.join())
    })
    .await
    .map_err(|e| format!("DFU task panicked: {}", e))??;

    match outcome {
        UpgradeOutcome::Success => Ok(()),
        UpgradeOutcome::Failed(reason) => Err(reason.to_string()),
        UpgradeOutcome::Cancelled => Err(error_string(&DfuError::Cancelled)),
    }
}

/// Cancel the running flash for `peripheral_id`.
///
/// Returns false when no session is active for it.
pub fn cancel_flash(manager: &UpgradeManager, peripheral_id: &str) -> bool {
    manager.cancel(peripheral_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dfu::sim::SimulatedPeripheral;
    use crate::dfu::ProgressReport;
    use crate::test_helpers::fixtures::PackageBuilder;
    use crate::test_helpers::temp::TestContext;
    use crate::traits::{FsFileProvider, MockFileProvider};
    use chrono::Utc;
    use std::time::Duration;
    use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver};

    fn firmware(len: usize) -> Vec<u8> {
        let bytes: Vec<u8> = (0..len).map(|i| (i % 251) as u8).collect();
        PackageBuilder::new()
            .name("demo")
            .image(0, "app.bin", bytes)
            .build()
    }

    fn fast_config() -> UpgradeConfiguration {
        UpgradeConfiguration {
            estimated_swap_time: Duration::from_millis(500),
            reconnect_poll_interval: Duration::from_millis(5),
            ack_timeout: Duration::from_millis(20),
            ..Default::default()
        }
    }

    fn drain(rx: &mut UnboundedReceiver<DfuProgressEvent>) -> Vec<DfuProgressEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    #[test]
    fn test_dfu_progress_event_from_progress() {
        let event = UpgradeEvent::Progress(ProgressReport {
            slot: 1,
            bytes_acknowledged: 50000,
            total: 100000,
            package_acknowledged: 50000,
            package_total: 100000,
            timestamp: Utc::now(),
        });
        let dto = DfuProgressEvent::from(&event);

        assert_eq!(dto.stage, "uploading");
        assert_eq!(dto.slot, Some(1));
        assert_eq!(dto.sent, Some(50000));
        assert_eq!(dto.total, Some(100000));
        assert!(dto.percent > 2.0 && dto.percent < 90.0);
    }

    #[test]
    fn test_dfu_progress_event_stage_names() {
        let changed = |new| UpgradeEvent::StateChanged {
            previous: UpgradeState::Idle,
            new,
        };
        assert_eq!(DfuProgressEvent::from(&changed(UpgradeState::Test)).stage, "testing");
        assert_eq!(DfuProgressEvent::from(&changed(UpgradeState::Reset)).stage, "resetting");
        assert_eq!(
            DfuProgressEvent::from(&UpgradeEvent::Terminal(UpgradeOutcome::Cancelled)).stage,
            "cancelled"
        );
    }

    #[tokio::test]
    async fn test_validate_with_mock_provider() {
        let raw = firmware(1500);
        let mut provider = MockFileProvider::new();
        provider
            .expect_read()
            .withf(|path| path == Path::new("/fw/demo.zip"))
            .times(1)
            .returning(move |_| Ok(raw.clone()));

        let info = validate_firmware_package(Arc::new(provider), "/fw/demo.zip".to_string())
            .await
            .unwrap();

        assert_eq!(info.container, ContainerKind::Zip);
        assert_eq!(info.name.as_deref(), Some("demo"));
        assert_eq!(info.images.len(), 1);
        assert_eq!(info.images[0].size, 1500);
        assert_eq!(info.images[0].sha256.len(), 64);
        assert_eq!(info.total_size, 1500);
    }

    #[tokio::test]
    async fn test_validate_reads_from_disk() {
        let ctx = TestContext::new();
        let path = ctx.create_file_bytes("firmware/demo.zip", &firmware(700));

        let info = validate_firmware_package(
            Arc::new(FsFileProvider),
            path.to_string_lossy().into_owned(),
        )
        .await
        .unwrap();

        assert_eq!(info.total_size, 700);
    }

    #[tokio::test]
    async fn test_validate_reports_error_code() {
        let mut provider = MockFileProvider::new();
        provider
            .expect_read()
            .returning(|_| Ok(vec![0x00, 0x01, 0x02, 0x03]));

        let err = validate_firmware_package(Arc::new(provider), "bad.bin".to_string())
            .await
            .unwrap_err();

        assert!(err.contains("Invalid firmware package"));
        assert!(err.contains("[DFU-"));
    }

    #[tokio::test]
    async fn test_flash_streams_progress() {
        let sim = SimulatedPeripheral::new();
        let manager = UpgradeManager::new(Arc::new(sim.transport()));
        let (tx, mut rx) = unbounded_channel();

        flash_firmware(
            manager.clone(),
            PeripheralHandle::new("sim"),
            firmware(2048),
            fast_config(),
            tx,
        )
        .await
        .unwrap();

        let events = drain(&mut rx);
        let uploads = events
            .iter()
            .filter(|e| e.stage == "uploading" && e.sent.is_some())
            .count();
        assert_eq!(uploads, 4);
        let last = events.last().unwrap();
        assert_eq!(last.stage, "complete");
        assert_eq!(last.percent, 100.0);
        assert!(!manager.is_active(&PeripheralHandle::new("sim")));
    }

    #[tokio::test]
    async fn test_flash_invalid_package_sends_nothing() {
        let sim = SimulatedPeripheral::new();
        let manager = UpgradeManager::new(Arc::new(sim.transport()));
        let (tx, mut rx) = unbounded_channel();

        let err = flash_firmware(
            manager,
            PeripheralHandle::new("sim"),
            vec![1, 2, 3],
            fast_config(),
            tx,
        )
        .await
        .unwrap_err();

        assert!(err.contains("[DFU-"));
        assert!(drain(&mut rx).is_empty());
        assert!(sim.chunk_log().is_empty());
    }

    #[tokio::test]
    async fn test_flash_device_rejection() {
        let sim = SimulatedPeripheral::new();
        sim.corrupt_writes(true);
        let manager = UpgradeManager::new(Arc::new(sim.transport()));
        let (tx, mut rx) = unbounded_channel();

        let err = flash_firmware(
            manager,
            PeripheralHandle::new("sim"),
            firmware(1024),
            fast_config(),
            tx,
        )
        .await
        .unwrap_err();

        assert!(err.contains("rejected"));
        assert_eq!(drain(&mut rx).last().unwrap().stage, "failed");
    }

    #[tokio::test]
    async fn test_cancel_flash() {
        let sim = SimulatedPeripheral::new();
        let pause = sim.pause_before_write(1);
        let manager = UpgradeManager::new(Arc::new(sim.transport()));
        let (tx, _rx) = unbounded_channel();

        assert!(!cancel_flash(&manager, "sim"));

        let flash = tokio::spawn(flash_firmware(
            manager.clone(),
            PeripheralHandle::new("sim"),
            firmware(4096),
            fast_config(),
            tx,
        ));

        let (pause, reached) = tokio::task::spawn_blocking(move || {
            let reached = pause.wait_reached(Duration::from_secs(5));
            (pause, reached)
        })
        .await
        .unwrap();
        assert!(reached);

        assert!(cancel_flash(&manager, "sim"));
        pause.release();

        let err = flash.await.unwrap().unwrap_err();
        assert!(err.contains("cancelled"));
        assert!(err.contains("DFU-099"));
    }
}
