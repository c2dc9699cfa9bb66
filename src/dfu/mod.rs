//! Firmware upgrade (DFU) core for MCUboot-style peripherals.
//!
//! This module moves a signed firmware package onto a peripheral over a
//! framed byte link and drives the bootloader through its upgrade sequence.
//!
//! # Protocol Overview
//!
//! An upgrade consists of:
//! 1. **Validate** - Parse the package and re-check every image digest
//! 2. **Upload** - Stream each image slot in chunks with a pipelined window
//! 3. **Test** - Ask the device to mark each uploaded image for a test boot
//! 4. **Confirm** - Make the images permanent, optionally erasing app settings
//! 5. **Reset** - Reboot the device and wait for it to come back
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use dfu::{package, PeripheralHandle, SerialTransport, UpgradeConfiguration, UpgradeManager};
//!
//! let manager = UpgradeManager::new(Arc::new(SerialTransport::new()));
//! let package = package::parse(&std::fs::read("app_update.zip")?)?;
//! let session = manager.start(
//!     &PeripheralHandle::new("/dev/ttyACM0"),
//!     package,
//!     UpgradeConfiguration::default(),
//! )?;
//! for event in session.events() {
//!     println!("{:.0}% {}", event.percent(), event.message());
//! }
//! ```

pub mod config;
pub mod error;
pub mod frame;
pub mod mcuboot;
pub mod package;
pub mod serial;
pub mod session;
pub mod sim;
pub mod slip;
pub mod transport;
pub mod upgrade;
pub mod upload;

// Errors and configuration
pub use config::UpgradeConfiguration;
pub use error::{DfuError, DfuResult, ErrorKind, FailureReason};

// Packages
pub use package::{ContainerKind, ImageHash, ImagePackage, ImageSlot};

// Transport
pub use serial::{FramedConnection, Link, SerialLink, SerialTransport};
pub use transport::{Connection, ConnectionState, DeviceCommand, PeripheralHandle, Transport};

// Upgrade
pub use session::{CancelToken, UpgradeManager, UpgradeObserver, UpgradeSession};
pub use upgrade::{ProgressReport, UpgradeEvent, UpgradeOutcome, UpgradeState};
pub use upload::{UploadEngine, UploadSession};
