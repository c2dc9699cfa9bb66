//! Firmware upgrade transport and state machine for MCUboot-style
//! peripherals, with an async command façade for host applications.

pub mod commands;
pub mod dfu;
pub mod traits;

#[cfg(test)]
mod test_helpers;

pub use dfu::{
    package, DfuError, DfuResult, PeripheralHandle, SerialTransport, Transport,
    UpgradeConfiguration, UpgradeEvent, UpgradeManager, UpgradeObserver, UpgradeOutcome,
    UpgradeSession, UpgradeState,
};
