//! Canonical device record shared by every source account.

mod model;
mod shared;

use std::collections::BTreeMap;

pub use model::ConfigItem;
pub use model::Device;
pub use model::DeviceRecord;
pub use model::DpSpec;
pub use model::LocalStrategy;
pub use model::LocalStrategyMap;
pub use model::SpecMap;
pub use model::StatusMap;
pub use shared::Shared;

/// Devices owned by one source, keyed by device id.
pub type DeviceMap = BTreeMap<String, Device>;

/// A device map that the owning source and the manager both hold.
pub type SharedDeviceMap = Shared<DeviceMap>;
