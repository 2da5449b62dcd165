pub mod config;
pub mod device;
pub mod error;
pub mod manager;
pub mod merge;
pub mod source;
pub mod sources;
pub mod virtual_handlers;
pub mod watcher;

pub use config::Config;
pub use config::LogLevel;
pub use device::Device;
pub use device::DeviceMap;
pub use error::Error;
pub use error::SourceError;
pub use manager::DeviceEvent;
pub use manager::ManagerState;
pub use manager::MultiManager;
pub use merge::MergingManager;
pub use source::Command;
pub use source::SourceAccount;
pub use watcher::DeviceWatcher;
