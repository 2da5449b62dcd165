//! Aggregation of every source account into one device view.

mod event;
mod multi_manager;
mod multi_source;


pub use event::DeviceEvent;
pub use multi_manager::ManagerState;
pub use multi_manager::MultiManager;
pub use multi_source::MultiSourceHandler;
