//! Interface between the manager and source accounts.

mod account;
pub mod message;

pub use account::FactoryContext;
pub use account::Scene;
pub use account::SetupContext;
pub use account::SourceAccount;
pub use account::SourceFactoryResult;
pub use account::SourceMessage;
pub use account::SourceMessageReceiver;
pub use account::SourceMessageSender;
pub use account::StreamType;
pub use account::SOURCE_REGISTRY;
pub use message::Command;
pub use message::StatusEntry;
