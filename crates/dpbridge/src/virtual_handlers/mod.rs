//! Virtual capabilities: device features computed locally from descriptors.

mod descriptor;
mod function;
mod state;

pub use descriptor::DescriptorRegistry;
pub use descriptor::DescriptorsByCategory;
pub use descriptor::EntityDescriptor;
pub use descriptor::VirtualFunction;
pub use descriptor::VirtualFunctions;
pub use descriptor::VirtualState;
pub use descriptor::VirtualStates;
pub use function::VirtualCommand;
pub use function::VirtualFunctionHandler;
pub use function::VirtualFunctionOutcome;
pub use state::VirtualStateHandler;
