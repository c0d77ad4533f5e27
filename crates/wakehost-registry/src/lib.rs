pub mod registry;
pub mod types;
pub mod validation;

pub use registry::{RegistryError, ServiceRegistry};
pub use types::DynamicService;
