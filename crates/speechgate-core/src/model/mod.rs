//! Model descriptors and the registry of known models

mod descriptor;
mod registry;

pub use descriptor::{CapabilityKind, ModelDescriptor, Ttl};
pub use registry::ModelRegistry;
