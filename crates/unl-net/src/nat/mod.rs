//! NAT characterization and port prediction.

mod characterize;
mod mapping;

pub use characterize::{classify, NAT_TESTS, PORT_COLLISIONS};
pub use mapping::{predict_mappings, predict_port, NatDescriptor, NatKind, PortMapping, PredictedMapping};
