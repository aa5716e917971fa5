// Shared types for the lattice mesh: identifiers, crypto primitives,
// error taxonomy, and the wire protocol model.

pub mod constants;
pub mod crypto;
pub mod error;
pub mod identity;
pub mod protocol;
pub mod types;

pub use error::LatticeError;
pub use types::{MessageId, NodeId};
