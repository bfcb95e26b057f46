//! Configuration matrix: expansion into runs, identities and output layout.

pub mod expand;
pub mod identity;
pub mod paths;

pub use expand::{ParameterMatrix, expand, validate};
pub use identity::{HashedIdentity, IdentityScope};
