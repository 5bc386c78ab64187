//! Request authorization.
//!
//! Two gates run in order: the token verifier proves the request was signed
//! with the shared secret, then the operation policy checks the requested
//! operation against the allow-list.

pub mod policy;
pub mod token;

pub use policy::OperationPolicy;
pub use token::{escape_html, TokenVerifier};
