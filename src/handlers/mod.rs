//! Resource operation handlers.
//!
//! The router ([`crate::server`]) authenticates each request and then
//! calls into these modules; handlers translate HTTP semantics into
//! [`crate::storage::Storage`] calls and render the responses.

pub mod bucket;
pub mod object;
