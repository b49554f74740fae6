//! HTTP surface: client-facing proxy endpoints plus the stores they sit on
//! top of.

pub mod handlers;
pub mod keys;
pub mod routes;

pub use routes::serve;
