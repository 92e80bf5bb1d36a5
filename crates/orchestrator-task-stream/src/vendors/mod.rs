//! Concrete `MessageSource` implementations.
//!
//! Each vendor translates its own transport into the wire-event contract so
//! the session and store stay transport-agnostic.
pub mod http;
