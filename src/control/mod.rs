//! HTTP control plane
//!
//! Liveness/readiness/version/status/mapping/reload/log-rotation/metrics
//! endpoints, all served from a single hand-rolled HTTP/1.0-ish responder: a
//! blocking `TcpListener` with a thread per connection. No framework needed
//! for a handful of fixed, header-light GET endpoints.

mod server;

pub use server::{run, ControlState};
