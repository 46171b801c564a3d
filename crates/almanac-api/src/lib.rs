//! HTTP and WebSocket front-ends for the almanac dataset node.
//!
//! Routes are generated from the dispatcher's method attribute sets; the
//! WebSocket endpoint fans bus events out to connected clients as JSON
//! envelopes.

pub mod error;
pub mod http;
pub mod server;
pub mod ws;

pub use http::router;
pub use server::serve;
