mod router;
mod server;

pub mod inject;

pub use inject::{InjectError, InjectRequest, InjectedResponse, SimulateOptions, inject, simulate};
pub use router::{app_router, inbound_request, into_response};
pub use server::{ServeError, serve_http, serve_listener};
