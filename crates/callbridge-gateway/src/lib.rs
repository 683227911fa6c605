//! WebSocket gateway for the telephony leg.
//!
//! Each Twilio Media Streams connection on `/twilio` becomes one
//! [`CallSession`](callbridge_session::CallSession). The gateway translates between the wire
//! frames and the session's transport events and commands, and reports health.

pub mod connection;
#[cfg(feature = "metrics")]
pub mod metrics;
pub mod server;
pub mod state;

pub use server::{router, start_gateway};
pub use state::GatewayState;
