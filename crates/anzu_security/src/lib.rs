//! Request authentication for the operator surface.
//!
//! Requests from a configured trusted subnet bypass auth entirely. Other
//! requests need a bearer token verified locally against an HMAC JWT.
//! Authenticated subjects are rate limited to a fixed per-minute budget.

pub mod gatekeeper;
pub mod ratelimit;
pub mod subnet;

pub use gatekeeper::{AuthError, AuthVerdict, Gatekeeper, TokenClaims};
pub use ratelimit::RateLimiter;
pub use subnet::Subnet;
