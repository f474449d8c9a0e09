//! Typed query modules over the shared pool.
//!
//! Transactions are short; none spans an external service call.

pub mod episodes;
pub mod gates;
pub mod generations;
pub mod pipeline;
pub mod projects;
pub mod scenes;
pub mod storyline;
