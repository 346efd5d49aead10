//! Operator HTTP API: build submission, fleet read-outs and agent control.

pub mod handlers;
pub mod protocol;

pub use handlers::{ApiState, api_router};

#[cfg(test)]
mod tests;
