//! Client-facing transports.

pub mod http;
