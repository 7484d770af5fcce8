//! CLI command modules.

pub mod http;
pub mod peers;
pub mod status;
