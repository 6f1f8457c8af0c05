pub mod app;
pub mod cli;
pub mod error;
pub mod forward;
pub mod logging;
pub mod server;
pub mod tls;
