pub mod config;
pub mod launcher;
pub mod logging;
