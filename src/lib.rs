pub mod config;
pub mod control;
pub mod hardware;
pub mod messages;
pub mod robot;
pub mod runtime;
