pub mod cli;
pub mod config;
pub mod error;
pub mod events;
pub mod listeners;
pub mod server;
pub mod services;
pub mod state_machine;
pub mod ui;

#[cfg(test)]
pub(crate) mod testing;
