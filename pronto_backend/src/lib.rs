pub mod agent;
pub mod character;
pub mod character_card;
pub mod config;
pub mod error;
pub mod runtime;
pub mod server;
pub mod session;

pub use error::ChatError;
