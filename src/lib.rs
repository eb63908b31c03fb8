/// Shared functionality of the `axis` CLI, the master and the agent.
pub mod crawler;
pub mod db;
pub mod env;
pub mod error;
pub mod inventory;
pub mod key;
pub mod master_client;
pub mod payload;
pub mod protocol;
pub mod publish;
pub mod settings;
pub mod shell;
pub mod template;
pub mod utils;
