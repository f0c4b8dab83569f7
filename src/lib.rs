pub mod config;
pub mod credentials;
pub mod db;
pub mod gmail;
pub mod inbound;
pub mod output;
pub mod scheduler;
pub mod server;
pub mod tokens;
