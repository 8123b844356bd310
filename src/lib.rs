pub mod config;
pub mod db;
pub mod extract;
pub mod orchestrator;
pub mod pipeline;
pub mod providers;
pub mod queries;
pub mod resolver;
pub mod scheduler;
pub mod source;
pub mod state;
pub mod store;
pub mod types;
