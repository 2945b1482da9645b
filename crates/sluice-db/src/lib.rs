pub mod checkpoint_repository;
pub mod config;
pub mod database;

pub use checkpoint_repository::CheckpointRepository;
pub use config::DatabaseConfig;
pub use database::Database;
