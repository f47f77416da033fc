pub mod config;
pub mod db;
pub mod error;
pub mod ipset;
pub mod types;
