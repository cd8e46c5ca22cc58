pub mod config;
pub mod db;
pub mod erase;
pub mod model;
pub mod reclaim;
pub mod store;
