//! Database module: row models and SQL repositories.
//!
//! This module is split into two submodules:
//! - `model`: typed rows returned by repositories.
//! - `repo`: SQL-only functions that map rows into models.
//!
//! External modules should import from `orphan_reclaim::db`; the repository
//! API and commonly used models are re-exported here.

pub mod model;
pub mod repo;

pub use repo::*;

pub use model::{EraseTask, EraseTaskRow};
