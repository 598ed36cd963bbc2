pub mod catalog;
pub mod certificate;
pub mod config;
pub mod db;
pub mod enrollment;
pub mod error;
pub mod progress;
pub mod quiz;
pub mod server;
pub mod session;
pub mod student;
pub mod utils;

#[cfg(test)]
mod fixtures;
