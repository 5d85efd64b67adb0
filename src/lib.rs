pub mod api;
pub mod catalog;
pub mod config;
pub mod engine;
pub mod error;
pub mod git;
pub mod model;
