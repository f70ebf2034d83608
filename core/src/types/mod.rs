pub mod action;
pub mod config;
pub mod scenario;
pub mod task;
