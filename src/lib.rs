pub mod config;
pub mod db;
pub mod diagnostics;
pub mod events;
pub mod jobs;
pub mod lifecycle;
pub mod model;
