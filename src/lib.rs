//! On-device camera age estimation library

pub mod assets;
pub mod cache;
pub mod camera;
pub mod config;
pub mod detect;
pub mod engine;
pub mod error;
pub mod service;

pub use config::Config;
pub use error::Error;
