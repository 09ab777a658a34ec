#![allow(clippy::multiple_crate_versions)]

pub mod config;
pub mod error;
pub mod http;
pub mod models;

pub use error::{DownloaderError, ErrorCategory, Result};
