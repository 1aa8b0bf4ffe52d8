pub mod archive;
pub mod common;
pub mod config;
pub mod convert;
pub mod datasource;
pub mod db;
pub mod error;
pub mod project;
pub mod templates;
pub mod truncate;

pub use error::{Error, Result};
