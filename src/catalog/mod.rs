//! Catalog module - Product catalog requests over the bus
//!
//! Application layer on top of the transport: typed request/response
//! payloads, the catalog service, and terminal rendering.

mod display;
mod messages;
mod service;

pub use display::*;
pub use messages::*;
pub use service::*;

use thiserror::Error;

/// Catalog errors
#[derive(Error, Debug)]
pub enum CatalogError {
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Unknown command: '{0}'")]
    UnknownCommand(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),
}

pub type CatalogResult<T> = Result<T, CatalogError>;

/// Address the catalog service registers under by default
pub const CATALOG_SERVICE: &str = "prodc";
