pub mod dto;
pub mod error;

#[cfg(test)]
mod tests;

pub use dto::*;
pub use error::{Error, ErrorResponse, Result};
