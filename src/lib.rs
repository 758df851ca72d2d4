pub mod batch;
pub mod config;
pub mod engine;
pub mod error;
pub mod export;
pub mod imgtar;
pub mod layer;
pub mod mount;
pub mod resolver;
pub mod shadow;
pub mod util;

pub use config::Config;
pub use error::{Error, Result};
