pub mod acquire;
pub mod bus;
pub mod cli;
pub mod config;
pub mod discovery;
pub mod error;
pub mod model;
pub mod normalize;
pub mod payload;
pub mod poller;
pub mod role;
pub mod service;

pub use config::Config;
pub use error::{AppError, Result};
pub use model::NormalizedSample;
pub use poller::Poller;
