pub mod bootstrap;
pub mod config;
pub mod encoders;
pub mod error;
pub mod export;
pub mod observability;
pub mod pipeline;
pub mod purge;
pub mod simulate;
pub mod writer;

pub use error::ServiceError;
pub use pipeline::{Pipeline, Sink, Source};
