pub mod app;
pub mod config;
pub mod context;
pub mod error;
pub mod handlers;
pub mod preprocess;
pub mod protocol;
pub mod relay;
pub mod stream;
pub mod tokens;
pub mod upstream;
pub mod usage;
