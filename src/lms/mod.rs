//! School LMS records and the client that reads, watches and writes them.

mod client;
mod export;
pub mod models;

pub use client::LmsClient;
pub use export::grades_csv;
pub use models::*;
