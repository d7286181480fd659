pub mod cli;
pub mod config;
pub mod coordinator;
pub mod csv_writer;
pub mod error;
pub mod matrix;
pub mod metrics;
pub mod protocol;
pub mod reporter;
pub mod requester;
pub mod transport;
pub mod types;
pub mod worker;
