pub mod client;
pub mod command;
pub mod connection;
pub mod parser;
pub mod stream;
pub mod types;

pub use client::{ClamAVClient, ClamAVClientImpl};
pub use command::Command;
pub use connection::Session;
pub use stream::ChunkStreamer;
pub use types::{InfectedFile, ScanResult, ScanVerdict, ServerStats};
