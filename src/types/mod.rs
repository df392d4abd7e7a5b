//! Type definitions

pub mod ingest;
pub mod messages;
pub mod upload;

pub use ingest::*;
pub use messages::*;
pub use upload::*;
