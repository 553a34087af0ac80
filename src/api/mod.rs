pub mod edit;
pub mod error;
pub mod response;
pub mod server;
