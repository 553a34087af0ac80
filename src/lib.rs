pub mod api;
pub mod pipeline;
