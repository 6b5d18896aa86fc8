pub mod batch;
pub mod error;
pub mod events;
pub mod request;
