pub mod message;
pub mod request;
pub mod response;
pub mod task;
pub mod validation;
