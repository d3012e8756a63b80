pub mod docstore;
pub mod error;
pub mod gateway;
pub mod persist;
pub mod presence;
pub mod registry;
pub mod room;
pub mod session;
