pub mod chat;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod messages;
pub mod notifications;
pub mod presence;
pub mod room;
pub mod server;
pub mod store;
pub mod timer;
pub mod video;
