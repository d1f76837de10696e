pub mod auth;
pub mod events;
pub mod logging;
pub mod presence;
pub mod server;
pub mod storage;
