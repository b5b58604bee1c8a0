pub mod connection;
pub mod kv;
pub mod migrations;

pub use connection::{connect, connect_with_settings, DbPool};
pub use kv::SqliteKvStore;
