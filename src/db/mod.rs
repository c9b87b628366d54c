pub mod connection;
pub mod schema;

pub use connection::{connect, connect_memory};
pub use schema::apply_schema;
