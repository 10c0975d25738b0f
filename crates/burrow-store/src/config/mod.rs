//! Configuration: schema, defaults, load/save

pub mod defaults;
pub mod loader;
pub mod schema;

pub use defaults::{default_node_name, default_tcp_port, node_name_to_id};
pub use loader::ConfigStore;
pub use schema::{AppConfig, Config, NetworkConfig, Protocol};
