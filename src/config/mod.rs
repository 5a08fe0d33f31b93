pub mod container_config;
pub mod loader;

pub use container_config::ContainerConfig;
pub use loader::{ConfigLoader, CONFIG_FILE_NAME};
