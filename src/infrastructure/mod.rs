//! 基础设施层

pub mod container;

pub use container::{Container, ContainerBuilder, Lifetime};
