//! scopegraph：带作用域树的依赖注入引擎
//!
//! ```ignore
//! use scopegraph::prelude::*;
//!
//! let mut builder = ContainerBuilder::new();
//! builder.register::<ConsoleLogger>(Lifetime::Singleton).as_::<dyn Logger>();
//! let container = builder.build()?;
//! let logger = container.resolve::<dyn Logger>()?;
//! ```

pub mod config;
pub mod errors;
pub mod infrastructure;
pub mod logging;

pub use config::ContainerConfig;
pub use errors::{ConfigError, ContainerError};
pub use infrastructure::container::{
    AsyncInstance, Container, ContainerBuilder, ContractKey, ContractType, Disposable, InjectParameter, Injectable,
    Installer, Lifetime, Resolver, ResolverExt, TypeAnalyzer, Upcast,
};

/// 常用类型一次导入
pub mod prelude {
    pub use crate::errors::ContainerError;
    pub use crate::implements;
    pub use crate::infrastructure::container::{
        Arguments, AsyncInstance, Container, ContainerBuilder, ContractKey, ContractType, DescriptorBuilder, Disposable,
        InjectParameter, Injectable, Installer, Lifetime, Resolver, ResolverExt,
    };
}
