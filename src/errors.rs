use thiserror::Error;

/// 依赖注入容器错误
///
/// 配置期错误（`NotAssignable`、`AmbiguousConstructor`、
/// `DuplicateSingletonInCollection`、`NoInjectableConstructor`）在
/// `ContainerBuilder::build` 时立即返回；解析期错误在具体的 `resolve` 调用处返回。
#[derive(Debug, Error)]
pub enum ContainerError {
    #[error("Service '{contract}' is not registered in this scope chain")]
    NotRegistered { contract: String },

    #[error("Type '{implementation}' declares {count} injection constructors, at most one is allowed")]
    AmbiguousConstructor {
        implementation: &'static str,
        count: usize,
    },

    #[error("Type '{implementation}' has no constructor the injector can use")]
    NoInjectableConstructor { implementation: &'static str },

    #[error("'{implementation}' is not assignable to contract '{contract}'")]
    NotAssignable {
        implementation: &'static str,
        contract: &'static str,
    },

    #[error("Conflicting singleton '{implementation}' registered twice into collection '{collection}'")]
    DuplicateSingletonInCollection {
        implementation: &'static str,
        collection: String,
    },

    #[error("Circular dependency detected: {}", chain.join(" -> "))]
    CircularDependency { chain: Vec<&'static str> },

    #[error("Scope '{scope}' has already been disposed")]
    DisposedContainerAccess { scope: String },

    #[error("Scope '{scope}' still has {children} live child scope(s); dispose them first")]
    LiveChildScopes { scope: String, children: usize },

    #[error("Type cast failed: expected '{expected}' in {context}")]
    TypeMismatch {
        expected: &'static str,
        context: String,
    },

    #[error("Failed to create '{implementation}': {source}")]
    Factory {
        implementation: &'static str,
        #[source]
        source: anyhow::Error,
    },

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

impl ContainerError {
    /// 将任意错误包装为工厂创建失败
    pub fn factory<T: ?Sized + 'static>(error: impl Into<anyhow::Error>) -> Self {
        ContainerError::Factory {
            implementation: std::any::type_name::<T>(),
            source: error.into(),
        }
    }

    pub fn is_not_registered(&self) -> bool {
        matches!(self, ContainerError::NotRegistered { .. })
    }

    /// 配置期错误：说明注册本身有问题，而不是运行期的使用错误
    pub fn is_configuration_error(&self) -> bool {
        matches!(
            self,
            ContainerError::AmbiguousConstructor { .. }
                | ContainerError::NoInjectableConstructor { .. }
                | ContainerError::NotAssignable { .. }
                | ContainerError::DuplicateSingletonInCollection { .. }
                | ContainerError::Config(_)
        )
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read file '{0}': {1}")]
    FileRead(String, #[source] std::io::Error),
    #[error("Failed to parse TOML from '{0}': {1}")]
    TomlParse(String, #[source] toml::de::Error),
    #[error("Invalid value '{value}' for environment variable {name}")]
    InvalidEnv { name: String, value: String },
}
