//! 依赖注入容器
//!
//! 自底向上：契约与类型擦除 → 类型分析 → 注入器 → 实例生成 → 注册 → 构建器 → 作用域容器。

pub mod analyzer;
pub mod builder;
mod cache;
pub mod contract;
pub mod disposal;
pub mod injector;
pub mod registration;
pub mod resolver;
pub mod scope;
pub mod spawner;

pub use analyzer::{
    ConstructionDescriptor, ConstructorBuilder, ConstructorInfo, DescriptorBuilder, Injectable, MemberInfo,
    MemberKind, MethodBuilder, MethodInfo, ParameterInfo, TypeAnalyzer,
};
pub use builder::{ContainerBuilder, Installer};
pub use contract::{ContractBinding, ContractKey, ContractType, ErasedArc, Instance, Upcast};
pub use disposal::{Disposable, DisposalTracker};
pub use injector::{Arguments, CompiledInjector, InjectParameter, Injector, ReflectionInjector};
pub use registration::{PendingRegistration, Registration, RegistrationBuilder};
pub use resolver::{ResolveContext, Resolver, ResolverExt};
pub use scope::{Container, ContainerStats, ScopeInfo};
pub use spawner::{AsyncInstance, CollectionAggregate, InstanceSpawner};

// 生命周期放在模块层级，各子模块通过 `super::Lifetime` 引用
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Lifetime {
    /// 每次解析都创建新实例
    Transient,
    /// 每个作用域一个实例
    Scoped,
    /// 声明它的作用域及其全部后代共享一个实例
    Singleton,
}
