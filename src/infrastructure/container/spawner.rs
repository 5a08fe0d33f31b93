//! 实例生成策略
//!
//! 每个注册持有一个 [`InstanceSpawner`]，决定实例从哪里来：
//! 注入器构造、已有实例、工厂、集合聚合，或者容器自身。

use super::contract::{ContractType, ErasedArc, Instance};
use super::injector::{InjectParameter, Injector};
use super::registration::Registration;
use super::resolver::{ResolveContext, Resolver};
use super::Lifetime;
use crate::errors::ContainerError;
use futures_util::future::{BoxFuture, FutureExt, Shared};
use std::borrow::Cow;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

pub(crate) type FactoryFn = dyn Fn(&dyn Resolver) -> Result<Instance, ContainerError> + Send + Sync;

pub enum InstanceSpawner {
    /// 由注入器构造，随后执行成员/方法注入
    Injector(Arc<dyn Injector>),
    /// 注册时给出的实例，永远原样返回
    ExistingInstance(Instance),
    Factory(Arc<FactoryFn>),
    /// `Vec<Arc<T>>` 集合契约
    Collection(CollectionAggregate),
    /// 解析到发起解析的作用域本身（非拥有句柄）
    ContainerItself,
}

impl InstanceSpawner {
    pub(crate) fn spawn(
        &self,
        registration: &Registration,
        context: &ResolveContext<'_>,
        overrides: &[InjectParameter],
        publish: &dyn Fn(&Instance),
    ) -> Result<Instance, ContainerError> {
        match self {
            InstanceSpawner::Injector(injector) => {
                let stack = context.stack();
                // 调用级覆盖优先于注册时的覆盖
                let parameters: Cow<'_, [InjectParameter]> = if overrides.is_empty() {
                    Cow::Borrowed(registration.parameters())
                } else {
                    Cow::Owned(overrides.iter().chain(registration.parameters()).cloned().collect())
                };
                let instance = {
                    let _constructing = stack.enter_construction(registration.implementation())?;
                    injector.construct(context, &parameters)?
                };
                // 构造完成即发布，成员注入阶段的回环可以拿到同一个实例
                publish(&instance);
                let _injecting = match registration.lifetime() {
                    Lifetime::Transient => Some(stack.enter_injection(registration.implementation())?),
                    Lifetime::Scoped | Lifetime::Singleton => None,
                };
                injector.inject(&instance, context, &parameters)?;
                Ok(instance)
            }
            InstanceSpawner::ExistingInstance(instance) => Ok(instance.clone()),
            InstanceSpawner::Factory(factory) => {
                let _constructing = context.stack().enter_construction(registration.implementation())?;
                factory(context)
            }
            InstanceSpawner::Collection(aggregate) => aggregate.spawn(context),
            InstanceSpawner::ContainerItself => Ok(Arc::new(context.container().non_owning()) as Instance),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            InstanceSpawner::Injector(_) => "injector",
            InstanceSpawner::ExistingInstance(_) => "instance",
            InstanceSpawner::Factory(_) => "factory",
            InstanceSpawner::Collection(_) => "collection",
            InstanceSpawner::ContainerItself => "container",
        }
    }
}

impl fmt::Debug for InstanceSpawner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InstanceSpawner::Collection(aggregate) => f
                .debug_struct("Collection")
                .field("element", &aggregate.element)
                .field("children", &aggregate.children.len())
                .finish(),
            other => f.write_str(other.kind()),
        }
    }
}

/// 集合契约聚合：按注册顺序解析每个子注册并收集
pub struct CollectionAggregate {
    element: ContractType,
    children: Vec<Arc<Registration>>,
    collect: fn(Vec<ErasedArc>) -> Option<Instance>,
}

impl CollectionAggregate {
    pub(crate) fn new(
        element: ContractType,
        children: Vec<Arc<Registration>>,
        collect: fn(Vec<ErasedArc>) -> Option<Instance>,
    ) -> Self {
        Self {
            element,
            children,
            collect,
        }
    }

    pub fn element(&self) -> ContractType {
        self.element
    }

    pub fn children(&self) -> &[Arc<Registration>] {
        &self.children
    }

    fn spawn(&self, context: &ResolveContext<'_>) -> Result<Instance, ContainerError> {
        let scope = context.container();
        let mut items = Vec::with_capacity(self.children.len());
        for child in &self.children {
            // 子注册各自按自身生命周期解析
            let instance = scope.resolve_registration(child, context.stack())?;
            items.push(child.cast(self.element, &instance)?);
        }
        (self.collect)(items).ok_or_else(|| ContainerError::TypeMismatch {
            expected: self.element.name(),
            context: "collection element".to_string(),
        })
    }
}

type SharedResult<T> = Result<Arc<T>, Arc<ContainerError>>;

/// 异步工厂产出的待定值
///
/// 可克隆；所有克隆共享同一次计算，完成后得到同一个 `Arc<T>`。
pub struct AsyncInstance<T> {
    inner: Shared<BoxFuture<'static, SharedResult<T>>>,
}

impl<T: Send + Sync + 'static> AsyncInstance<T> {
    pub fn new<Fut>(future: Fut) -> Self
    where
        Fut: Future<Output = Result<T, ContainerError>> + Send + 'static,
    {
        let inner = future
            .map(|result| result.map(Arc::new).map_err(Arc::new))
            .boxed()
            .shared();
        Self { inner }
    }

    /// 已经完成时直接取值
    pub fn peek(&self) -> Option<SharedResult<T>> {
        self.inner.peek().cloned()
    }
}

impl<T> Clone for AsyncInstance<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Send + Sync + 'static> Future for AsyncInstance<T> {
    type Output = SharedResult<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        self.inner.poll_unpin(cx)
    }
}

impl<T> fmt::Debug for AsyncInstance<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncInstance")
            .field("type", &std::any::type_name::<T>())
            .finish()
    }
}
