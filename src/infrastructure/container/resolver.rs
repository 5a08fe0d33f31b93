//! 解析器接口与单次解析上下文

use super::contract::{unerase, ContractKey, ContractType, ErasedArc};
use super::scope::Container;
use super::spawner::AsyncInstance;
use crate::errors::ContainerError;
use std::cell::RefCell;
use std::sync::Arc;

/// 解析器：按契约键取得实例
///
/// 工厂函数和注入器拿到的是 `&dyn Resolver`；泛型便捷方法见 [`ResolverExt`]。
pub trait Resolver {
    /// 解析契约键，返回装箱的 `Arc<T>`
    fn resolve_key(&self, key: &ContractKey) -> Result<ErasedArc, ContainerError>;

    /// 与 `resolve_key` 相同，但整个作用域链上都没有注册时返回 `None`
    fn try_resolve_key(&self, key: &ContractKey) -> Result<Option<ErasedArc>, ContainerError>;

    /// 发起解析的作用域
    fn scope(&self) -> &Container;
}

pub trait ResolverExt: Resolver {
    fn resolve<T: ?Sized + 'static>(&self) -> Result<Arc<T>, ContainerError> {
        let key = ContractKey::of::<T>();
        let value = self.resolve_key(&key)?;
        unerase(value, || format!("resolve of {}", key))
    }

    fn resolve_keyed<T: ?Sized + 'static>(&self, key: &str) -> Result<Arc<T>, ContainerError> {
        let key = ContractKey::keyed::<T>(key);
        let value = self.resolve_key(&key)?;
        unerase(value, || format!("resolve of {}", key))
    }

    fn try_resolve<T: ?Sized + 'static>(&self) -> Result<Option<Arc<T>>, ContainerError> {
        let key = ContractKey::of::<T>();
        match self.try_resolve_key(&key)? {
            Some(value) => unerase(value, || format!("resolve of {}", key)).map(Some),
            None => Ok(None),
        }
    }

    /// 解析 `T` 的全部注册（按注册顺序）；没有任何注册时返回空列表
    fn resolve_all<T: ?Sized + 'static>(&self) -> Result<Vec<Arc<T>>, ContainerError> {
        Ok(self
            .try_resolve::<Vec<Arc<T>>>()?
            .map(|items| (*items).clone())
            .unwrap_or_default())
    }

    /// 取得异步工厂的待定值，不阻塞当前线程
    fn resolve_async<T: Send + Sync + 'static>(&self) -> Result<AsyncInstance<T>, ContainerError> {
        Ok((*self.resolve::<AsyncInstance<T>>()?).clone())
    }
}

impl<R: Resolver + ?Sized> ResolverExt for R {}

/// 单次解析调用的栈信息（只存在于发起线程上）
#[derive(Default)]
pub(crate) struct ResolutionStack {
    constructing: RefCell<Vec<ContractType>>,
    injecting: RefCell<Vec<ContractType>>,
}

impl ResolutionStack {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// 标记实现类型正在构造；同一调用栈上重复出现即为构造循环
    pub(crate) fn enter_construction(&self, implementation: ContractType) -> Result<StackGuard<'_>, ContainerError> {
        Self::enter(&self.constructing, implementation)
    }

    /// 瞬态实例的成员注入重入同一实现时无法终止，同样视为循环
    pub(crate) fn enter_injection(&self, implementation: ContractType) -> Result<StackGuard<'_>, ContainerError> {
        Self::enter(&self.injecting, implementation)
    }

    fn enter(frames: &RefCell<Vec<ContractType>>, implementation: ContractType) -> Result<StackGuard<'_>, ContainerError> {
        let mut stack = frames.borrow_mut();
        if let Some(position) = stack.iter().position(|frame| *frame == implementation) {
            let mut chain: Vec<&'static str> = stack[position..].iter().map(|frame| frame.name()).collect();
            chain.push(implementation.name());
            return Err(ContainerError::CircularDependency { chain });
        }
        stack.push(implementation);
        Ok(StackGuard { frames })
    }

    pub(crate) fn depth(&self) -> usize {
        self.constructing.borrow().len()
    }
}

pub(crate) struct StackGuard<'a> {
    frames: &'a RefCell<Vec<ContractType>>,
}

impl Drop for StackGuard<'_> {
    fn drop(&mut self) {
        self.frames.borrow_mut().pop();
    }
}

/// 解析进行中的解析器：作用域 + 调用栈
pub struct ResolveContext<'a> {
    scope: &'a Container,
    stack: &'a ResolutionStack,
}

impl<'a> ResolveContext<'a> {
    pub(crate) fn new(scope: &'a Container, stack: &'a ResolutionStack) -> Self {
        Self { scope, stack }
    }

    pub(crate) fn stack(&self) -> &'a ResolutionStack {
        self.stack
    }

    pub(crate) fn container(&self) -> &'a Container {
        self.scope
    }
}

impl Resolver for ResolveContext<'_> {
    fn resolve_key(&self, key: &ContractKey) -> Result<ErasedArc, ContainerError> {
        self.scope.resolve_with(key, self.stack)
    }

    fn try_resolve_key(&self, key: &ContractKey) -> Result<Option<ErasedArc>, ContainerError> {
        self.scope.try_resolve_with(key, self.stack)
    }

    fn scope(&self) -> &Container {
        self.scope
    }
}
