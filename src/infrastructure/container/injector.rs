//! 注入器：根据构造描述创建并填充实例
//!
//! `ReflectionInjector` 按 [`ConstructionDescriptor`] 通用地解释执行；
//! `CompiledInjector` 是针对单个类型直接写出的构造路径。两者满足同一契约，
//! 解析算法不区分具体使用的是哪一种。

use super::analyzer::{ConstructionDescriptor, ParameterInfo};
use super::contract::{unerase, ContractKey, ContractType, ErasedArc, Instance};
use super::resolver::Resolver;
use crate::errors::ContainerError;
use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;

/// 注入器契约
pub trait Injector: Send + Sync {
    /// 只执行构造函数注入
    fn construct(
        &self,
        resolver: &dyn Resolver,
        parameters: &[InjectParameter],
    ) -> Result<Instance, ContainerError>;

    /// 对已有实例执行字段/属性注入，然后执行方法注入
    fn inject(
        &self,
        instance: &Instance,
        resolver: &dyn Resolver,
        parameters: &[InjectParameter],
    ) -> Result<(), ContainerError>;

    fn create_instance(
        &self,
        resolver: &dyn Resolver,
        parameters: &[InjectParameter],
    ) -> Result<Instance, ContainerError> {
        let instance = self.construct(resolver, parameters)?;
        self.inject(&instance, resolver, parameters)?;
        Ok(instance)
    }
}

#[derive(Clone)]
enum ParameterTarget {
    Named(Arc<str>),
    Typed(ContractKey),
}

/// 参数覆盖：按名称或按契约类型（及 key）替换一次解析
#[derive(Clone)]
pub struct InjectParameter {
    target: ParameterTarget,
    value: Arc<dyn Fn() -> ErasedArc + Send + Sync>,
}

impl InjectParameter {
    pub fn typed<T: ?Sized + Send + Sync + 'static>(value: Arc<T>) -> Self {
        Self::with_target(ParameterTarget::Typed(ContractKey::of::<T>()), value)
    }

    pub fn keyed<T: ?Sized + Send + Sync + 'static>(key: impl Into<Arc<str>>, value: Arc<T>) -> Self {
        Self::with_target(ParameterTarget::Typed(ContractKey::keyed::<T>(key)), value)
    }

    pub fn named<T: ?Sized + Send + Sync + 'static>(name: impl Into<Arc<str>>, value: Arc<T>) -> Self {
        Self::with_target(ParameterTarget::Named(name.into()), value)
    }

    fn with_target<T: ?Sized + Send + Sync + 'static>(target: ParameterTarget, value: Arc<T>) -> Self {
        Self {
            target,
            value: Arc::new(move || Box::new(value.clone()) as ErasedArc),
        }
    }

    pub fn matches(&self, parameter: &ParameterInfo) -> bool {
        match &self.target {
            ParameterTarget::Named(name) => &**name == parameter.name,
            ParameterTarget::Typed(_) => self.matches_key(&parameter.contract),
        }
    }

    /// 按契约键匹配；未指定 key 的覆盖匹配任意 key
    pub fn matches_key(&self, contract: &ContractKey) -> bool {
        match &self.target {
            ParameterTarget::Named(_) => false,
            ParameterTarget::Typed(key) => {
                key.contract == contract.contract && (key.key.is_none() || key.key == contract.key)
            }
        }
    }

    pub fn value(&self) -> ErasedArc {
        (self.value)()
    }

    /// 供编译注入器使用：查找类型为 `T` 的覆盖值
    pub fn find<T: ?Sized + 'static>(parameters: &[InjectParameter], name: &str) -> Option<Arc<T>> {
        let contract = ContractType::of::<T>();
        parameters
            .iter()
            .find(|p| match &p.target {
                ParameterTarget::Named(n) => &**n == name,
                ParameterTarget::Typed(key) => key.contract == contract && key.key.is_none(),
            })
            .and_then(|p| p.value().downcast::<Arc<T>>().ok().map(|boxed| *boxed))
    }
}

impl fmt::Debug for InjectParameter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.target {
            ParameterTarget::Named(name) => write!(f, "InjectParameter(name = {})", name),
            ParameterTarget::Typed(key) => write!(f, "InjectParameter(type = {})", key),
        }
    }
}

/// 按声明顺序传给构造函数/注入方法的已解析参数
pub struct Arguments {
    owner: &'static str,
    values: VecDeque<ErasedArc>,
}

impl Arguments {
    pub(crate) fn new(owner: &'static str, capacity: usize) -> Self {
        Self {
            owner,
            values: VecDeque::with_capacity(capacity),
        }
    }

    pub(crate) fn push(&mut self, value: ErasedArc) {
        self.values.push_back(value);
    }

    /// 取出下一个参数
    pub fn take<T: ?Sized + 'static>(&mut self) -> Result<Arc<T>, ContainerError> {
        let owner = self.owner;
        let value = self
            .values
            .pop_front()
            .ok_or_else(|| ContainerError::TypeMismatch {
                expected: std::any::type_name::<T>(),
                context: format!("missing argument while constructing {}", owner),
            })?;
        unerase(value, || format!("argument of {}", owner))
    }

    pub fn remaining(&self) -> usize {
        self.values.len()
    }
}

/// 先用覆盖值，没有再走解析
pub(crate) fn resolve_parameter(
    resolver: &dyn Resolver,
    parameter: &ParameterInfo,
    overrides: &[InjectParameter],
) -> Result<ErasedArc, ContainerError> {
    if let Some(found) = overrides.iter().find(|p| p.matches(parameter)) {
        return Ok(found.value());
    }
    resolver.resolve_key(&parameter.contract)
}

fn resolve_arguments(
    owner: &'static str,
    resolver: &dyn Resolver,
    parameters: &[ParameterInfo],
    overrides: &[InjectParameter],
) -> Result<Arguments, ContainerError> {
    let mut arguments = Arguments::new(owner, parameters.len());
    for parameter in parameters {
        arguments.push(resolve_parameter(resolver, parameter, overrides)?);
    }
    Ok(arguments)
}

/// 通用注入器：解释执行构造描述
pub struct ReflectionInjector {
    descriptor: Arc<ConstructionDescriptor>,
}

impl ReflectionInjector {
    pub fn new(descriptor: Arc<ConstructionDescriptor>) -> Self {
        Self { descriptor }
    }

    pub fn descriptor(&self) -> &Arc<ConstructionDescriptor> {
        &self.descriptor
    }
}

impl Injector for ReflectionInjector {
    fn construct(
        &self,
        resolver: &dyn Resolver,
        parameters: &[InjectParameter],
    ) -> Result<Instance, ContainerError> {
        let owner = self.descriptor.implementation().name();
        let constructor = self
            .descriptor
            .constructor()
            .ok_or(ContainerError::NoInjectableConstructor { implementation: owner })?;
        let mut arguments = resolve_arguments(owner, resolver, &constructor.params, parameters)?;
        constructor.invoke(&mut arguments)
    }

    fn inject(
        &self,
        instance: &Instance,
        resolver: &dyn Resolver,
        parameters: &[InjectParameter],
    ) -> Result<(), ContainerError> {
        let owner = self.descriptor.implementation().name();
        for member in self.descriptor.members() {
            let value = resolve_parameter(resolver, &member.parameter, parameters)?;
            member.assign(instance, value)?;
        }
        for method in self.descriptor.methods() {
            let mut arguments = resolve_arguments(owner, resolver, &method.params, parameters)?;
            method.invoke(instance, &mut arguments)?;
        }
        Ok(())
    }
}

type ConstructFn<T> = dyn Fn(&dyn Resolver, &[InjectParameter]) -> Result<T, ContainerError> + Send + Sync;
type PopulateFn<T> = dyn Fn(&T, &dyn Resolver, &[InjectParameter]) -> Result<(), ContainerError> + Send + Sync;

/// 针对单个类型预先写好的注入器
pub struct CompiledInjector<T> {
    construct: Box<ConstructFn<T>>,
    populate: Option<Box<PopulateFn<T>>>,
}

impl<T: Send + Sync + 'static> CompiledInjector<T> {
    pub fn new<F>(construct: F) -> Self
    where
        F: Fn(&dyn Resolver, &[InjectParameter]) -> Result<T, ContainerError> + Send + Sync + 'static,
    {
        Self {
            construct: Box::new(construct),
            populate: None,
        }
    }

    pub fn with_populate<F>(mut self, populate: F) -> Self
    where
        F: Fn(&T, &dyn Resolver, &[InjectParameter]) -> Result<(), ContainerError> + Send + Sync + 'static,
    {
        self.populate = Some(Box::new(populate));
        self
    }
}

impl<T: Send + Sync + 'static> Injector for CompiledInjector<T> {
    fn construct(
        &self,
        resolver: &dyn Resolver,
        parameters: &[InjectParameter],
    ) -> Result<Instance, ContainerError> {
        let value = (self.construct)(resolver, parameters)?;
        Ok(Arc::new(value))
    }

    fn inject(
        &self,
        instance: &Instance,
        resolver: &dyn Resolver,
        parameters: &[InjectParameter],
    ) -> Result<(), ContainerError> {
        let Some(populate) = &self.populate else {
            return Ok(());
        };
        let target = instance
            .downcast_ref::<T>()
            .ok_or_else(|| ContainerError::TypeMismatch {
                expected: std::any::type_name::<T>(),
                context: "compiled injection target".to_string(),
            })?;
        populate(target, resolver, parameters)
    }
}
