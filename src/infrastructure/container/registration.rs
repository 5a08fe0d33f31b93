//! 注册记录与注册构建器

use super::analyzer::{ConstructionDescriptor, Injectable, TypeAnalyzer};
use super::contract::{ContractBinding, ContractKey, ContractType, ErasedArc, Instance, Upcast};
use super::disposal::{disposer_for, Disposable, Disposer};
use super::injector::{InjectParameter, Injector};
use super::spawner::{FactoryFn, InstanceSpawner};
use super::Lifetime;
use crate::errors::ContainerError;
use std::fmt;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

static NEXT_REGISTRATION_ID: AtomicU64 = AtomicU64::new(1);

/// 不可变的注册记录
///
/// 构建后成为容器查找表的一部分，不再修改。缓存按 `id` 区分注册，
/// 同一实现类型的两次注册是两个不同的注册。
pub struct Registration {
    id: u64,
    implementation: ContractType,
    bindings: Vec<ContractBinding>,
    key: Option<Arc<str>>,
    lifetime: Lifetime,
    spawner: InstanceSpawner,
    parameters: Vec<InjectParameter>,
    disposer: Option<Disposer>,
}

impl Registration {
    pub(crate) fn new(
        implementation: ContractType,
        bindings: Vec<ContractBinding>,
        key: Option<Arc<str>>,
        lifetime: Lifetime,
        spawner: InstanceSpawner,
    ) -> Self {
        Self {
            id: NEXT_REGISTRATION_ID.fetch_add(1, Ordering::Relaxed),
            implementation,
            bindings,
            key,
            lifetime,
            spawner,
            parameters: Vec::new(),
            disposer: None,
        }
    }

    fn with_parameters(mut self, parameters: Vec<InjectParameter>) -> Self {
        self.parameters = parameters;
        self
    }

    fn with_disposer(mut self, disposer: Option<Disposer>) -> Self {
        self.disposer = disposer;
        self
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn implementation(&self) -> ContractType {
        self.implementation
    }

    pub fn contracts(&self) -> impl Iterator<Item = ContractType> + '_ {
        self.bindings.iter().map(|binding| binding.contract())
    }

    pub fn bindings(&self) -> &[ContractBinding] {
        &self.bindings
    }

    pub fn key(&self) -> Option<&Arc<str>> {
        self.key.as_ref()
    }

    pub fn lifetime(&self) -> Lifetime {
        self.lifetime
    }

    pub fn spawner(&self) -> &InstanceSpawner {
        &self.spawner
    }

    pub fn parameters(&self) -> &[InjectParameter] {
        &self.parameters
    }

    pub fn disposer(&self) -> Option<&Disposer> {
        self.disposer.as_ref()
    }

    /// 这个注册在表中占用的查找键
    pub fn keys(&self) -> impl Iterator<Item = ContractKey> + '_ {
        self.bindings
            .iter()
            .map(move |binding| ContractKey::new(binding.contract(), self.key.clone()))
    }

    pub fn binding(&self, contract: ContractType) -> Option<&ContractBinding> {
        self.bindings.iter().find(|binding| binding.contract() == contract)
    }

    /// 把实例转换成 `contract` 契约的 `Arc`
    pub(crate) fn cast(&self, contract: ContractType, instance: &Instance) -> Result<ErasedArc, ContainerError> {
        let mismatch = || ContainerError::TypeMismatch {
            expected: contract.name(),
            context: format!("instance of {}", self.implementation),
        };
        self.binding(contract)
            .ok_or_else(mismatch)?
            .cast(instance)
            .ok_or_else(mismatch)
    }
}

impl fmt::Debug for Registration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registration")
            .field("id", &self.id)
            .field("implementation", &self.implementation)
            .field("contracts", &self.contracts().collect::<Vec<_>>())
            .field("key", &self.key)
            .field("lifetime", &self.lifetime)
            .field("spawner", &self.spawner)
            .finish()
    }
}

pub(crate) enum RegistrationSource {
    Injector(fn(&TypeAnalyzer) -> Result<Arc<dyn Injector>, ContainerError>),
    Instance(Instance),
    Factory(Arc<FactoryFn>),
}

enum RequestedContract {
    AsSelf,
    Static(ContractBinding),
    Dynamic(ContractType),
    ImplementedInterfaces,
}

type AnalyzeFn = fn(&TypeAnalyzer) -> Result<Arc<ConstructionDescriptor>, ContainerError>;

/// 配置阶段的注册（类型擦除），`ContainerBuilder::build` 时转换成 [`Registration`]
pub struct PendingRegistration {
    implementation: ContractType,
    lifetime: Lifetime,
    source: RegistrationSource,
    self_binding: ContractBinding,
    analyze: Option<AnalyzeFn>,
    requested: Vec<RequestedContract>,
    key: Option<Arc<str>>,
    parameters: Vec<InjectParameter>,
    disposer: Option<Disposer>,
}

fn analyze_type<T: Injectable>(analyzer: &TypeAnalyzer) -> Result<Arc<ConstructionDescriptor>, ContainerError> {
    analyzer.analyze::<T>()
}

fn construction_injector<T: Injectable>(analyzer: &TypeAnalyzer) -> Result<Arc<dyn Injector>, ContainerError> {
    analyzer.construction_injector::<T>()
}

impl PendingRegistration {
    pub(crate) fn for_type<T: Injectable>(lifetime: Lifetime) -> Self {
        let mut pending = Self::new::<T>(
            lifetime,
            RegistrationSource::Injector(construction_injector::<T>),
            ContractBinding::new::<T, T>(),
        );
        pending.analyze = Some(analyze_type::<T>);
        pending
    }

    pub(crate) fn for_instance<T: Send + Sync + 'static>(instance: Arc<T>) -> Self {
        Self::new::<T>(
            Lifetime::Singleton,
            RegistrationSource::Instance(instance),
            ContractBinding::new::<T, T>(),
        )
    }

    /// 以 `Arc<I>` 本身存放的实例（`I` 通常是 trait object）
    pub(crate) fn for_shared<I: ?Sized + Send + Sync + 'static>(lifetime: Lifetime, source: RegistrationSource) -> Self {
        Self::new::<Arc<I>>(lifetime, source, ContractBinding::shared::<I>())
    }

    pub(crate) fn for_factory<T: Send + Sync + 'static>(lifetime: Lifetime, factory: Arc<FactoryFn>) -> Self {
        Self::new::<T>(
            lifetime,
            RegistrationSource::Factory(factory),
            ContractBinding::new::<T, T>(),
        )
    }

    fn new<T: ?Sized + 'static>(lifetime: Lifetime, source: RegistrationSource, self_binding: ContractBinding) -> Self {
        Self {
            implementation: ContractType::of::<T>(),
            lifetime,
            source,
            self_binding,
            analyze: None,
            requested: Vec::new(),
            key: None,
            parameters: Vec::new(),
            disposer: None,
        }
    }

    pub fn implementation(&self) -> ContractType {
        self.implementation
    }

    pub fn lifetime(&self) -> Lifetime {
        self.lifetime
    }

    /// 不做分析时已知的查找键，配置阶段查询用
    pub(crate) fn declared_keys(&self) -> Vec<ContractKey> {
        let key = || self.key.clone();
        if self.requested.is_empty() {
            return vec![ContractKey::new(self.self_binding.contract(), key())];
        }
        self.requested
            .iter()
            .filter_map(|requested| match requested {
                RequestedContract::AsSelf => Some(self.self_binding.contract()),
                RequestedContract::Static(binding) => Some(binding.contract()),
                RequestedContract::Dynamic(contract) => Some(*contract),
                RequestedContract::ImplementedInterfaces => None,
            })
            .map(|contract| ContractKey::new(contract, key()))
            .collect()
    }

    /// 试分析：查找键与依赖，用于并行构建时划分互不相关的子图。分析失败时返回已知部分，
    /// 错误留给正式构建报告。
    pub(crate) fn inspect(&self, analyzer: &TypeAnalyzer) -> (Vec<ContractKey>, Vec<ContractKey>) {
        let mut keys = self.declared_keys();
        let mut dependencies = Vec::new();
        if let Some(Ok(descriptor)) = self.analyze.map(|analyze| analyze(analyzer)) {
            if self.requested.iter().any(|r| matches!(r, RequestedContract::ImplementedInterfaces)) {
                keys.extend(
                    descriptor
                        .interfaces()
                        .iter()
                        .map(|binding| ContractKey::new(binding.contract(), self.key.clone())),
                );
            }
            dependencies.extend(descriptor.dependencies().cloned());
        }
        (keys, dependencies)
    }

    /// 校验并生成不可变注册
    pub fn build(&self, analyzer: &TypeAnalyzer) -> Result<Registration, ContainerError> {
        let descriptor = self.analyze.map(|analyze| analyze(analyzer)).transpose()?;

        let spawner = match &self.source {
            RegistrationSource::Injector(injector) => InstanceSpawner::Injector(injector(analyzer)?),
            RegistrationSource::Instance(instance) => InstanceSpawner::ExistingInstance(instance.clone()),
            RegistrationSource::Factory(factory) => InstanceSpawner::Factory(factory.clone()),
        };

        let bindings = self.resolve_bindings(descriptor.as_deref())?;

        // 已有实例不归容器所有，除非显式声明
        let disposer = match (&self.disposer, &self.source) {
            (Some(disposer), _) => Some(disposer.clone()),
            (None, RegistrationSource::Instance(_)) => None,
            (None, _) => descriptor.as_deref().and_then(|d| d.disposer().cloned()),
        };

        Ok(Registration::new(self.implementation, bindings, self.key.clone(), self.lifetime, spawner)
            .with_parameters(self.parameters.clone())
            .with_disposer(disposer))
    }

    fn resolve_bindings(&self, descriptor: Option<&ConstructionDescriptor>) -> Result<Vec<ContractBinding>, ContainerError> {
        if self.requested.is_empty() {
            return Ok(vec![self.self_binding.clone()]);
        }

        let mut bindings: Vec<ContractBinding> = Vec::new();
        let mut push = |binding: ContractBinding| {
            if !bindings.iter().any(|b| b.contract() == binding.contract()) {
                bindings.push(binding);
            }
        };
        for requested in &self.requested {
            match requested {
                RequestedContract::AsSelf => push(self.self_binding.clone()),
                RequestedContract::Static(binding) => push(binding.clone()),
                RequestedContract::Dynamic(contract) => {
                    if *contract == self.self_binding.contract() || *contract == self.implementation {
                        push(self.self_binding.clone());
                        continue;
                    }
                    let binding = descriptor
                        .and_then(|d| d.interface(*contract))
                        .ok_or(ContainerError::NotAssignable {
                            implementation: self.implementation.name(),
                            contract: contract.name(),
                        })?;
                    push(binding.clone());
                }
                RequestedContract::ImplementedInterfaces => {
                    for binding in descriptor.map(|d| d.interfaces()).unwrap_or_default() {
                        push(binding.clone());
                    }
                }
            }
        }
        Ok(bindings)
    }
}

impl fmt::Debug for PendingRegistration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingRegistration")
            .field("implementation", &self.implementation)
            .field("lifetime", &self.lifetime)
            .field("key", &self.key)
            .finish()
    }
}

/// 注册的流式配置接口
///
/// ```ignore
/// builder.register::<ServiceImpl>(Lifetime::Scoped).as_::<dyn Service>().as_self();
/// ```
pub struct RegistrationBuilder<'a, T> {
    pending: &'a mut PendingRegistration,
    _marker: PhantomData<fn() -> T>,
}

impl<'a, T: Send + Sync + 'static> RegistrationBuilder<'a, T> {
    pub(crate) fn new(pending: &'a mut PendingRegistration) -> Self {
        Self {
            pending,
            _marker: PhantomData,
        }
    }

    /// 绑定契约 `I`（编译期检查可赋值性）
    pub fn as_<I>(self) -> Self
    where
        I: ?Sized + Send + Sync + 'static,
        T: Upcast<I>,
    {
        self.pending
            .requested
            .push(RequestedContract::Static(ContractBinding::new::<T, I>()));
        self
    }

    pub fn as_self(self) -> Self {
        self.pending.requested.push(RequestedContract::AsSelf);
        self
    }

    /// 按运行期类型绑定契约，构建时校验
    pub fn as_type(self, contract: ContractType) -> Self {
        self.pending.requested.push(RequestedContract::Dynamic(contract));
        self
    }

    pub fn keyed(self, key: impl Into<Arc<str>>) -> Self {
        self.pending.key = Some(key.into());
        self
    }

    /// 按契约类型覆盖一次依赖解析
    pub fn with_parameter<D: ?Sized + Send + Sync + 'static>(self, value: Arc<D>) -> Self {
        self.pending.parameters.push(InjectParameter::typed(value));
        self
    }

    pub fn with_named_parameter<D: ?Sized + Send + Sync + 'static>(self, name: impl Into<Arc<str>>, value: Arc<D>) -> Self {
        self.pending.parameters.push(InjectParameter::named(name, value));
        self
    }

    pub fn with_keyed_parameter<D: ?Sized + Send + Sync + 'static>(self, key: impl Into<Arc<str>>, value: Arc<D>) -> Self {
        self.pending.parameters.push(InjectParameter::keyed(key, value));
        self
    }

    /// 作用域结束时释放该注册创建的实例
    pub fn disposable(self) -> Self
    where
        T: Disposable,
    {
        self.pending.disposer = Some(disposer_for::<T>());
        self
    }

    pub fn lifetime(&self) -> Lifetime {
        self.pending.lifetime
    }
}

impl<'a, T: Injectable> RegistrationBuilder<'a, T> {
    /// 绑定类型描述中声明的全部契约
    pub fn as_implemented_interfaces(self) -> Self {
        if self.pending.analyze.is_none() {
            self.pending.analyze = Some(analyze_type::<T>);
        }
        self.pending.requested.push(RequestedContract::ImplementedInterfaces);
        self
    }
}
