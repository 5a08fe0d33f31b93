//! 容器构建器
//!
//! 配置阶段只允许单线程写入；`build` 是从可变配置到不可变容器的唯一转换。

use super::analyzer::{Injectable, TypeAnalyzer};
use super::contract::{AggregateShape, ContractKey, ContractType, Instance};
use super::registration::{PendingRegistration, Registration, RegistrationBuilder, RegistrationSource};
use super::resolver::Resolver;
use super::scope::Container;
use super::spawner::{AsyncInstance, CollectionAggregate, FactoryFn, InstanceSpawner};
use super::Lifetime;
use crate::config::ContainerConfig;
use crate::errors::ContainerError;
use crate::logging::OperationTimer;
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::future::Future;
use std::sync::Arc;

/// 一组相关注册的安装器
pub trait Installer {
    fn install(&self, builder: &mut ContainerBuilder);
}

impl<F> Installer for F
where
    F: Fn(&mut ContainerBuilder),
{
    fn install(&self, builder: &mut ContainerBuilder) {
        self(builder)
    }
}

type BuildCallback = Box<dyn FnOnce(&Container) -> Result<(), ContainerError> + Send>;

pub struct ContainerBuilder {
    registrations: Vec<PendingRegistration>,
    callbacks: Vec<BuildCallback>,
    analyzer: Arc<TypeAnalyzer>,
    config: ContainerConfig,
    parent: Option<Container>,
}

impl Default for ContainerBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ContainerBuilder {
    pub fn new() -> Self {
        Self::with_config(ContainerConfig::default())
    }

    pub fn with_config(config: ContainerConfig) -> Self {
        Self {
            registrations: Vec::new(),
            callbacks: Vec::new(),
            analyzer: Arc::new(TypeAnalyzer::new()),
            config,
            parent: None,
        }
    }

    /// 使用外部共享的类型分析器（例如多个根容器共用一份缓存）
    pub fn with_analyzer(mut self, analyzer: Arc<TypeAnalyzer>) -> Self {
        self.analyzer = analyzer;
        self
    }

    pub(crate) fn for_child(parent: &Container) -> Self {
        let mut config = parent.config().clone();
        config.scope_name = format!("{}/{}", parent.info().name, parent.info().depth + 1);
        Self {
            registrations: Vec::new(),
            callbacks: Vec::new(),
            analyzer: parent.analyzer().clone(),
            config,
            parent: Some(parent.clone()),
        }
    }

    pub fn config(&self) -> &ContainerConfig {
        &self.config
    }

    pub fn analyzer(&self) -> &Arc<TypeAnalyzer> {
        &self.analyzer
    }

    pub fn set_scope_name(&mut self, name: impl Into<String>) -> &mut Self {
        self.config.scope_name = name.into();
        self
    }

    pub fn len(&self) -> usize {
        self.registrations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registrations.is_empty()
    }

    fn push<T: Send + Sync + 'static>(&mut self, pending: PendingRegistration) -> RegistrationBuilder<'_, T> {
        let index = self.registrations.len();
        self.registrations.push(pending);
        RegistrationBuilder::new(&mut self.registrations[index])
    }

    /// 注册由注入器构造的类型
    pub fn register<T: Injectable>(&mut self, lifetime: Lifetime) -> RegistrationBuilder<'_, T> {
        self.push(PendingRegistration::for_type::<T>(lifetime))
    }

    /// 注册已有的值；容器不会释放它
    pub fn register_instance<T: Send + Sync + 'static>(&mut self, value: T) -> RegistrationBuilder<'_, T> {
        self.register_arc(Arc::new(value))
    }

    pub fn register_arc<T: Send + Sync + 'static>(&mut self, value: Arc<T>) -> RegistrationBuilder<'_, T> {
        self.push(PendingRegistration::for_instance(value))
    }

    /// 注册以契约类型给出的已有实例，例如 `Arc<dyn Clock>`
    pub fn register_instance_as<I: ?Sized + Send + Sync + 'static>(
        &mut self,
        value: Arc<I>,
    ) -> RegistrationBuilder<'_, Arc<I>> {
        let instance: Instance = Arc::new(value);
        self.push(PendingRegistration::for_shared::<I>(
            Lifetime::Singleton,
            RegistrationSource::Instance(instance),
        ))
    }

    pub fn register_factory<T, F>(&mut self, lifetime: Lifetime, factory: F) -> RegistrationBuilder<'_, T>
    where
        T: Send + Sync + 'static,
        F: Fn(&dyn Resolver) -> Result<T, ContainerError> + Send + Sync + 'static,
    {
        let factory: Arc<FactoryFn> = Arc::new(move |resolver: &dyn Resolver| {
            let value = factory(resolver)?;
            Ok(Arc::new(value) as Instance)
        });
        self.push(PendingRegistration::for_factory::<T>(lifetime, factory))
    }

    /// 工厂直接产出契约类型的 `Arc<I>`
    pub fn register_factory_as<I, F>(&mut self, lifetime: Lifetime, factory: F) -> RegistrationBuilder<'_, Arc<I>>
    where
        I: ?Sized + Send + Sync + 'static,
        F: Fn(&dyn Resolver) -> Result<Arc<I>, ContainerError> + Send + Sync + 'static,
    {
        let factory: Arc<FactoryFn> = Arc::new(move |resolver: &dyn Resolver| {
            let value = factory(resolver)?;
            Ok(Arc::new(value) as Instance)
        });
        self.push(PendingRegistration::for_shared::<I>(
            lifetime,
            RegistrationSource::Factory(factory),
        ))
    }

    /// 异步工厂：解析结果是 [`AsyncInstance<T>`]，由调用方等待
    pub fn register_async_factory<T, F, Fut>(
        &mut self,
        lifetime: Lifetime,
        factory: F,
    ) -> RegistrationBuilder<'_, AsyncInstance<T>>
    where
        T: Send + Sync + 'static,
        F: Fn(&dyn Resolver) -> Result<Fut, ContainerError> + Send + Sync + 'static,
        Fut: Future<Output = Result<T, ContainerError>> + Send + 'static,
    {
        self.register_factory(lifetime, move |resolver| Ok(AsyncInstance::new(factory(resolver)?)))
    }

    /// 构建完成后按注册顺序执行一次
    pub fn register_build_callback<F>(&mut self, callback: F) -> &mut Self
    where
        F: FnOnce(&Container) -> Result<(), ContainerError> + Send + 'static,
    {
        self.callbacks.push(Box::new(callback));
        self
    }

    pub fn install(&mut self, installer: &dyn Installer) -> &mut Self {
        installer.install(self);
        self
    }

    /// 配置阶段查询：`T` 是否已在本构建器或父作用域链中注册
    pub fn exists<T: ?Sized + 'static>(&self) -> bool {
        self.exists_key(&ContractKey::of::<T>())
    }

    pub fn exists_key(&self, key: &ContractKey) -> bool {
        if self.registrations.iter().any(|pending| pending.declared_keys().contains(key)) {
            return true;
        }
        match &self.parent {
            Some(parent) => parent.is_registered_key(key),
            None => key.contract == ContractType::of::<Container>() && key.key.is_none(),
        }
    }

    pub fn build(self) -> Result<Container, ContainerError> {
        let timer = OperationTimer::new("container_build")
            .with_metadata("scope", &self.config.scope_name)
            .with_metadata("registrations", self.registrations.len());
        let ContainerBuilder {
            registrations,
            callbacks,
            analyzer,
            config,
            parent,
        } = self;

        let built = if config.parallel_build && registrations.len() > 1 {
            build_parallel(&registrations, &analyzer, config.worker_count())?
        } else {
            let all: Vec<usize> = (0..registrations.len()).collect();
            build_component(&registrations, &all, &analyzer).map_err(|(_, err)| err)?
        };
        let registry = Registry::assemble(built, parent.as_ref())?;

        let container = Container::from_parts(registry, analyzer, config, parent);
        for callback in callbacks {
            callback(&container)?;
        }
        tracing::debug!(
            scope = %container.info().name,
            registrations = container.registry().len(),
            "container built"
        );
        timer.finish();
        Ok(container)
    }
}

impl fmt::Debug for ContainerBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContainerBuilder")
            .field("registrations", &self.registrations)
            .field("callbacks", &self.callbacks.len())
            .field("config", &self.config)
            .finish()
    }
}

type Built = Vec<(usize, Arc<Registration>)>;

/// 构建一个子图；失败时带上出错注册的顺序号，合并后报告最靠前的错误
fn build_component(
    pending: &[PendingRegistration],
    members: &[usize],
    analyzer: &TypeAnalyzer,
) -> Result<Built, (usize, ContainerError)> {
    members
        .iter()
        .map(|&index| {
            pending[index]
                .build(analyzer)
                .map(|registration| (index, Arc::new(registration)))
                .map_err(|err| (index, err))
        })
        .collect()
}

fn build_parallel(
    pending: &[PendingRegistration],
    analyzer: &TypeAnalyzer,
    workers: usize,
) -> Result<Built, ContainerError> {
    let components = partition(pending, analyzer);
    let workers = workers.clamp(1, components.len().max(1));
    tracing::debug!(components = components.len(), workers, "parallel container build");

    // 大的子图先分配，尽量均衡
    let mut ordered: Vec<&Vec<usize>> = components.iter().collect();
    ordered.sort_by_key(|component| std::cmp::Reverse(component.len()));
    let mut buckets: Vec<Vec<&Vec<usize>>> = (0..workers).map(|_| Vec::new()).collect();
    for (index, component) in ordered.into_iter().enumerate() {
        buckets[index % workers].push(component);
    }

    let results: Vec<Result<Built, (usize, ContainerError)>> = std::thread::scope(|scope| {
        let handles: Vec<_> = buckets
            .into_iter()
            .map(|bucket| {
                scope.spawn(move || {
                    bucket
                        .into_iter()
                        .map(|component| build_component(pending, component, analyzer))
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        handles
            .into_iter()
            .flat_map(|handle| match handle.join() {
                Ok(results) => results,
                Err(payload) => std::panic::resume_unwind(payload),
            })
            .collect()
    });

    let mut built = Vec::with_capacity(pending.len());
    let mut first_error: Option<(usize, ContainerError)> = None;
    for result in results {
        match result {
            Ok(fragment) => built.extend(fragment),
            Err((index, err)) => {
                if first_error.as_ref().map_or(true, |(first, _)| index < *first) {
                    first_error = Some((index, err));
                }
            }
        }
    }
    if let Some((_, err)) = first_error {
        return Err(err);
    }
    built.sort_by_key(|(index, _)| *index);
    Ok(built)
}

/// 按共享契约和静态依赖把注册划分成互不相关的子图
fn partition(pending: &[PendingRegistration], analyzer: &TypeAnalyzer) -> Vec<Vec<usize>> {
    let inspected: Vec<_> = pending.iter().map(|p| p.inspect(analyzer)).collect();
    let mut sets = DisjointSet::new(pending.len());
    let mut providers: HashMap<ContractType, usize> = HashMap::new();
    for (index, (keys, _)) in inspected.iter().enumerate() {
        for key in keys {
            let provider = *providers.entry(key.contract).or_insert(index);
            sets.union(provider, index);
        }
    }
    for (index, (_, dependencies)) in inspected.iter().enumerate() {
        for dependency in dependencies {
            if let Some(&provider) = providers.get(&dependency.contract) {
                sets.union(provider, index);
            }
        }
    }

    let mut groups: Vec<Vec<usize>> = Vec::new();
    let mut group_of_root: HashMap<usize, usize> = HashMap::new();
    for index in 0..pending.len() {
        let root = sets.find(index);
        let group = *group_of_root.entry(root).or_insert_with(|| {
            groups.push(Vec::new());
            groups.len() - 1
        });
        groups[group].push(index);
    }
    groups
}

struct DisjointSet {
    parent: Vec<usize>,
}

impl DisjointSet {
    fn new(len: usize) -> Self {
        Self {
            parent: (0..len).collect(),
        }
    }

    fn find(&mut self, mut index: usize) -> usize {
        while self.parent[index] != index {
            self.parent[index] = self.parent[self.parent[index]];
            index = self.parent[index];
        }
        index
    }

    fn union(&mut self, a: usize, b: usize) {
        let (a, b) = (self.find(a), self.find(b));
        if a != b {
            self.parent[b.max(a)] = a.min(b);
        }
    }
}

struct CollectionGroup {
    key: ContractKey,
    element: ContractType,
    shape: AggregateShape,
    members: Vec<Arc<Registration>>,
}

/// 容器的不可变查找表
pub(crate) struct Registry {
    table: HashMap<ContractKey, Arc<Registration>>,
    owned: HashSet<u64>,
}

impl Registry {
    fn assemble(built: Built, parent: Option<&Container>) -> Result<Self, ContainerError> {
        let mut table: HashMap<ContractKey, Arc<Registration>> = HashMap::new();
        let mut owned = HashSet::new();
        let mut groups: Vec<CollectionGroup> = Vec::new();
        let mut group_index: HashMap<ContractKey, usize> = HashMap::new();

        for (_, registration) in built {
            owned.insert(registration.id());
            for binding in registration.bindings() {
                // 同一契约后注册的覆盖先注册的
                table.insert(
                    ContractKey::new(binding.contract(), registration.key().cloned()),
                    registration.clone(),
                );
                let Some(shape) = binding.aggregate() else {
                    continue;
                };
                let key = ContractKey::new(shape.contract, registration.key().cloned());
                let index = *group_index.entry(key.clone()).or_insert_with(|| {
                    groups.push(CollectionGroup {
                        key,
                        element: binding.contract(),
                        shape,
                        members: Vec::new(),
                    });
                    groups.len() - 1
                });
                groups[index].members.push(registration.clone());
            }
        }

        for group in groups {
            // 子作用域的集合追加在父作用域集合之后
            let mut children = parent
                .and_then(|parent| parent.collection_children(&group.key))
                .unwrap_or_default();
            children.extend(group.members);
            check_duplicate_singletons(&group.key, &children)?;

            let aggregate = Registration::new(
                group.shape.contract,
                vec![(group.shape.binding)()],
                group.key.key.clone(),
                Lifetime::Transient,
                InstanceSpawner::Collection(CollectionAggregate::new(group.element, children, group.shape.collect)),
            );
            // 显式注册的集合契约优先
            if let std::collections::hash_map::Entry::Vacant(entry) = table.entry(group.key) {
                owned.insert(aggregate.id());
                entry.insert(Arc::new(aggregate));
            }
        }

        if parent.is_none() {
            let key = ContractKey::of::<Container>();
            if !table.contains_key(&key) {
                let itself = Registration::new(
                    ContractType::of::<Container>(),
                    vec![super::contract::ContractBinding::new::<Container, Container>()],
                    None,
                    Lifetime::Transient,
                    InstanceSpawner::ContainerItself,
                );
                owned.insert(itself.id());
                table.insert(key, Arc::new(itself));
            }
        }

        Ok(Self { table, owned })
    }

    pub(crate) fn get(&self, key: &ContractKey) -> Option<&Arc<Registration>> {
        self.table.get(key)
    }

    pub(crate) fn owns(&self, registration_id: u64) -> bool {
        self.owned.contains(&registration_id)
    }

    pub(crate) fn len(&self) -> usize {
        self.table.len()
    }

    pub(crate) fn keys(&self) -> impl Iterator<Item = &ContractKey> + '_ {
        self.table.keys()
    }
}

/// 同一集合中同一实现类型只允许一个单例注册（已有实例也是单例）
fn check_duplicate_singletons(collection: &ContractKey, children: &[Arc<Registration>]) -> Result<(), ContainerError> {
    let mut seen: HashSet<ContractType> = HashSet::new();
    for child in children {
        if child.lifetime() == Lifetime::Singleton && !seen.insert(child.implementation()) {
            return Err(ContainerError::DuplicateSingletonInCollection {
                implementation: child.implementation().name(),
                collection: collection.to_string(),
            });
        }
    }
    Ok(())
}
