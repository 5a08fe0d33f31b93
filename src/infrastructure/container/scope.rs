//! 容器：解析器 + 作用域节点
//!
//! 作用域组成一棵树。子作用域持有父作用域的强引用，父作用域只记录存活子作用域的数量。
//! 单例缓存在声明该注册的作用域上，所有后代共享；作用域缓存只属于当前节点。
//!
//! 句柄分两种：`build`/`create_scope` 返回的句柄及其克隆拥有作用域；
//! 解析 `Container` 得到的是非拥有句柄，被缓存实例持有时不会让作用域无法回收。
//! 最后一个拥有句柄丢弃时，未 dispose 的作用域被放弃：清空缓存、
//! 从父作用域的存活计数中移除，之后经非拥有句柄访问按已释放处理。

use super::analyzer::{Injectable, TypeAnalyzer};
use super::builder::{ContainerBuilder, Installer, Registry};
use super::cache::{Cached, ConstructionLock, InstanceCache};
use super::contract::{unerase, ContractKey, ErasedArc, Instance};
use super::disposal::DisposalTracker;
use super::injector::InjectParameter;
use super::registration::Registration;
use super::resolver::{ResolutionStack, ResolveContext, Resolver};
use super::spawner::InstanceSpawner;
use super::Lifetime;
use crate::config::ContainerConfig;
use crate::errors::ContainerError;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

/// 作用域信息
#[derive(Debug, Clone)]
pub struct ScopeInfo {
    pub id: uuid::Uuid,
    pub name: String,
    pub parent_id: Option<uuid::Uuid>,
    /// 根作用域为 0
    pub depth: usize,
    pub created_at: Instant,
}

/// 容器统计信息
#[derive(Debug, Clone, Default)]
pub struct ContainerStats {
    pub total_resolutions: usize,
    pub cache_hits: usize,
    pub cache_misses: usize,
    pub transient_creations: usize,
    pub scoped_creations: usize,
    pub singleton_creations: usize,
    pub disposed_instances: usize,
    /// 当前缓存中的单例数量
    pub active_singletons: usize,
    pub active_scoped: usize,
    pub tracked_disposables: usize,
    /// 查找表条目数（含集合聚合与容器自身）
    pub registrations: usize,
}

impl ContainerStats {
    pub fn total(&self) -> usize {
        self.total_resolutions
    }

    /// 缓存命中率（只计算单例/作用域实例的查找）
    pub fn hit_rate(&self) -> f64 {
        let lookups = self.cache_hits + self.cache_misses;
        if lookups == 0 {
            0.0
        } else {
            self.cache_hits as f64 / lookups as f64
        }
    }

    pub fn summary(&self) -> String {
        format!(
            "resolutions={} hit_rate={:.1}% created(transient/scoped/singleton)={}/{}/{} disposed={}",
            self.total_resolutions,
            self.hit_rate() * 100.0,
            self.transient_creations,
            self.scoped_creations,
            self.singleton_creations,
            self.disposed_instances
        )
    }
}

#[derive(Default)]
struct StatsCounters {
    total_resolutions: AtomicUsize,
    cache_hits: AtomicUsize,
    cache_misses: AtomicUsize,
    transient_creations: AtomicUsize,
    scoped_creations: AtomicUsize,
    singleton_creations: AtomicUsize,
    disposed_instances: AtomicUsize,
}

struct ScopeInner {
    info: ScopeInfo,
    registry: Registry,
    singletons: InstanceCache,
    scoped: InstanceCache,
    tracker: DisposalTracker,
    parent: Option<Container>,
    analyzer: Arc<TypeAnalyzer>,
    config: ContainerConfig,
    disposed: AtomicBool,
    detached: AtomicBool,
    live_children: AtomicUsize,
    /// 拥有句柄数量
    handles: AtomicUsize,
    stats: StatsCounters,
}

impl ScopeInner {
    /// 从父作用域的存活计数中移除，只生效一次
    fn detach(&self) {
        if !self.detached.swap(true, Ordering::SeqCst) {
            if let Some(parent) = &self.parent {
                parent.inner.live_children.fetch_sub(1, Ordering::SeqCst);
            }
        }
    }
}

impl Drop for ScopeInner {
    fn drop(&mut self) {
        self.detach();
    }
}

/// 依赖注入容器（作用域节点）
///
/// 克隆得到的是同一作用域的另一个句柄，拥有性随原句柄。
pub struct Container {
    inner: Arc<ScopeInner>,
    owning: bool,
}

impl Clone for Container {
    fn clone(&self) -> Self {
        if self.owning {
            self.inner.handles.fetch_add(1, Ordering::SeqCst);
        }
        Self {
            inner: self.inner.clone(),
            owning: self.owning,
        }
    }
}

impl Drop for Container {
    fn drop(&mut self) {
        if self.owning && self.inner.handles.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.abandon();
        }
    }
}

impl Container {
    pub fn builder() -> ContainerBuilder {
        ContainerBuilder::new()
    }

    pub(crate) fn from_parts(
        registry: Registry,
        analyzer: Arc<TypeAnalyzer>,
        config: ContainerConfig,
        parent: Option<Container>,
    ) -> Self {
        let info = ScopeInfo {
            id: uuid::Uuid::new_v4(),
            name: config.scope_name.clone(),
            parent_id: parent.as_ref().map(|p| p.info().id),
            depth: parent.as_ref().map_or(0, |p| p.info().depth + 1),
            created_at: Instant::now(),
        };
        // 子作用域总是拥有父作用域
        let parent = parent.map(|p| p.retain());
        if let Some(parent) = &parent {
            parent.inner.live_children.fetch_add(1, Ordering::SeqCst);
        }
        tracing::debug!(scope = %info.name, id = %info.id, depth = info.depth, "scope created");
        let construction = Arc::new(ConstructionLock::new());
        Self {
            inner: Arc::new(ScopeInner {
                info,
                registry,
                singletons: InstanceCache::with_lock(construction.clone()),
                scoped: InstanceCache::with_lock(construction),
                tracker: DisposalTracker::new(),
                parent,
                analyzer,
                config,
                disposed: AtomicBool::new(false),
                detached: AtomicBool::new(false),
                live_children: AtomicUsize::new(0),
                handles: AtomicUsize::new(1),
                stats: StatsCounters::default(),
            }),
            owning: true,
        }
    }

    /// 新的拥有句柄
    fn retain(&self) -> Container {
        self.inner.handles.fetch_add(1, Ordering::SeqCst);
        Container {
            inner: self.inner.clone(),
            owning: true,
        }
    }

    /// 不阻止作用域回收的句柄，解析 `Container` 时返回它
    pub(crate) fn non_owning(&self) -> Container {
        Container {
            inner: self.inner.clone(),
            owning: false,
        }
    }

    /// 句柄是否拥有作用域
    pub fn is_owning(&self) -> bool {
        self.owning
    }

    /// 最后一个拥有句柄丢弃：释放缓存引用，打断实例对作用域的回指
    fn abandon(&self) {
        if !self.inner.disposed.swap(true, Ordering::SeqCst) {
            tracing::debug!(scope = %self.inner.info.name, "scope dropped without dispose");
        }
        self.inner.detach();
        self.inner.scoped.clear();
        self.inner.singletons.clear();
        self.inner.tracker.clear();
    }

    pub(crate) fn registry(&self) -> &Registry {
        &self.inner.registry
    }

    pub fn info(&self) -> &ScopeInfo {
        &self.inner.info
    }

    pub fn parent(&self) -> Option<&Container> {
        self.inner.parent.as_ref()
    }

    pub fn analyzer(&self) -> &Arc<TypeAnalyzer> {
        &self.inner.analyzer
    }

    pub fn config(&self) -> &ContainerConfig {
        &self.inner.config
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.disposed.load(Ordering::SeqCst)
    }

    pub fn live_children(&self) -> usize {
        self.inner.live_children.load(Ordering::SeqCst)
    }

    /// 两个句柄是否指向同一作用域
    pub fn same_scope(&self, other: &Container) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    fn ensure_live(&self) -> Result<(), ContainerError> {
        if self.is_disposed() {
            return Err(ContainerError::DisposedContainerAccess {
                scope: self.inner.info.name.clone(),
            });
        }
        Ok(())
    }

    fn ancestors(&self) -> impl Iterator<Item = &Container> + '_ {
        std::iter::successors(Some(self), |scope| scope.parent())
    }

    /// 沿作用域链向上查找注册
    pub(crate) fn find_registration(&self, key: &ContractKey) -> Option<Arc<Registration>> {
        self.ancestors()
            .find_map(|scope| scope.inner.registry.get(key))
            .cloned()
    }

    pub fn is_registered<T: ?Sized + 'static>(&self) -> bool {
        self.is_registered_key(&ContractKey::of::<T>())
    }

    pub fn is_registered_key(&self, key: &ContractKey) -> bool {
        self.find_registration(key).is_some()
    }

    /// 本作用域可见的全部查找键（含祖先）
    pub fn registered_keys(&self) -> Vec<ContractKey> {
        let mut keys: Vec<ContractKey> = Vec::new();
        for scope in self.ancestors() {
            for key in scope.inner.registry.keys() {
                if !keys.contains(key) {
                    keys.push(key.clone());
                }
            }
        }
        keys
    }

    /// 集合契约当前的子注册，供子作用域合并
    pub(crate) fn collection_children(&self, key: &ContractKey) -> Option<Vec<Arc<Registration>>> {
        let registration = self.find_registration(key)?;
        match registration.spawner() {
            InstanceSpawner::Collection(aggregate) => Some(aggregate.children().to_vec()),
            _ => None,
        }
    }

    pub(crate) fn resolve_with(&self, key: &ContractKey, stack: &ResolutionStack) -> Result<ErasedArc, ContainerError> {
        self.try_resolve_with(key, stack)?
            .ok_or_else(|| ContainerError::NotRegistered {
                contract: key.to_string(),
            })
    }

    pub(crate) fn try_resolve_with(
        &self,
        key: &ContractKey,
        stack: &ResolutionStack,
    ) -> Result<Option<ErasedArc>, ContainerError> {
        self.ensure_live()?;
        let Some(registration) = self.find_registration(key) else {
            return Ok(None);
        };
        let instance = self.resolve_registration(&registration, stack)?;
        registration.cast(key.contract, &instance).map(Some)
    }

    /// 带调用级覆盖的解析
    ///
    /// 与契约直接匹配的覆盖值原样返回；其余覆盖在本次调用需要构造实例时
    /// 优先于注册时的覆盖参与构造函数与成员注入。
    pub fn resolve_with_overrides<T: ?Sized + 'static>(
        &self,
        overrides: &[InjectParameter],
    ) -> Result<Arc<T>, ContainerError> {
        self.ensure_live()?;
        let key = ContractKey::of::<T>();
        if let Some(found) = overrides.iter().find(|p| p.matches_key(&key)) {
            return unerase(found.value(), || format!("override of {}", key));
        }
        let registration = self
            .find_registration(&key)
            .ok_or_else(|| ContainerError::NotRegistered {
                contract: key.to_string(),
            })?;
        let stack = ResolutionStack::new();
        let instance = self.resolve_registration_with(&registration, &stack, overrides)?;
        unerase(registration.cast(key.contract, &instance)?, || format!("resolve of {}", key))
    }

    pub(crate) fn resolve_registration(
        &self,
        registration: &Arc<Registration>,
        stack: &ResolutionStack,
    ) -> Result<Instance, ContainerError> {
        self.resolve_registration_with(registration, stack, &[])
    }

    fn resolve_registration_with(
        &self,
        registration: &Arc<Registration>,
        stack: &ResolutionStack,
        overrides: &[InjectParameter],
    ) -> Result<Instance, ContainerError> {
        self.count(&self.inner.stats.total_resolutions);
        tracing::trace!(
            scope = %self.inner.info.name,
            implementation = %registration.implementation(),
            lifetime = ?registration.lifetime(),
            depth = stack.depth(),
            "resolve"
        );
        match registration.lifetime() {
            Lifetime::Transient => {
                let context = ResolveContext::new(self, stack);
                let instance = registration.spawner().spawn(registration, &context, overrides, &|_: &Instance| {})?;
                self.count(&self.inner.stats.transient_creations);
                if self.inner.config.track_transient_disposables {
                    self.track_disposal(registration, &instance);
                }
                Ok(instance)
            }
            Lifetime::Scoped => self.resolve_cached(&self.inner.scoped, registration, stack, overrides),
            Lifetime::Singleton => {
                let owner = self.owner_of(registration);
                owner.ensure_live()?;
                owner.resolve_cached(&owner.inner.singletons, registration, stack, overrides)
            }
        }
    }

    fn resolve_cached(
        &self,
        cache: &InstanceCache,
        registration: &Arc<Registration>,
        stack: &ResolutionStack,
        overrides: &[InjectParameter],
    ) -> Result<Instance, ContainerError> {
        let context = ResolveContext::new(self, stack);
        let cached = cache.get_or_spawn(registration.id(), |publish| {
            registration.spawner().spawn(registration, &context, overrides, publish)
        })?;
        match cached {
            Cached::Hit(instance) => {
                self.count(&self.inner.stats.cache_hits);
                Ok(instance)
            }
            Cached::Created(instance) => {
                let stats = &self.inner.stats;
                self.count(&stats.cache_misses);
                match registration.lifetime() {
                    Lifetime::Singleton => self.count(&stats.singleton_creations),
                    _ => self.count(&stats.scoped_creations),
                }
                tracing::trace!(
                    scope = %self.inner.info.name,
                    implementation = %registration.implementation(),
                    "instance cached"
                );
                self.track_disposal(registration, &instance);
                Ok(instance)
            }
        }
    }

    /// 声明该注册的作用域（可能是祖先）
    fn owner_of(&self, registration: &Registration) -> &Container {
        self.ancestors()
            .find(|scope| scope.inner.registry.owns(registration.id()))
            .unwrap_or(self)
    }

    fn track_disposal(&self, registration: &Registration, instance: &Instance) {
        if let Some(disposer) = registration.disposer() {
            self.inner.tracker.track(instance.clone(), disposer.clone());
        }
    }

    fn count(&self, counter: &AtomicUsize) {
        if self.inner.config.collect_stats {
            counter.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// 创建子作用域
    pub fn create_scope(&self) -> Result<Container, ContainerError> {
        self.create_scope_with(|_| {})
    }

    /// 创建子作用域并追加注册；子作用域的注册可以遮蔽父作用域的同名契约
    pub fn create_scope_with<F>(&self, configure: F) -> Result<Container, ContainerError>
    where
        F: FnOnce(&mut ContainerBuilder),
    {
        self.ensure_live()?;
        let mut builder = ContainerBuilder::for_child(self);
        configure(&mut builder);
        builder.build()
    }

    pub fn create_scope_with_installer(&self, installer: &dyn Installer) -> Result<Container, ContainerError> {
        self.create_scope_with(|builder| installer.install(builder))
    }

    /// 对容器外部创建的实例执行成员与方法注入
    pub fn inject<T: Injectable>(&self, instance: &Arc<T>) -> Result<(), ContainerError> {
        self.inject_with(instance, &[])
    }

    pub fn inject_with<T: Injectable>(
        &self,
        instance: &Arc<T>,
        overrides: &[InjectParameter],
    ) -> Result<(), ContainerError> {
        self.ensure_live()?;
        let injector = self.inner.analyzer.injector_for::<T>()?;
        let target: Instance = instance.clone();
        let stack = ResolutionStack::new();
        let context = ResolveContext::new(self, &stack);
        injector.inject(&target, &context, overrides)
    }

    /// 释放本作用域
    ///
    /// 按创建顺序逆序释放记录的实例，然后标记为已释放。仍有存活子作用域时
    /// 返回 `LiveChildScopes` 且不释放任何东西。重复调用无副作用。
    pub fn dispose(&self) -> Result<(), ContainerError> {
        let children = self.live_children();
        if children > 0 {
            tracing::warn!(
                scope = %self.inner.info.name,
                children,
                "refusing to dispose scope with live children"
            );
            return Err(ContainerError::LiveChildScopes {
                scope: self.inner.info.name.clone(),
                children,
            });
        }
        if self.inner.disposed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        let disposed = self.inner.tracker.dispose_all();
        self.inner.stats.disposed_instances.fetch_add(disposed, Ordering::Relaxed);
        self.inner.scoped.clear();
        self.inner.singletons.clear();
        self.inner.detach();
        tracing::debug!(scope = %self.inner.info.name, disposed, "scope disposed");
        Ok(())
    }

    pub fn stats(&self) -> ContainerStats {
        let stats = &self.inner.stats;
        let load = |counter: &AtomicUsize| counter.load(Ordering::Relaxed);
        ContainerStats {
            total_resolutions: load(&stats.total_resolutions),
            cache_hits: load(&stats.cache_hits),
            cache_misses: load(&stats.cache_misses),
            transient_creations: load(&stats.transient_creations),
            scoped_creations: load(&stats.scoped_creations),
            singleton_creations: load(&stats.singleton_creations),
            disposed_instances: load(&stats.disposed_instances),
            active_singletons: self.inner.singletons.len(),
            active_scoped: self.inner.scoped.len(),
            tracked_disposables: self.inner.tracker.len(),
            registrations: self.inner.registry.len(),
        }
    }
}

impl Resolver for Container {
    fn resolve_key(&self, key: &ContractKey) -> Result<ErasedArc, ContainerError> {
        self.resolve_with(key, &ResolutionStack::new())
    }

    fn try_resolve_key(&self, key: &ContractKey) -> Result<Option<ErasedArc>, ContainerError> {
        self.try_resolve_with(key, &ResolutionStack::new())
    }

    fn scope(&self) -> &Container {
        self
    }
}

impl fmt::Debug for Container {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Container")
            .field("name", &self.inner.info.name)
            .field("id", &self.inner.info.id)
            .field("depth", &self.inner.info.depth)
            .field("registrations", &self.inner.registry.len())
            .field("disposed", &self.is_disposed())
            .finish()
    }
}
