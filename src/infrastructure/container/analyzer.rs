//! 类型分析器
//!
//! 类型通过实现 [`Injectable`] 显式声明自己的构造方式与注入成员，
//! 分析器把声明整理为不可变的 [`ConstructionDescriptor`] 并按类型缓存。

use super::contract::{unerase, ContractBinding, ContractKey, ContractType, ErasedArc, Instance, Upcast};
use super::disposal::{disposer_for, Disposable, Disposer};
use super::injector::{Arguments, Injector, ReflectionInjector};
use crate::errors::ContainerError;
use dashmap::DashMap;
use std::any::TypeId;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

/// 可被容器构造/注入的类型
pub trait Injectable: Send + Sync + Sized + 'static {
    /// 声明构造函数、注入成员、实现的契约
    fn describe(descriptor: &mut DescriptorBuilder<Self>);

    /// 预先生成的注入器；返回 `Some` 时优先于通用注入器
    fn compiled_injector() -> Option<Arc<dyn Injector>> {
        None
    }
}

/// 构造参数或注入成员所需的依赖
#[derive(Debug, Clone)]
pub struct ParameterInfo {
    pub name: &'static str,
    pub contract: ContractKey,
}

type InvokeCtor = dyn Fn(&mut Arguments) -> Result<Instance, ContainerError> + Send + Sync;
type AssignMember = dyn Fn(&Instance, ErasedArc) -> Result<(), ContainerError> + Send + Sync;
type InvokeMethod = dyn Fn(&Instance, &mut Arguments) -> Result<(), ContainerError> + Send + Sync;

pub struct ConstructorInfo {
    pub params: Vec<ParameterInfo>,
    pub designated: bool,
    invoke: Arc<InvokeCtor>,
}

impl ConstructorInfo {
    pub(crate) fn invoke(&self, arguments: &mut Arguments) -> Result<Instance, ContainerError> {
        (self.invoke)(arguments)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemberKind {
    Field,
    Property,
}

pub struct MemberInfo {
    pub kind: MemberKind,
    pub parameter: ParameterInfo,
    assign: Arc<AssignMember>,
}

impl MemberInfo {
    pub(crate) fn assign(&self, instance: &Instance, value: ErasedArc) -> Result<(), ContainerError> {
        (self.assign)(instance, value)
    }
}

pub struct MethodInfo {
    pub name: &'static str,
    pub params: Vec<ParameterInfo>,
    invoke: Arc<InvokeMethod>,
}

impl MethodInfo {
    pub(crate) fn invoke(&self, instance: &Instance, arguments: &mut Arguments) -> Result<(), ContainerError> {
        (self.invoke)(instance, arguments)
    }
}

/// 某个具体类型的构造计划：选定的构造函数、注入成员、注入方法
pub struct ConstructionDescriptor {
    implementation: ContractType,
    constructors: Vec<ConstructorInfo>,
    selected: Option<usize>,
    members: Vec<MemberInfo>,
    methods: Vec<MethodInfo>,
    interfaces: Vec<ContractBinding>,
    disposer: Option<Disposer>,
}

impl ConstructionDescriptor {
    fn from_declaration<T: Injectable>() -> Result<Self, ContainerError> {
        let mut builder = DescriptorBuilder::<T>::new();
        T::describe(&mut builder);

        let implementation = ContractType::of::<T>();
        let designated: Vec<usize> = builder
            .constructors
            .iter()
            .enumerate()
            .filter(|(_, ctor)| ctor.designated)
            .map(|(index, _)| index)
            .collect();
        if designated.len() > 1 {
            return Err(ContainerError::AmbiguousConstructor {
                implementation: implementation.name(),
                count: designated.len(),
            });
        }

        // 未标记时选参数最多的构造函数，并列取先声明的
        let selected = designated.first().copied().or_else(|| {
            let mut best: Option<(usize, usize)> = None;
            for (index, ctor) in builder.constructors.iter().enumerate() {
                if best.map_or(true, |(_, count)| ctor.params.len() > count) {
                    best = Some((index, ctor.params.len()));
                }
            }
            best.map(|(index, _)| index)
        });

        Ok(Self {
            implementation,
            constructors: builder.constructors,
            selected,
            members: builder.members,
            methods: builder.methods,
            interfaces: builder.interfaces,
            disposer: builder.disposer,
        })
    }

    pub fn implementation(&self) -> ContractType {
        self.implementation
    }

    /// 选定的注入构造函数
    pub fn constructor(&self) -> Option<&ConstructorInfo> {
        self.selected.map(|index| &self.constructors[index])
    }

    pub fn constructors(&self) -> &[ConstructorInfo] {
        &self.constructors
    }

    pub fn members(&self) -> &[MemberInfo] {
        &self.members
    }

    pub fn methods(&self) -> &[MethodInfo] {
        &self.methods
    }

    /// 声明实现的契约（用于 `as_implemented_interfaces` 与动态绑定校验）
    pub fn interfaces(&self) -> &[ContractBinding] {
        &self.interfaces
    }

    pub fn interface(&self, contract: ContractType) -> Option<&ContractBinding> {
        self.interfaces.iter().find(|binding| binding.contract() == contract)
    }

    pub fn disposer(&self) -> Option<&Disposer> {
        self.disposer.as_ref()
    }

    /// 全部依赖契约：构造参数、成员、方法参数
    pub fn dependencies(&self) -> impl Iterator<Item = &ContractKey> + '_ {
        self.constructor()
            .into_iter()
            .flat_map(|ctor| ctor.params.iter())
            .chain(self.members.iter().map(|member| &member.parameter))
            .chain(self.methods.iter().flat_map(|method| method.params.iter()))
            .map(|parameter| &parameter.contract)
    }
}

impl fmt::Debug for ConstructionDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConstructionDescriptor")
            .field("implementation", &self.implementation)
            .field("constructor", &self.constructor().map(|ctor| &ctor.params))
            .field("members", &self.members.iter().map(|m| m.parameter.name).collect::<Vec<_>>())
            .field("methods", &self.methods.iter().map(|m| m.name).collect::<Vec<_>>())
            .field("interfaces", &self.interfaces)
            .finish()
    }
}

/// `Injectable::describe` 使用的声明构建器
pub struct DescriptorBuilder<T> {
    constructors: Vec<ConstructorInfo>,
    members: Vec<MemberInfo>,
    methods: Vec<MethodInfo>,
    interfaces: Vec<ContractBinding>,
    disposer: Option<Disposer>,
    _marker: PhantomData<fn() -> T>,
}

impl<T: Injectable> DescriptorBuilder<T> {
    fn new() -> Self {
        Self {
            constructors: Vec::new(),
            members: Vec::new(),
            methods: Vec::new(),
            interfaces: Vec::new(),
            disposer: None,
            _marker: PhantomData,
        }
    }

    pub fn constructor(&mut self) -> ConstructorBuilder<'_, T> {
        ConstructorBuilder {
            owner: self,
            params: Vec::new(),
            designated: false,
        }
    }

    pub fn field<D, F>(&mut self, name: &'static str, assign: F) -> &mut Self
    where
        D: ?Sized + Send + Sync + 'static,
        F: Fn(&T, Arc<D>) + Send + Sync + 'static,
    {
        self.member(MemberKind::Field, name, ContractKey::of::<D>(), assign)
    }

    pub fn keyed_field<D, F>(&mut self, name: &'static str, key: &'static str, assign: F) -> &mut Self
    where
        D: ?Sized + Send + Sync + 'static,
        F: Fn(&T, Arc<D>) + Send + Sync + 'static,
    {
        self.member(MemberKind::Field, name, ContractKey::keyed::<D>(key), assign)
    }

    pub fn property<D, F>(&mut self, name: &'static str, assign: F) -> &mut Self
    where
        D: ?Sized + Send + Sync + 'static,
        F: Fn(&T, Arc<D>) + Send + Sync + 'static,
    {
        self.member(MemberKind::Property, name, ContractKey::of::<D>(), assign)
    }

    fn member<D, F>(&mut self, kind: MemberKind, name: &'static str, contract: ContractKey, assign: F) -> &mut Self
    where
        D: ?Sized + Send + Sync + 'static,
        F: Fn(&T, Arc<D>) + Send + Sync + 'static,
    {
        let assign = move |instance: &Instance, value: ErasedArc| {
            let target = downcast_target::<T>(instance)?;
            let value = unerase::<D>(value, || format!("member '{}' of {}", name, std::any::type_name::<T>()))?;
            assign(target, value);
            Ok(())
        };
        self.members.push(MemberInfo {
            kind,
            parameter: ParameterInfo { name, contract },
            assign: Arc::new(assign),
        });
        self
    }

    pub fn method(&mut self, name: &'static str) -> MethodBuilder<'_, T> {
        MethodBuilder {
            owner: self,
            name,
            params: Vec::new(),
        }
    }

    /// 声明 `T` 满足契约 `I`
    pub fn implements<I>(&mut self) -> &mut Self
    where
        I: ?Sized + Send + Sync + 'static,
        T: Upcast<I>,
    {
        self.interfaces.push(ContractBinding::new::<T, I>());
        self
    }

    pub fn disposable(&mut self) -> &mut Self
    where
        T: Disposable,
    {
        self.disposer = Some(disposer_for::<T>());
        self
    }
}

fn downcast_target<T: 'static>(instance: &Instance) -> Result<&T, ContainerError> {
    instance
        .downcast_ref::<T>()
        .ok_or_else(|| ContainerError::TypeMismatch {
            expected: std::any::type_name::<T>(),
            context: "injection target".to_string(),
        })
}

pub struct ConstructorBuilder<'a, T> {
    owner: &'a mut DescriptorBuilder<T>,
    params: Vec<ParameterInfo>,
    designated: bool,
}

impl<'a, T: Injectable> ConstructorBuilder<'a, T> {
    pub fn param<D: ?Sized + 'static>(mut self, name: &'static str) -> Self {
        self.params.push(ParameterInfo {
            name,
            contract: ContractKey::of::<D>(),
        });
        self
    }

    pub fn keyed_param<D: ?Sized + 'static>(mut self, name: &'static str, key: &'static str) -> Self {
        self.params.push(ParameterInfo {
            name,
            contract: ContractKey::keyed::<D>(key),
        });
        self
    }

    /// 标记为注入构造函数
    pub fn inject(mut self) -> Self {
        self.designated = true;
        self
    }

    pub fn build<F>(self, construct: F) -> &'a mut DescriptorBuilder<T>
    where
        F: Fn(&mut Arguments) -> Result<T, ContainerError> + Send + Sync + 'static,
    {
        let invoke = move |arguments: &mut Arguments| {
            let value = construct(arguments)?;
            Ok(Arc::new(value) as Instance)
        };
        self.owner.constructors.push(ConstructorInfo {
            params: self.params,
            designated: self.designated,
            invoke: Arc::new(invoke),
        });
        self.owner
    }
}

pub struct MethodBuilder<'a, T> {
    owner: &'a mut DescriptorBuilder<T>,
    name: &'static str,
    params: Vec<ParameterInfo>,
}

impl<'a, T: Injectable> MethodBuilder<'a, T> {
    pub fn param<D: ?Sized + 'static>(mut self, name: &'static str) -> Self {
        self.params.push(ParameterInfo {
            name,
            contract: ContractKey::of::<D>(),
        });
        self
    }

    pub fn keyed_param<D: ?Sized + 'static>(mut self, name: &'static str, key: &'static str) -> Self {
        self.params.push(ParameterInfo {
            name,
            contract: ContractKey::keyed::<D>(key),
        });
        self
    }

    pub fn build<F>(self, invoke: F) -> &'a mut DescriptorBuilder<T>
    where
        F: Fn(&T, &mut Arguments) -> Result<(), ContainerError> + Send + Sync + 'static,
    {
        let invoke = move |instance: &Instance, arguments: &mut Arguments| {
            let target = downcast_target::<T>(instance)?;
            invoke(target, arguments)
        };
        self.owner.methods.push(MethodInfo {
            name: self.name,
            params: self.params,
            invoke: Arc::new(invoke),
        });
        self.owner
    }
}

#[derive(Clone)]
struct CachedInjector {
    injector: Arc<dyn Injector>,
    compiled: bool,
}

/// 构造描述与注入器缓存
///
/// 显式创建后以 `Arc` 在构建器、容器和子作用域之间共享，不使用全局状态。
#[derive(Default)]
pub struct TypeAnalyzer {
    descriptors: DashMap<TypeId, Arc<ConstructionDescriptor>>,
    injectors: DashMap<TypeId, CachedInjector>,
}

impl TypeAnalyzer {
    pub fn new() -> Self {
        Self::default()
    }

    /// 分析类型（按类型缓存，并发调用幂等）
    pub fn analyze<T: Injectable>(&self) -> Result<Arc<ConstructionDescriptor>, ContainerError> {
        let type_id = TypeId::of::<T>();
        if let Some(cached) = self.descriptors.get(&type_id) {
            return Ok(cached.clone());
        }
        let descriptor = Arc::new(ConstructionDescriptor::from_declaration::<T>()?);
        tracing::trace!(implementation = std::any::type_name::<T>(), "analyzed type");
        // 并发计算时保留先写入的那一份
        Ok(self.descriptors.entry(type_id).or_insert(descriptor).clone())
    }

    /// 获取类型的注入器：已注册的编译注入器 > `Injectable::compiled_injector` > 通用注入器
    pub fn injector_for<T: Injectable>(&self) -> Result<Arc<dyn Injector>, ContainerError> {
        Ok(self.cached_injector::<T>()?.injector)
    }

    /// 用于构造新实例的注入器；通用注入器要求类型有可用的构造函数
    pub fn construction_injector<T: Injectable>(&self) -> Result<Arc<dyn Injector>, ContainerError> {
        let cached = self.cached_injector::<T>()?;
        if !cached.compiled && self.analyze::<T>()?.constructor().is_none() {
            return Err(ContainerError::NoInjectableConstructor {
                implementation: std::any::type_name::<T>(),
            });
        }
        Ok(cached.injector)
    }

    fn cached_injector<T: Injectable>(&self) -> Result<CachedInjector, ContainerError> {
        let type_id = TypeId::of::<T>();
        if let Some(cached) = self.injectors.get(&type_id) {
            return Ok(cached.clone());
        }
        let cached = match T::compiled_injector() {
            Some(injector) => CachedInjector {
                injector,
                compiled: true,
            },
            None => CachedInjector {
                injector: Arc::new(ReflectionInjector::new(self.analyze::<T>()?)),
                compiled: false,
            },
        };
        Ok(self.injectors.entry(type_id).or_insert(cached).clone())
    }

    /// 注册外部生成的注入器
    pub fn register_compiled<T: 'static>(&self, injector: Arc<dyn Injector>) {
        self.injectors.insert(
            TypeId::of::<T>(),
            CachedInjector {
                injector,
                compiled: true,
            },
        );
    }

    pub fn is_analyzed<T: 'static>(&self) -> bool {
        self.descriptors.contains_key(&TypeId::of::<T>())
    }

    /// 已分析的全部描述（只读，供元数据导出使用）
    pub fn descriptors(&self) -> Vec<Arc<ConstructionDescriptor>> {
        self.descriptors.iter().map(|entry| entry.value().clone()).collect()
    }
}

impl fmt::Debug for TypeAnalyzer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TypeAnalyzer")
            .field("descriptors", &self.descriptors.len())
            .field("injectors", &self.injectors.len())
            .finish()
    }
}
