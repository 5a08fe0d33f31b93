//! 契约类型与类型擦除
//!
//! 解析结果在容器内部统一以 `Arc<dyn Any + Send + Sync>` 存放具体实现，
//! 契约绑定负责把它转换成调用方请求的 `Arc<T>`（`T` 可以是 trait object）。

use std::any::{Any, TypeId};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

/// 容器内部存放的实例（具体实现类型被擦除）
pub type Instance = Arc<dyn Any + Send + Sync>;

/// 装箱的 `Arc<T>`，`T` 为某个契约类型
pub type ErasedArc = Box<dyn Any + Send + Sync>;

/// 契约类型：解析时使用的查找类型
#[derive(Clone, Copy)]
pub struct ContractType {
    id: TypeId,
    name: &'static str,
}

impl ContractType {
    pub fn of<T: ?Sized + 'static>() -> Self {
        Self {
            id: TypeId::of::<T>(),
            name: std::any::type_name::<T>(),
        }
    }

    pub fn id(&self) -> TypeId {
        self.id
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl PartialEq for ContractType {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for ContractType {}

impl Hash for ContractType {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

impl fmt::Debug for ContractType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

impl fmt::Display for ContractType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

/// 查找键：契约类型 + 可选的 key
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub struct ContractKey {
    pub contract: ContractType,
    pub key: Option<Arc<str>>,
}

impl ContractKey {
    pub fn new(contract: ContractType, key: Option<Arc<str>>) -> Self {
        Self { contract, key }
    }

    pub fn of<T: ?Sized + 'static>() -> Self {
        Self::new(ContractType::of::<T>(), None)
    }

    pub fn keyed<T: ?Sized + 'static>(key: impl Into<Arc<str>>) -> Self {
        Self::new(ContractType::of::<T>(), Some(key.into()))
    }

    /// "`T` 的全部实现" 这一集合契约，值类型为 `Vec<Arc<T>>`
    pub fn collection_of<T: ?Sized + 'static>() -> Self {
        Self::of::<Vec<Arc<T>>>()
    }
}

impl fmt::Display for ContractKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.key {
            Some(key) => write!(f, "{}[{}]", self.contract, key),
            None => write!(f, "{}", self.contract),
        }
    }
}

/// 实现类型到契约类型的转换
///
/// 对每个类型自身有恒等实现；实现类型到 trait object 的转换通常由
/// [`implements!`](crate::implements) 宏生成。
pub trait Upcast<T: ?Sized> {
    fn upcast(self: Arc<Self>) -> Arc<T>;
}

impl<T: ?Sized + Send + Sync + 'static> Upcast<T> for T {
    fn upcast(self: Arc<Self>) -> Arc<T> {
        self
    }
}

/// 声明实现类型满足哪些 trait object 契约
///
/// ```ignore
/// implements!(EnglishGreeter => dyn Greeter, dyn Named);
/// ```
#[macro_export]
macro_rules! implements {
    ($implementation:ty => $($contract:ty),+ $(,)?) => {
        $(
            impl $crate::Upcast<$contract> for $implementation {
                fn upcast(self: ::std::sync::Arc<Self>) -> ::std::sync::Arc<$contract> {
                    self
                }
            }
        )+
    };
}

type CastFn = dyn Fn(&Instance) -> Option<ErasedArc> + Send + Sync;

/// 集合契约的构造方式（`Vec<Arc<T>>`）
#[derive(Clone, Copy)]
pub(crate) struct AggregateShape {
    pub(crate) contract: ContractType,
    pub(crate) binding: fn() -> ContractBinding,
    pub(crate) collect: fn(Vec<ErasedArc>) -> Option<Instance>,
}

/// 一个实现对某个契约的绑定：知道如何把擦除后的实例转换成 `Arc<Contract>`
#[derive(Clone)]
pub struct ContractBinding {
    contract: ContractType,
    cast: Arc<CastFn>,
    aggregate: Option<AggregateShape>,
}

impl ContractBinding {
    /// 实例以具体类型 `I` 存放，解析为 `Arc<T>`
    pub fn new<I, T>() -> Self
    where
        I: Upcast<T> + Send + Sync + 'static,
        T: ?Sized + Send + Sync + 'static,
    {
        Self {
            contract: ContractType::of::<T>(),
            cast: Arc::new(|instance: &Instance| {
                let concrete = instance.clone().downcast::<I>().ok()?;
                let contract: Arc<T> = <I as Upcast<T>>::upcast(concrete);
                Some(Box::new(contract) as ErasedArc)
            }),
            aggregate: Some(aggregate_shape::<T>()),
        }
    }

    /// 实例以 `Arc<T>` 本身存放（已有的 trait object 实例或工厂返回的 `Arc<T>`）
    pub fn shared<T>() -> Self
    where
        T: ?Sized + Send + Sync + 'static,
    {
        Self {
            contract: ContractType::of::<T>(),
            cast: Arc::new(|instance: &Instance| {
                let shared = instance.downcast_ref::<Arc<T>>()?;
                Some(Box::new(shared.clone()) as ErasedArc)
            }),
            aggregate: Some(aggregate_shape::<T>()),
        }
    }

    pub fn contract(&self) -> ContractType {
        self.contract
    }

    pub fn cast(&self, instance: &Instance) -> Option<ErasedArc> {
        (self.cast)(instance)
    }

    pub(crate) fn aggregate(&self) -> Option<AggregateShape> {
        self.aggregate
    }
}

impl fmt::Debug for ContractBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContractBinding")
            .field("contract", &self.contract)
            .finish()
    }
}

fn aggregate_shape<T: ?Sized + Send + Sync + 'static>() -> AggregateShape {
    AggregateShape {
        contract: ContractType::of::<Vec<Arc<T>>>(),
        binding: aggregate_binding::<T>,
        collect: collect_into::<T>,
    }
}

// 集合本身的绑定不再有集合形态，避免泛型无限展开
fn aggregate_binding<T: ?Sized + Send + Sync + 'static>() -> ContractBinding {
    ContractBinding {
        contract: ContractType::of::<Vec<Arc<T>>>(),
        cast: Arc::new(|instance: &Instance| {
            let items = instance.clone().downcast::<Vec<Arc<T>>>().ok()?;
            Some(Box::new(items) as ErasedArc)
        }),
        aggregate: None,
    }
}

fn collect_into<T: ?Sized + Send + Sync + 'static>(items: Vec<ErasedArc>) -> Option<Instance> {
    let items = items
        .into_iter()
        .map(|item| item.downcast::<Arc<T>>().ok().map(|boxed| *boxed))
        .collect::<Option<Vec<Arc<T>>>>()?;
    Some(Arc::new(items) as Instance)
}

/// 从擦除值中取回 `Arc<T>`
pub(crate) fn unerase<T: ?Sized + 'static>(
    value: ErasedArc,
    context: impl FnOnce() -> String,
) -> Result<Arc<T>, crate::errors::ContainerError> {
    value
        .downcast::<Arc<T>>()
        .map(|boxed| *boxed)
        .map_err(|_| crate::errors::ContainerError::TypeMismatch {
            expected: std::any::type_name::<T>(),
            context: context(),
        })
}
