//! 作用域实例缓存
//!
//! 每个注册一个槽位。同一作用域的所有槽位共用一把可重入的构造锁：
//! 构造期间跨槽位的回环（成员注入）只会在持锁线程内重入，不会形成锁顺序。
//! 构造线程在成员注入阶段重入时可以拿到已发布但尚未完成注入的实例，
//! 其他线程看不到它。

use super::contract::Instance;
use crate::errors::ContainerError;
use dashmap::DashMap;
use parking_lot::{Mutex, ReentrantMutex};
use std::cell::{Cell, RefCell};
use std::sync::Arc;

#[derive(Default)]
struct InstanceSlot {
    ready: Mutex<Option<Instance>>,
    pending: Mutex<Option<Instance>>,
}

#[derive(Default)]
struct BuildJournal {
    depth: usize,
    /// 本轮构造中已完成的槽位，按完成顺序
    created: Vec<Arc<InstanceSlot>>,
}

/// 作用域级构造锁
///
/// 一个作用域的单例缓存与作用域缓存共用同一把锁。解析只会从子作用域走向祖先，
/// 所以不同作用域之间的加锁顺序也是固定的。
pub(crate) struct ConstructionLock {
    journal: ReentrantMutex<RefCell<BuildJournal>>,
}

impl ConstructionLock {
    pub(crate) fn new() -> Self {
        Self {
            journal: ReentrantMutex::new(RefCell::new(BuildJournal::default())),
        }
    }
}

/// 缓存查询结果
pub(crate) enum Cached {
    Hit(Instance),
    Created(Instance),
}

impl Cached {
    pub(crate) fn into_instance(self) -> Instance {
        match self {
            Cached::Hit(instance) | Cached::Created(instance) => instance,
        }
    }
}

pub(crate) struct InstanceCache {
    slots: DashMap<u64, Arc<InstanceSlot>>,
    construction: Arc<ConstructionLock>,
}

impl InstanceCache {
    #[cfg(test)]
    pub(crate) fn new() -> Self {
        Self::with_lock(Arc::new(ConstructionLock::new()))
    }

    pub(crate) fn with_lock(construction: Arc<ConstructionLock>) -> Self {
        Self {
            slots: DashMap::new(),
            construction,
        }
    }

    /// 取得缓存实例，不存在时调用 `spawn` 创建
    ///
    /// `spawn` 收到一个发布函数，构造完成后、成员注入前调用它。
    /// 发布之后若 `spawn` 失败，本轮构造中以该半成品为依赖完成的实例一并作废。
    pub(crate) fn get_or_spawn<F>(&self, registration_id: u64, spawn: F) -> Result<Cached, ContainerError>
    where
        F: FnOnce(&dyn Fn(&Instance)) -> Result<Instance, ContainerError>,
    {
        // 不能在持有 DashMap 分片锁时构造，构造过程会重入本缓存
        let slot = self.slots.entry(registration_id).or_default().clone();
        if let Some(instance) = slot.ready.lock().clone() {
            return Ok(Cached::Hit(instance));
        }

        let guard = self.construction.journal.lock();
        if let Some(instance) = slot.ready.lock().clone() {
            return Ok(Cached::Hit(instance));
        }
        if let Some(instance) = slot.pending.lock().clone() {
            return Ok(Cached::Hit(instance));
        }

        let mark = {
            let mut journal = guard.borrow_mut();
            journal.depth += 1;
            journal.created.len()
        };
        let published = Cell::new(false);
        let publish = |instance: &Instance| {
            *slot.pending.lock() = Some(instance.clone());
            published.set(true);
        };
        let result = spawn(&publish);
        slot.pending.lock().take();

        let mut journal = guard.borrow_mut();
        journal.depth -= 1;
        let outcome = match result {
            Ok(instance) => {
                *slot.ready.lock() = Some(instance.clone());
                journal.created.push(slot.clone());
                Ok(Cached::Created(instance))
            }
            Err(err) => {
                if published.get() {
                    for orphan in journal.created.drain(mark..) {
                        orphan.ready.lock().take();
                    }
                }
                Err(err)
            }
        };
        if journal.depth == 0 {
            journal.created.clear();
        }
        outcome
    }

    pub(crate) fn get(&self, registration_id: u64) -> Option<Instance> {
        let slot = self.slots.get(&registration_id)?.clone();
        let ready = slot.ready.lock().clone();
        ready
    }

    pub(crate) fn len(&self) -> usize {
        self.slots
            .iter()
            .filter(|entry| entry.value().ready.lock().is_some())
            .count()
    }

    pub(crate) fn clear(&self) {
        self.slots.clear();
    }
}
