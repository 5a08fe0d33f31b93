//! 释放追踪
//!
//! 每个作用域记录自己创建的可释放实例，结束时按创建顺序的逆序释放。

use super::contract::Instance;
use parking_lot::Mutex;
use std::sync::Arc;

/// 需要确定性释放的服务
pub trait Disposable: Send + Sync {
    fn dispose(&self);
}

/// 类型擦除的释放函数
pub type Disposer = Arc<dyn Fn(&Instance) + Send + Sync>;

/// 为具体类型 `T` 生成释放函数
pub fn disposer_for<T: Disposable + 'static>() -> Disposer {
    Arc::new(|instance: &Instance| {
        if let Some(value) = instance.downcast_ref::<T>() {
            value.dispose();
        }
    })
}

struct Tracked {
    instance: Instance,
    disposer: Disposer,
}

#[derive(Default)]
pub struct DisposalTracker {
    entries: Mutex<Vec<Tracked>>,
}

impl DisposalTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn track(&self, instance: Instance, disposer: Disposer) {
        self.entries.lock().push(Tracked { instance, disposer });
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 丢弃全部记录但不释放
    pub fn clear(&self) {
        let entries = std::mem::take(&mut *self.entries.lock());
        drop(entries);
    }

    /// 逆序（LIFO）释放全部记录，返回释放数量
    pub fn dispose_all(&self) -> usize {
        // 先取出再释放，dispose 中再次 track 不会死锁
        let entries = std::mem::take(&mut *self.entries.lock());
        let count = entries.len();
        for tracked in entries.into_iter().rev() {
            (tracked.disposer)(&tracked.instance);
        }
        count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Recorder {
        id: usize,
        log: Arc<Mutex<Vec<usize>>>,
    }

    impl Disposable for Recorder {
        fn dispose(&self) {
            self.log.lock().push(self.id);
        }
    }

    #[test]
    fn disposes_in_reverse_creation_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let tracker = DisposalTracker::new();
        for id in 0..3 {
            let instance: Instance = Arc::new(Recorder {
                id,
                log: log.clone(),
            });
            tracker.track(instance, disposer_for::<Recorder>());
        }
        assert_eq!(tracker.len(), 3);
        assert_eq!(tracker.dispose_all(), 3);
        assert_eq!(*log.lock(), vec![2, 1, 0]);
        assert!(tracker.is_empty());
        assert_eq!(tracker.dispose_all(), 0);
    }
}
