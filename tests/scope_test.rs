//! 作用域树与释放顺序的集成测试

use parking_lot::Mutex;
use scopegraph::prelude::*;
use scopegraph::ContainerConfig;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

type Log = Arc<Mutex<Vec<String>>>;

trait Greeter: Send + Sync {
    fn greet(&self) -> String;
}

struct English;

impl Greeter for English {
    fn greet(&self) -> String {
        "hello".to_string()
    }
}

implements!(English => dyn Greeter);

impl Injectable for English {
    fn describe(d: &mut DescriptorBuilder<Self>) {
        d.constructor().build(|_| Ok(English));
    }
}

struct French;

impl Greeter for French {
    fn greet(&self) -> String {
        "bonjour".to_string()
    }
}

implements!(French => dyn Greeter);

impl Injectable for French {
    fn describe(d: &mut DescriptorBuilder<Self>) {
        d.constructor().build(|_| Ok(French));
    }
}

/// 释放时写入日志的资源
struct Connection {
    name: String,
    log: Arc<Log>,
    closed: AtomicBool,
}

impl Connection {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

impl Disposable for Connection {
    fn dispose(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.log.lock().push(self.name.clone());
    }
}

impl Injectable for Connection {
    fn describe(d: &mut DescriptorBuilder<Self>) {
        d.constructor().param::<Log>("log").build(|args| {
            Ok(Connection {
                name: "connection".to_string(),
                log: args.take::<Log>()?,
                closed: AtomicBool::new(false),
            })
        });
        d.disposable();
    }
}

struct Session {
    connection: Arc<Connection>,
}

impl Injectable for Session {
    fn describe(d: &mut DescriptorBuilder<Self>) {
        d.constructor()
            .param::<Connection>("connection")
            .build(|args| Ok(Session { connection: args.take::<Connection>()? }));
    }
}

fn named_connection(name: &str, log: &Log) -> Connection {
    Connection {
        name: name.to_string(),
        log: Arc::new(log.clone()),
        closed: AtomicBool::new(false),
    }
}

fn log_builder(log: &Log) -> ContainerBuilder {
    let mut builder = ContainerBuilder::new();
    builder.register_instance(log.clone());
    builder
}

#[test]
fn test_scoped_disposed_with_its_scope_only() {
    let log: Log = Arc::default();
    let mut builder = log_builder(&log);
    builder.register::<Connection>(Lifetime::Scoped);
    let root = builder.build().unwrap();
    let child = root.create_scope().unwrap();

    let in_child = child.resolve::<Connection>().unwrap();

    // 祖先不能先于存活的子作用域释放，子作用域中的实例保持不变
    let err = root.dispose().unwrap_err();
    assert!(matches!(err, ContainerError::LiveChildScopes { children: 1, .. }));
    assert!(!root.is_disposed());
    assert!(!in_child.is_closed());

    child.dispose().unwrap();
    assert!(in_child.is_closed());
    assert_eq!(root.live_children(), 0);
    root.dispose().unwrap();
}

#[test]
fn test_disposal_is_lifo() {
    let log: Log = Arc::default();
    let mut builder = log_builder(&log);
    let first = log.clone();
    builder
        .register_factory(Lifetime::Scoped, move |_| Ok(named_connection("first", &first)))
        .disposable();
    let second = log.clone();
    builder
        .register_factory(Lifetime::Singleton, move |_| Ok(named_connection("second", &second)))
        .disposable()
        .as_::<Connection>()
        .keyed("second");
    let root = builder.build().unwrap();

    root.resolve::<Connection>().unwrap();
    root.resolve_keyed::<Connection>("second").unwrap();
    root.dispose().unwrap();
    assert_eq!(*log.lock(), vec!["second".to_string(), "first".to_string()]);
    assert_eq!(root.stats().disposed_instances, 2);
}

#[test]
fn test_dispose_is_idempotent() {
    let log: Log = Arc::default();
    let mut builder = log_builder(&log);
    builder.register::<Connection>(Lifetime::Singleton);
    let root = builder.build().unwrap();
    root.resolve::<Connection>().unwrap();

    root.dispose().unwrap();
    root.dispose().unwrap();
    assert_eq!(log.lock().len(), 1);
}

#[test]
fn test_existing_instances_are_not_disposed() {
    let log: Log = Arc::default();
    let connection = Arc::new(named_connection("external", &log));
    let mut builder = ContainerBuilder::new();
    builder.register_arc(connection.clone());
    let root = builder.build().unwrap();

    assert!(Arc::ptr_eq(&root.resolve::<Connection>().unwrap(), &connection));
    root.dispose().unwrap();
    assert!(!connection.is_closed());
    assert!(log.lock().is_empty());
}

#[test]
fn test_transient_disposables_tracked_by_resolving_scope() {
    let log: Log = Arc::default();
    let mut builder = log_builder(&log);
    builder.register::<Connection>(Lifetime::Transient);
    let root = builder.build().unwrap();
    let child = root.create_scope().unwrap();

    let a = child.resolve::<Connection>().unwrap();
    let b = child.resolve::<Connection>().unwrap();
    assert!(!Arc::ptr_eq(&a, &b));
    assert_eq!(child.stats().tracked_disposables, 2);
    assert_eq!(root.stats().tracked_disposables, 0);

    child.dispose().unwrap();
    assert!(a.is_closed() && b.is_closed());
}

#[test]
fn test_transient_tracking_can_be_disabled() {
    let log: Log = Arc::default();
    let config = ContainerConfig {
        track_transient_disposables: false,
        ..ContainerConfig::default()
    };
    let mut builder = ContainerBuilder::with_config(config);
    builder.register_instance(log.clone());
    builder.register::<Connection>(Lifetime::Transient);
    let root = builder.build().unwrap();

    let connection = root.resolve::<Connection>().unwrap();
    root.dispose().unwrap();
    assert!(!connection.is_closed());
}

#[test]
fn test_child_registrations_shadow_parent() {
    let mut builder = ContainerBuilder::new();
    builder.register::<English>(Lifetime::Singleton).as_::<dyn Greeter>();
    let root = builder.build().unwrap();

    let child = root
        .create_scope_with(|b| {
            b.register::<French>(Lifetime::Singleton).as_::<dyn Greeter>();
        })
        .unwrap();

    assert_eq!(child.resolve::<dyn Greeter>().unwrap().greet(), "bonjour");
    assert_eq!(root.resolve::<dyn Greeter>().unwrap().greet(), "hello");
    let grandchild = child.create_scope().unwrap();
    assert!(Arc::ptr_eq(
        &grandchild.resolve::<dyn Greeter>().unwrap(),
        &child.resolve::<dyn Greeter>().unwrap()
    ));
}

#[test]
fn test_singleton_declared_in_child_is_per_child() {
    let root = ContainerBuilder::new().build().unwrap();
    let configure = |b: &mut ContainerBuilder| {
        b.register::<English>(Lifetime::Singleton).as_::<dyn Greeter>();
    };
    let left = root.create_scope_with(configure).unwrap();
    let right = root.create_scope_with(configure).unwrap();

    let from_left = left.resolve::<dyn Greeter>().unwrap();
    let from_right = right.resolve::<dyn Greeter>().unwrap();
    assert!(!Arc::ptr_eq(&from_left, &from_right));
    assert!(Arc::ptr_eq(
        &from_left,
        &left.create_scope().unwrap().resolve::<dyn Greeter>().unwrap()
    ));
    assert!(root.try_resolve::<dyn Greeter>().unwrap().is_none());
}

#[test]
fn test_singleton_dependencies_resolve_in_owning_scope() {
    let log: Log = Arc::default();
    let mut builder = log_builder(&log);
    builder.register::<Connection>(Lifetime::Scoped);
    builder.register::<Session>(Lifetime::Singleton);
    let root = builder.build().unwrap();
    let child = root.create_scope().unwrap();

    let session = child.resolve::<Session>().unwrap();
    assert!(Arc::ptr_eq(&session.connection, &root.resolve::<Connection>().unwrap()));
    assert!(!Arc::ptr_eq(&session.connection, &child.resolve::<Connection>().unwrap()));

    // 单例的依赖记录在根上
    child.dispose().unwrap();
    assert!(!session.connection.is_closed());
    root.dispose().unwrap();
    assert!(session.connection.is_closed());
}

#[test]
fn test_disposed_child_does_not_affect_parent() {
    let mut builder = ContainerBuilder::new();
    builder.register::<English>(Lifetime::Scoped).as_::<dyn Greeter>();
    let root = builder.build().unwrap();
    let child = root.create_scope().unwrap();
    let sibling = root.create_scope().unwrap();
    child.dispose().unwrap();

    assert!(child.resolve::<dyn Greeter>().is_err());
    assert!(root.resolve::<dyn Greeter>().is_ok());
    assert!(sibling.resolve::<dyn Greeter>().is_ok());
    assert_eq!(root.live_children(), 1);
}

#[test]
fn test_scope_info() {
    let root = ContainerBuilder::new().build().unwrap();
    let child = root.create_scope().unwrap();
    let named = root
        .create_scope_with(|b| {
            b.set_scope_name("request");
        })
        .unwrap();

    assert_eq!(root.info().name, "root");
    assert_eq!(root.info().depth, 0);
    assert!(root.info().parent_id.is_none());
    assert_eq!(child.info().name, "root/1");
    assert_eq!(child.info().parent_id, Some(root.info().id));
    assert_eq!(named.info().name, "request");
    assert_ne!(child.info().id, named.info().id);
    assert!(child.parent().unwrap().same_scope(&root));
}

/// 持有解析它的作用域
struct ScopeAware {
    scope: Arc<Container>,
}

impl Injectable for ScopeAware {
    fn describe(d: &mut DescriptorBuilder<Self>) {
        d.constructor()
            .param::<Container>("scope")
            .build(|args| Ok(ScopeAware { scope: args.take::<Container>()? }));
    }
}

#[test]
fn test_container_injects_resolving_scope() {
    let mut builder = ContainerBuilder::new();
    builder.register::<ScopeAware>(Lifetime::Scoped);
    let root = builder.build().unwrap();
    let child = root.create_scope().unwrap();

    let aware = child.resolve::<ScopeAware>().unwrap();
    assert!(aware.scope.same_scope(&child));
    assert!(root.resolve::<ScopeAware>().unwrap().scope.same_scope(&root));
}

#[test]
fn test_scope_held_by_its_own_instance_can_be_dropped() {
    let mut builder = ContainerBuilder::new();
    builder.register::<ScopeAware>(Lifetime::Scoped);
    let root = builder.build().unwrap();
    let child = root.create_scope().unwrap();

    // 缓存的实例持有作用域自身
    let aware = child.resolve::<ScopeAware>().unwrap();
    assert!(!aware.scope.is_owning());
    drop(child);

    assert_eq!(root.live_children(), 0);
    assert!(aware.scope.is_disposed());
    assert!(aware.scope.resolve::<ScopeAware>().is_err());
    root.dispose().unwrap();
}

#[test]
fn test_scope_with_installer() {
    let installed = Arc::new(AtomicUsize::new(0));
    let counter = installed.clone();
    let installer = move |b: &mut ContainerBuilder| {
        counter.fetch_add(1, Ordering::SeqCst);
        b.register_instance(7i64);
    };
    let root = ContainerBuilder::new().build().unwrap();
    let child = root.create_scope_with_installer(&installer).unwrap();

    assert_eq!(*child.resolve::<i64>().unwrap(), 7);
    assert!(!root.is_registered::<i64>());
    assert_eq!(installed.load(Ordering::SeqCst), 1);
}
