//! 容器注册与解析的集成测试

use scopegraph::config::ConfigLoader;
use scopegraph::prelude::*;
use scopegraph::ContainerConfig;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

trait Greeter: Send + Sync {
    fn greet(&self) -> String;
}

trait Farewell: Send + Sync {
    fn bye(&self) -> String;
}

struct English {
    salutation: String,
}

impl Greeter for English {
    fn greet(&self) -> String {
        self.salutation.clone()
    }
}

implements!(English => dyn Greeter);

impl Injectable for English {
    fn describe(d: &mut DescriptorBuilder<Self>) {
        d.constructor().build(|_| {
            Ok(English {
                salutation: "hello".to_string(),
            })
        });
        d.implements::<dyn Greeter>();
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

/// 同时实现两个契约
struct Polite {
    id: usize,
}

impl Greeter for Polite {
    fn greet(&self) -> String {
        format!("good day #{}", self.id)
    }
}

impl Farewell for Polite {
    fn bye(&self) -> String {
        "farewell".to_string()
    }
}

implements!(Polite => dyn Greeter, dyn Farewell);

impl Injectable for Polite {
    fn describe(d: &mut DescriptorBuilder<Self>) {
        static NEXT: AtomicUsize = AtomicUsize::new(0);
        d.constructor().build(|_| {
            Ok(Polite {
                id: NEXT.fetch_add(1, Ordering::SeqCst),
            })
        });
        d.implements::<dyn Greeter>().implements::<dyn Farewell>();
    }
}

struct Welcome {
    greeter: Arc<dyn Greeter>,
}

impl Injectable for Welcome {
    fn describe(d: &mut DescriptorBuilder<Self>) {
        d.constructor().param::<dyn Greeter>("greeter").build(|args| {
            Ok(Welcome {
                greeter: args.take::<dyn Greeter>()?,
            })
        });
    }
}

struct Server {
    port: Arc<u16>,
}

impl Injectable for Server {
    fn describe(d: &mut DescriptorBuilder<Self>) {
        d.constructor()
            .keyed_param::<u16>("port", "http")
            .build(|args| Ok(Server { port: args.take::<u16>()? }));
    }
}

struct TwoMarked;

impl Injectable for TwoMarked {
    fn describe(d: &mut DescriptorBuilder<Self>) {
        d.constructor().inject().build(|_| Ok(TwoMarked));
        d.constructor().param::<u8>("x").inject().build(|_| Ok(TwoMarked));
    }
}

struct NoConstructor;

impl Injectable for NoConstructor {
    fn describe(_: &mut DescriptorBuilder<Self>) {}
}

fn ptr<T: ?Sized>(value: &Arc<T>) -> *const () {
    Arc::as_ptr(value) as *const ()
}

#[test]
fn test_singleton_shared_across_descendants() {
    let mut builder = ContainerBuilder::new();
    builder.register::<English>(Lifetime::Singleton).as_::<dyn Greeter>();
    let root = builder.build().unwrap();
    let child = root.create_scope().unwrap();
    let grandchild = child.create_scope().unwrap();

    // 先从最深的作用域解析，实例仍缓存在声明它的根上
    let from_grandchild = grandchild.resolve::<dyn Greeter>().unwrap();
    let from_child = child.resolve::<dyn Greeter>().unwrap();
    let from_root = root.resolve::<dyn Greeter>().unwrap();
    assert!(Arc::ptr_eq(&from_grandchild, &from_child));
    assert!(Arc::ptr_eq(&from_child, &from_root));
    assert_eq!(from_root.greet(), "hello");
}

#[test]
fn test_transient_instances_are_distinct() {
    let mut builder = ContainerBuilder::new();
    builder.register::<Polite>(Lifetime::Transient).as_::<dyn Greeter>();
    let root = builder.build().unwrap();

    let first = root.resolve::<dyn Greeter>().unwrap();
    let second = root.resolve::<dyn Greeter>().unwrap();
    assert!(!Arc::ptr_eq(&first, &second));
    assert_ne!(first.greet(), second.greet());
}

#[test]
fn test_scoped_instance_per_scope() {
    let mut builder = ContainerBuilder::new();
    builder.register::<Polite>(Lifetime::Scoped).as_::<dyn Greeter>();
    let root = builder.build().unwrap();

    let x = root.resolve::<dyn Greeter>().unwrap();
    let child = root.create_scope().unwrap();
    let y = child.resolve::<dyn Greeter>().unwrap();
    let y_again = child.resolve::<dyn Greeter>().unwrap();

    assert!(!Arc::ptr_eq(&x, &y));
    assert!(Arc::ptr_eq(&y, &y_again));
    assert!(Arc::ptr_eq(&x, &root.resolve::<dyn Greeter>().unwrap()));
}

#[test]
fn test_unregistered_contract() {
    let root = ContainerBuilder::new().build().unwrap();

    let err = root.resolve::<dyn Greeter>().err().unwrap();
    assert!(err.is_not_registered());
    assert!(err.to_string().contains("Greeter"));
    assert!(root.try_resolve::<dyn Greeter>().unwrap().is_none());
}

#[test]
fn test_try_resolve_reports_nested_failures() {
    let mut builder = ContainerBuilder::new();
    builder.register::<Welcome>(Lifetime::Transient);
    let root = builder.build().unwrap();

    // 顶层契约已注册，缺失的是它的依赖
    let err = root.try_resolve::<Welcome>().err().unwrap();
    assert!(matches!(err, ContainerError::NotRegistered { ref contract } if contract.contains("Greeter")));
}

#[test]
fn test_constructor_injection_through_interface() {
    let mut builder = ContainerBuilder::new();
    builder.register::<English>(Lifetime::Singleton).as_::<dyn Greeter>();
    builder.register::<Welcome>(Lifetime::Transient);
    let root = builder.build().unwrap();

    let welcome = root.resolve::<Welcome>().unwrap();
    assert_eq!(welcome.greeter.greet(), "hello");
    assert!(Arc::ptr_eq(&welcome.greeter, &root.resolve::<dyn Greeter>().unwrap()));
}

#[test]
fn test_last_registration_wins() {
    let mut builder = ContainerBuilder::new();
    builder.register::<English>(Lifetime::Singleton).as_::<dyn Greeter>();
    builder.register::<French>(Lifetime::Singleton).as_::<dyn Greeter>();
    let root = builder.build().unwrap();

    assert_eq!(root.resolve::<dyn Greeter>().unwrap().greet(), "bonjour");
    let all: Vec<String> = root
        .resolve_all::<dyn Greeter>()
        .unwrap()
        .iter()
        .map(|g| g.greet())
        .collect();
    assert_eq!(all, vec!["hello", "bonjour"]);
}

#[test]
fn test_keyed_registrations() {
    let mut builder = ContainerBuilder::new();
    builder.register_instance(8080u16).keyed("http");
    builder.register_instance(9090u16).keyed("grpc");
    builder.register::<Server>(Lifetime::Transient);
    let root = builder.build().unwrap();

    assert_eq!(*root.resolve_keyed::<u16>("http").unwrap(), 8080);
    assert_eq!(*root.resolve_keyed::<u16>("grpc").unwrap(), 9090);
    assert!(root.resolve::<u16>().unwrap_err().is_not_registered());
    assert_eq!(*root.resolve::<Server>().unwrap().port, 8080);
}

#[test]
fn test_as_implemented_interfaces() {
    let mut builder = ContainerBuilder::new();
    builder
        .register::<Polite>(Lifetime::Singleton)
        .as_implemented_interfaces()
        .as_self();
    let root = builder.build().unwrap();

    let greeter = root.resolve::<dyn Greeter>().unwrap();
    let farewell = root.resolve::<dyn Farewell>().unwrap();
    let concrete = root.resolve::<Polite>().unwrap();
    assert_eq!(ptr(&greeter), ptr(&farewell));
    assert_eq!(ptr(&greeter), ptr(&concrete));
    assert_eq!(farewell.bye(), "farewell");
}

#[test]
fn test_dynamic_contract_binding() {
    let mut builder = ContainerBuilder::new();
    builder
        .register::<Polite>(Lifetime::Transient)
        .as_type(ContractType::of::<dyn Farewell>());
    let root = builder.build().unwrap();
    assert_eq!(root.resolve::<dyn Farewell>().unwrap().bye(), "farewell");
    // 只绑定了声明的契约
    assert!(root.try_resolve::<Polite>().unwrap().is_none());
}

#[test]
fn test_not_assignable_fails_at_build() {
    let mut builder = ContainerBuilder::new();
    builder
        .register::<English>(Lifetime::Transient)
        .as_type(ContractType::of::<dyn Farewell>());
    let err = builder.build().unwrap_err();
    assert!(matches!(err, ContainerError::NotAssignable { .. }));
    assert!(err.is_configuration_error());
}

#[test]
fn test_ambiguous_constructor_fails_at_build() {
    let mut builder = ContainerBuilder::new();
    builder.register::<TwoMarked>(Lifetime::Transient);
    let err = builder.build().unwrap_err();
    assert!(matches!(err, ContainerError::AmbiguousConstructor { count: 2, .. }));
}

#[test]
fn test_type_without_constructor_needs_instance_or_factory() {
    let mut builder = ContainerBuilder::new();
    builder.register::<NoConstructor>(Lifetime::Singleton);
    assert!(matches!(
        builder.build(),
        Err(ContainerError::NoInjectableConstructor { .. })
    ));

    let mut builder = ContainerBuilder::new();
    builder.register_instance(NoConstructor);
    let root = builder.build().unwrap();
    assert!(root.resolve::<NoConstructor>().is_ok());
}

#[test]
fn test_register_instance_as_interface() {
    let english: Arc<dyn Greeter> = Arc::new(English {
        salutation: "hi".to_string(),
    });
    let mut builder = ContainerBuilder::new();
    builder.register_instance_as::<dyn Greeter>(english.clone());
    let root = builder.build().unwrap();

    let resolved = root.resolve::<dyn Greeter>().unwrap();
    assert!(Arc::ptr_eq(&resolved, &english));
}

#[test]
fn test_factory_registration() {
    let created = Arc::new(AtomicUsize::new(0));
    let counter = created.clone();
    let mut builder = ContainerBuilder::new();
    builder.register::<English>(Lifetime::Singleton).as_::<dyn Greeter>();
    builder.register_factory(Lifetime::Scoped, move |resolver| {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(Welcome {
            greeter: resolver.resolve::<dyn Greeter>()?,
        })
    });
    builder.register_factory_as::<dyn Greeter, _>(Lifetime::Transient, |_| Ok(Arc::new(French)))
        .keyed("fr");
    let root = builder.build().unwrap();

    let first = root.resolve::<Welcome>().unwrap();
    let second = root.resolve::<Welcome>().unwrap();
    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(created.load(Ordering::SeqCst), 1);
    assert_eq!(root.resolve_keyed::<dyn Greeter>("fr").unwrap().greet(), "bonjour");
}

#[test]
fn test_factory_error_is_wrapped() {
    let mut builder = ContainerBuilder::new();
    builder.register_factory::<u32, _>(Lifetime::Transient, |_| {
        Err(ContainerError::factory::<u32>(anyhow::anyhow!("backend unavailable")))
    });
    let root = builder.build().unwrap();

    let err = root.resolve::<u32>().unwrap_err();
    assert!(matches!(err, ContainerError::Factory { .. }));
    assert!(err.to_string().contains("backend unavailable"));
}

#[test]
fn test_build_callbacks_run_once_in_order() {
    let log = Arc::new(parking_lot::Mutex::new(Vec::new()));
    let mut builder = ContainerBuilder::new();
    builder.register::<English>(Lifetime::Singleton).as_::<dyn Greeter>();
    let first = log.clone();
    builder.register_build_callback(move |container| {
        first.lock().push(container.resolve::<dyn Greeter>()?.greet());
        Ok(())
    });
    let second = log.clone();
    builder.register_build_callback(move |_| {
        second.lock().push("second".to_string());
        Ok(())
    });
    builder.build().unwrap();
    assert_eq!(*log.lock(), vec!["hello".to_string(), "second".to_string()]);
}

#[test]
fn test_build_callback_error_fails_build() {
    let mut builder = ContainerBuilder::new();
    builder.register_build_callback(|container| container.resolve::<dyn Greeter>().map(|_| ()));
    assert!(builder.build().unwrap_err().is_not_registered());
}

struct GreetingInstaller;

impl Installer for GreetingInstaller {
    fn install(&self, builder: &mut ContainerBuilder) {
        builder.register::<English>(Lifetime::Singleton).as_::<dyn Greeter>();
        builder.register::<Welcome>(Lifetime::Transient);
    }
}

#[test]
fn test_installers() {
    let mut builder = ContainerBuilder::new();
    builder
        .install(&GreetingInstaller)
        .install(&|b: &mut ContainerBuilder| {
            b.register_instance(42u8);
        });
    assert!(builder.exists::<dyn Greeter>());
    assert!(builder.exists::<u8>());
    assert!(!builder.exists::<dyn Farewell>());

    let root = builder.build().unwrap();
    assert_eq!(root.resolve::<Welcome>().unwrap().greeter.greet(), "hello");
    assert_eq!(*root.resolve::<u8>().unwrap(), 42);
}

#[test]
fn test_resolve_after_dispose_fails() {
    let mut builder = ContainerBuilder::new();
    builder.register::<English>(Lifetime::Singleton).as_::<dyn Greeter>();
    let root = builder.build().unwrap();
    root.resolve::<dyn Greeter>().unwrap();
    root.dispose().unwrap();

    assert!(root.is_disposed());
    assert!(matches!(
        root.resolve::<dyn Greeter>(),
        Err(ContainerError::DisposedContainerAccess { .. })
    ));
    assert!(matches!(
        root.try_resolve::<dyn Farewell>(),
        Err(ContainerError::DisposedContainerAccess { .. })
    ));
    assert!(root.create_scope().is_err());
}

#[test]
fn test_parallel_build_matches_sequential() {
    let dir = tempfile::TempDir::new().unwrap();
    let path = dir.path().join(scopegraph::config::CONFIG_FILE_NAME);
    std::fs::write(&path, "scope_name = \"app\"\nparallel_build = true\nbuild_workers = 4\n").unwrap();
    let config = ConfigLoader::load_file(&path).unwrap();
    assert!(config.parallel_build);

    let configure = |builder: &mut ContainerBuilder| {
        builder.register::<English>(Lifetime::Singleton).as_::<dyn Greeter>();
        builder.register::<French>(Lifetime::Singleton).as_::<dyn Greeter>();
        builder.register::<Polite>(Lifetime::Transient).as_::<dyn Farewell>();
        builder.register::<Welcome>(Lifetime::Transient);
        builder.register_instance(8080u16).keyed("http");
        builder.register::<Server>(Lifetime::Scoped);
        builder.register_instance(String::from("independent"));
    };

    let mut parallel = ContainerBuilder::with_config(config);
    configure(&mut parallel);
    let parallel = parallel.build().unwrap();
    let mut sequential = ContainerBuilder::new();
    configure(&mut sequential);
    let sequential = sequential.build().unwrap();

    assert_eq!(parallel.info().name, "app");
    for container in [&parallel, &sequential] {
        assert_eq!(container.resolve::<Welcome>().unwrap().greeter.greet(), "bonjour");
        assert_eq!(container.resolve_all::<dyn Greeter>().unwrap().len(), 2);
        assert_eq!(*container.resolve::<Server>().unwrap().port, 8080);
        assert_eq!(container.resolve::<dyn Farewell>().unwrap().bye(), "farewell");
    }
    assert_eq!(parallel.stats().registrations, sequential.stats().registrations);
}

#[test]
fn test_parallel_build_reports_first_error() {
    let config = ContainerConfig {
        parallel_build: true,
        build_workers: 3,
        ..ContainerConfig::default()
    };
    let mut builder = ContainerBuilder::with_config(config);
    builder.register_instance(1u64);
    builder.register::<TwoMarked>(Lifetime::Transient);
    builder.register::<NoConstructor>(Lifetime::Transient);
    builder.register::<English>(Lifetime::Transient).as_type(ContractType::of::<dyn Farewell>());
    assert!(matches!(
        builder.build(),
        Err(ContainerError::AmbiguousConstructor { .. })
    ));
}

#[tokio::test]
async fn test_async_factory_returns_pending_value() {
    let mut builder = ContainerBuilder::new();
    builder.register::<English>(Lifetime::Singleton).as_::<dyn Greeter>();
    builder.register_async_factory(Lifetime::Singleton, |resolver| {
        let greeter = resolver.resolve::<dyn Greeter>()?;
        Ok(async move {
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            Ok::<_, ContainerError>(format!("{}, async world", greeter.greet()))
        })
    });
    let root = builder.build().unwrap();

    let pending = root.resolve_async::<String>().unwrap();
    assert!(pending.peek().is_none());
    let value = pending.await.unwrap();
    assert_eq!(value.as_str(), "hello, async world");

    let again = root.resolve_async::<String>().unwrap().await.unwrap();
    assert!(Arc::ptr_eq(&value, &again));
}
