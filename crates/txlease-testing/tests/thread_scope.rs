//! Thread-scoped pooling and snapshot/reconcile bracketing.

#![allow(clippy::unwrap_used)]

use std::sync::Arc;
use std::thread;

use txlease::{
    ChainServices, ConnectionManager, LeaseConfig, PhysicalConnection, PoolConfig,
    ThreadScopedPolicy,
};
use txlease_testing::{MockFactory, init_tracing, physical, request};

struct Fixture {
    factory: Arc<MockFactory>,
    manager: Arc<ConnectionManager>,
}

impl Fixture {
    fn new() -> Self {
        init_tracing();
        let factory = MockFactory::new();
        let config = LeaseConfig::new()
            .pool(PoolConfig::new().max_size(4).no_idle_timeout())
            .thread_scoped(true);
        let manager =
            ConnectionManager::from_config(factory.as_factory(), &config, ChainServices::new())
                .unwrap();
        Self {
            factory,
            manager: Arc::new(manager),
        }
    }

    fn scope(&self) -> &Arc<ThreadScopedPolicy> {
        self.manager.thread_scope().unwrap()
    }

    fn lease(&self, key: &str) -> PhysicalConnection {
        lease(&self.manager, &self.factory, key)
    }
}

fn lease(manager: &ConnectionManager, factory: &Arc<MockFactory>, key: &str) -> PhysicalConnection {
    let handle = manager
        .allocate(&factory.as_factory(), Some(request(key)))
        .unwrap();
    physical(&handle).unwrap()
}

#[test]
fn test_nested_scopes_release_only_their_own_connections() {
    let fx = Fixture::new();
    let before_outer = fx.scope().snapshot();
    let outer = fx.lease("a");

    let before_inner = fx.scope().snapshot();
    assert!(before_inner.contains(&outer));
    let inner = fx.lease("b");

    fx.scope().reconcile(&before_inner).unwrap();
    let status = fx.manager.pool_status().unwrap();
    assert_eq!(status.in_use, 1);
    assert_eq!(status.available, 1);
    assert!(fx.scope().snapshot().contains(&outer));
    assert!(!fx.scope().snapshot().contains(&inner));

    fx.scope().reconcile(&before_outer).unwrap();
    let status = fx.manager.pool_status().unwrap();
    assert_eq!(status.in_use, 0);
    assert_eq!(status.available, 2);
    assert!(fx.scope().snapshot().is_empty());
}

#[test]
fn test_released_connection_stays_with_thread() {
    let fx = Fixture::new();
    let conn = fx.lease("a");
    fx.manager.release(&conn).unwrap();

    // Idle on this thread, still leased from the global pool.
    assert_eq!(fx.manager.pool_status().unwrap().in_use, 1);
    assert_eq!(fx.lease("a"), conn);

    let other = {
        let manager = Arc::clone(&fx.manager);
        let factory = Arc::clone(&fx.factory);
        thread::spawn(move || lease(&manager, &factory, "a"))
            .join()
            .unwrap()
    };
    assert_ne!(other, conn);
    assert_eq!(fx.scope().thread_count(), 2);
}

#[test]
fn test_scope_guard_on_worker_thread() {
    let fx = Fixture::new();
    let manager = Arc::clone(&fx.manager);
    let factory = Arc::clone(&fx.factory);

    thread::spawn(move || {
        let scope = Arc::clone(manager.thread_scope().unwrap());
        {
            let _guard = scope.enter();
            lease(&manager, &factory, "a");
            lease(&manager, &factory, "b");
        }
        assert!(scope.snapshot().is_empty());
        scope.end_thread().unwrap();
    })
    .join()
    .unwrap();

    let status = fx.manager.pool_status().unwrap();
    assert_eq!(status.in_use, 0);
    assert_eq!(status.available, 2);
    assert_eq!(fx.scope().thread_count(), 0);
}

#[test]
fn test_close_from_driver_thread_goes_to_global_pool() {
    let fx = Fixture::new();
    let conn = fx.lease("a");
    let mock = fx.factory.mock(&conn).unwrap();

    thread::spawn(move || mock.fire_closed()).join().unwrap();

    let status = fx.manager.pool_status().unwrap();
    assert_eq!(status.in_use, 0);
    assert_eq!(status.available, 1);
    assert!(fx.scope().snapshot().is_empty());
}

#[test]
fn test_dispose_drains_every_thread() {
    let fx = Fixture::new();
    let mine = fx.lease("a");
    let theirs = {
        let manager = Arc::clone(&fx.manager);
        let factory = Arc::clone(&fx.factory);
        thread::spawn(move || lease(&manager, &factory, "b"))
            .join()
            .unwrap()
    };

    fx.manager.dispose().unwrap();
    assert!(fx.factory.mock(&mine).unwrap().is_destroyed());
    assert!(fx.factory.mock(&theirs).unwrap().is_destroyed());
    assert_eq!(fx.factory.live(), 0);
}
