//! Connection manager behaviour: event bridge, blocking, disposal and
//! configuration-driven chains.

#![allow(clippy::unwrap_used)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use txlease::{
    ChainServices, ConnectionManager, Error, LeaseConfig, PhysicalConnection, PoolConfig,
};
use txlease_testing::{MockFactory, init_tracing, physical, request};

fn pooled(factory: &Arc<MockFactory>, pool: PoolConfig) -> Arc<ConnectionManager> {
    init_tracing();
    let config = LeaseConfig::new().pool(pool);
    Arc::new(
        ConnectionManager::from_config(factory.as_factory(), &config, ChainServices::new())
            .unwrap(),
    )
}

fn lease(manager: &ConnectionManager, factory: &Arc<MockFactory>) -> txlease::Result<PhysicalConnection> {
    let handle = manager.allocate(&factory.as_factory(), Some(request("a")))?;
    Ok(physical(&handle).unwrap())
}

fn wait_for_waiters(manager: &ConnectionManager, n: usize) {
    while manager.pool_status().unwrap().waiting < n {
        thread::sleep(Duration::from_millis(5));
    }
}

#[test]
fn test_closed_handle_returns_connection() {
    let factory = MockFactory::new();
    let manager = pooled(&factory, PoolConfig::new().max_size(2).no_idle_timeout());

    let conn = lease(&manager, &factory).unwrap();
    let mock = factory.mock(&conn).unwrap();
    assert_eq!(mock.listener_count(), 1);
    mock.fire_closed();

    let status = manager.pool_status().unwrap();
    assert_eq!(status.available, 1);
    assert_eq!(mock.cleanups(), 1);
    assert_eq!(lease(&manager, &factory).unwrap(), conn);
}

#[test]
fn test_failed_cleanup_destroys_connection() {
    let factory = MockFactory::new();
    let manager = pooled(&factory, PoolConfig::new().max_size(2).no_idle_timeout());

    let conn = lease(&manager, &factory).unwrap();
    let mock = factory.mock(&conn).unwrap();
    mock.fail_cleanup(true);
    manager.release(&conn).unwrap();

    assert!(mock.is_destroyed());
    assert_eq!(manager.pool_status().unwrap().total, 0);
}

#[test]
fn test_factory_failure_propagates() {
    let factory = MockFactory::new();
    let manager = pooled(&factory, PoolConfig::new().max_size(1).no_idle_timeout());
    factory.fail_create(true);

    assert!(matches!(lease(&manager, &factory), Err(Error::Resource(_))));
    assert_eq!(manager.pool_status().unwrap().total, 0);

    factory.fail_create(false);
    lease(&manager, &factory).unwrap();
}

#[test]
fn test_waiter_gets_connection_closed_on_another_thread() {
    let factory = MockFactory::new();
    let manager = pooled(&factory, PoolConfig::new().max_size(1).no_idle_timeout());
    let held = lease(&manager, &factory).unwrap();

    let waiter = {
        let manager = Arc::clone(&manager);
        let factory = Arc::clone(&factory);
        thread::spawn(move || lease(&manager, &factory))
    };
    wait_for_waiters(&manager, 1);

    factory.mock(&held).unwrap().fire_closed();
    assert_eq!(waiter.join().unwrap().unwrap(), held);
    assert_eq!(factory.created(), 1);
}

#[test]
fn test_error_wakes_waiter_with_new_connection() {
    let factory = MockFactory::new();
    let manager = pooled(&factory, PoolConfig::new().max_size(1).no_idle_timeout());
    let held = lease(&manager, &factory).unwrap();

    let waiter = {
        let manager = Arc::clone(&manager);
        let factory = Arc::clone(&factory);
        thread::spawn(move || lease(&manager, &factory))
    };
    wait_for_waiters(&manager, 1);

    factory.mock(&held).unwrap().fire_error("socket closed");
    let fresh = waiter.join().unwrap().unwrap();
    assert_ne!(fresh, held);
    assert!(factory.mock(&held).unwrap().is_destroyed());
}

#[test]
fn test_dispose_interrupts_waiter() {
    let factory = MockFactory::new();
    let manager = pooled(&factory, PoolConfig::new().max_size(1).no_idle_timeout());
    let held = lease(&manager, &factory).unwrap();

    let waiter = {
        let manager = Arc::clone(&manager);
        let factory = Arc::clone(&factory);
        thread::spawn(move || lease(&manager, &factory))
    };
    wait_for_waiters(&manager, 1);

    manager.dispose().unwrap();
    assert!(matches!(waiter.join().unwrap(), Err(Error::Interrupted)));
    assert!(factory.mock(&held).unwrap().is_destroyed());
}

#[test]
fn test_acquire_timeout() {
    let factory = MockFactory::new();
    let manager = pooled(
        &factory,
        PoolConfig::new()
            .max_size(1)
            .no_idle_timeout()
            .acquire_timeout(Duration::from_millis(30)),
    );
    let _held = lease(&manager, &factory).unwrap();

    let err = lease(&manager, &factory).unwrap_err();
    assert!(matches!(err, Error::AcquisitionTimeout(_)));
    assert!(err.is_transient());
}

#[test]
fn test_concurrent_mixed_requests_stay_within_max_size() {
    const MAX: usize = 2;
    const THREADS: usize = 8;
    const ROUNDS: usize = 200;

    let factory = MockFactory::new();
    let manager = pooled(&factory, PoolConfig::new().max_size(MAX).no_idle_timeout());
    let peak = Arc::new(AtomicUsize::new(0));

    let workers: Vec<_> = (0..THREADS)
        .map(|t| {
            let manager = Arc::clone(&manager);
            let factory = Arc::clone(&factory);
            let peak = Arc::clone(&peak);
            thread::spawn(move || {
                for round in 0..ROUNDS {
                    // Alternate keys so some requests miss and force eviction.
                    let key = if (t + round) % 3 == 0 { "b" } else { "a" };
                    let handle = manager
                        .allocate(&factory.as_factory(), Some(request(key)))
                        .unwrap();
                    let conn = physical(&handle).unwrap();
                    assert_eq!(factory.mock(&conn).unwrap().key(), key);

                    peak.fetch_max(factory.live(), Ordering::SeqCst);
                    let status = manager.pool_status().unwrap();
                    assert!(status.total <= MAX, "pool grew to {}", status.total);

                    manager.release(&conn).unwrap();
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }

    assert!(peak.load(Ordering::SeqCst) <= MAX);
    let status = manager.pool_status().unwrap();
    assert_eq!(status.in_use, 0);
    assert_eq!(status.waiting, 0);
    assert_eq!(status.available, status.total);
    assert_eq!(factory.live(), status.total);
    assert!(factory.created() > MAX);
}

#[tokio::test(start_paused = true)]
async fn test_default_timer_evicts_idle_connections() {
    init_tracing();
    let factory = MockFactory::new();
    let config = LeaseConfig::new().pool(
        PoolConfig::new()
            .max_size(2)
            .idle_timeout(Duration::from_secs(60)),
    );
    // No timer supplied: the manager falls back to the current runtime.
    let manager =
        ConnectionManager::from_config(factory.as_factory(), &config, ChainServices::new())
            .unwrap();

    let conn = lease(&manager, &factory).unwrap();
    manager.release(&conn).unwrap();

    tokio::time::sleep(Duration::from_secs(59)).await;
    assert!(!factory.mock(&conn).unwrap().is_destroyed());

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert!(factory.mock(&conn).unwrap().is_destroyed());
    assert_eq!(manager.pool_status().unwrap().total, 0);
}

#[test]
fn test_idle_timeout_outside_runtime_needs_timer() {
    let factory = MockFactory::new();
    let config = LeaseConfig::new().pool(PoolConfig::new());

    let err = ConnectionManager::from_config(factory.as_factory(), &config, ChainServices::new())
        .unwrap_err();
    assert!(matches!(err, Error::Timer(_)));
}

#[test]
fn test_invalid_pool_config_is_rejected() {
    let factory = MockFactory::new();
    let config = LeaseConfig::new().pool(PoolConfig::new().min_size(5).max_size(2));

    let err = ConnectionManager::from_config(factory.as_factory(), &config, ChainServices::new())
        .unwrap_err();
    assert!(err.is_configuration());
}
