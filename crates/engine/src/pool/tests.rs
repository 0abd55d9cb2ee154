use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use crate::error::PoolError;
use crate::pool::{ThreadPool, ThreadPriority, WorkerPool};

fn pool(max_threads: usize, keep_alive: Duration) -> WorkerPool {
    let pool = WorkerPool::new("jobmesh[node-a]", max_threads, ThreadPriority::NORMAL, keep_alive);
    pool.initialize().unwrap();
    pool
}

fn wait_until(timeout: Duration, cond: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    cond()
}

#[test]
fn priority_bounds() {
    assert_eq!(ThreadPriority::new(1).unwrap(), ThreadPriority::MIN);
    assert_eq!(ThreadPriority::new(10).unwrap(), ThreadPriority::MAX);
    assert_eq!(ThreadPriority::default().get(), 5);
    assert!(matches!(ThreadPriority::new(0), Err(PoolError::InvalidSetting(_))));
    assert!(matches!(ThreadPriority::new(11), Err(PoolError::InvalidSetting(_))));
}

#[test]
fn zero_threads_fails_initialization() {
    let pool = WorkerPool::new("p", 0, ThreadPriority::NORMAL, Duration::from_secs(1));
    assert!(matches!(pool.initialize(), Err(PoolError::InvalidSetting(_))));
}

#[test]
fn uninitialized_pool_rejects_work() {
    let pool = WorkerPool::new("p", 1, ThreadPriority::NORMAL, Duration::from_secs(1));
    assert!(matches!(pool.run_in_thread(Box::new(|| {})), Err(PoolError::NotInitialized(_))));
}

#[test]
fn initialize_is_idempotent_until_shutdown() {
    let pool = pool(2, Duration::from_secs(1));
    pool.initialize().unwrap();
    pool.shutdown(true);
    assert!(matches!(pool.initialize(), Err(PoolError::ShutDown(_))));
    assert_eq!(pool.busy_count(), 0);
}

#[test]
fn workers_spawn_lazily_and_are_named() {
    let pool = pool(3, Duration::from_secs(60));
    assert_eq!(pool.worker_count(), 0);
    assert_eq!(pool.block_for_available_threads(), 3);

    let (tx, rx) = mpsc::channel();
    pool.run_in_thread(Box::new(move || {
        tx.send(thread::current().name().map(str::to_string)).unwrap();
    }))
    .unwrap();

    let name = rx.recv_timeout(Duration::from_secs(2)).unwrap().unwrap();
    assert_eq!(name, "jobmesh[node-a]/worker_1");
    assert_eq!(pool.worker_count(), 1);
    pool.shutdown(true);
}

#[test]
fn capacity_is_bounded_by_max_threads() {
    let pool = Arc::new(pool(3, Duration::from_secs(60)));
    let running = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let gate = Arc::new(Mutex::new(()));
    let held = gate.lock().unwrap();

    for _ in 0..3 {
        let running = Arc::clone(&running);
        let peak = Arc::clone(&peak);
        let gate = Arc::clone(&gate);
        pool.run_in_thread(Box::new(move || {
            let now = running.fetch_add(1, Ordering::SeqCst) + 1;
            peak.fetch_max(now, Ordering::SeqCst);
            drop(gate.lock());
            running.fetch_sub(1, Ordering::SeqCst);
        }))
        .unwrap();
    }
    assert!(wait_until(Duration::from_secs(2), || running.load(Ordering::SeqCst) == 3));
    assert_eq!(pool.busy_count(), 3);

    // A fourth submission has to wait for a free slot.
    let submitted = Arc::new(AtomicUsize::new(0));
    let submitter = {
        let pool = Arc::clone(&pool);
        let submitted = Arc::clone(&submitted);
        thread::spawn(move || {
            pool.run_in_thread(Box::new(|| {})).unwrap();
            submitted.fetch_add(1, Ordering::SeqCst);
        })
    };
    thread::sleep(Duration::from_millis(50));
    assert_eq!(submitted.load(Ordering::SeqCst), 0);

    drop(held);
    submitter.join().unwrap();
    assert_eq!(submitted.load(Ordering::SeqCst), 1);
    assert!(wait_until(Duration::from_secs(2), || pool.busy_count() == 0));
    assert_eq!(peak.load(Ordering::SeqCst), 3);
    assert!(pool.worker_count() <= 3);
    pool.shutdown(true);
}

#[test]
fn idle_workers_retire_after_keep_alive() {
    let pool = pool(2, Duration::from_millis(20));
    let (tx, rx) = mpsc::channel();
    pool.run_in_thread(Box::new(move || tx.send(()).unwrap())).unwrap();
    rx.recv_timeout(Duration::from_secs(2)).unwrap();

    assert!(wait_until(Duration::from_secs(2), || pool.worker_count() == 0));

    // The pool grows again on demand.
    let (tx, rx) = mpsc::channel();
    pool.run_in_thread(Box::new(move || tx.send(()).unwrap())).unwrap();
    rx.recv_timeout(Duration::from_secs(2)).unwrap();
    pool.shutdown(true);
}

#[test]
fn panicking_task_does_not_leak_a_slot() {
    let pool = pool(1, Duration::from_secs(60));
    pool.run_in_thread(Box::new(|| panic!("job blew up"))).unwrap();

    let (tx, rx) = mpsc::channel();
    pool.run_in_thread(Box::new(move || tx.send(42).unwrap())).unwrap();
    assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), 42);
    assert!(wait_until(Duration::from_secs(2), || pool.busy_count() == 0));
    pool.shutdown(true);
}

#[test]
fn shutdown_with_wait_drains_running_work() {
    let pool = pool(2, Duration::from_secs(60));
    let done = Arc::new(AtomicUsize::new(0));
    for _ in 0..2 {
        let done = Arc::clone(&done);
        pool.run_in_thread(Box::new(move || {
            thread::sleep(Duration::from_millis(50));
            done.fetch_add(1, Ordering::SeqCst);
        }))
        .unwrap();
    }
    pool.shutdown(true);
    assert_eq!(done.load(Ordering::SeqCst), 2);
    assert_eq!(pool.worker_count(), 0);
}

#[test]
fn shutdown_without_wait_returns_immediately() {
    let pool = pool(1, Duration::from_secs(60));
    let (release_tx, release_rx) = mpsc::channel::<()>();
    let (done_tx, done_rx) = mpsc::channel();
    pool.run_in_thread(Box::new(move || {
        release_rx.recv().ok();
        done_tx.send(()).ok();
    }))
    .unwrap();

    let started = Instant::now();
    pool.shutdown(false);
    assert!(started.elapsed() < Duration::from_secs(1));

    assert!(matches!(pool.run_in_thread(Box::new(|| {})), Err(PoolError::ShutDown(_))));
    assert_eq!(pool.block_for_available_threads(), 0);

    // The running task still completes on its own.
    release_tx.send(()).unwrap();
    done_rx.recv_timeout(Duration::from_secs(2)).unwrap();
}
