// SPDX-License-Identifier: (MIT OR Apache-2.0)

//! Integration tests for the synchronization primitives under contention.
//! Each test drives its green threads through `block_on` on a fresh loop.

use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::time::Duration;

use strand_rt::{
    block_on, BoundedSemaphore, Condition, Error, Event, Lock, ReentrantLock, Semaphore, Thread,
    ThreadId,
};

fn join_all(threads: Vec<Thread>) -> impl std::future::Future<Output = Result<(), Error>> {
    async move {
        for t in threads {
            t.join(None).await?;
        }
        Ok(())
    }
}

#[test]
fn lock_is_exclusive_under_contention() {
    let violations = Rc::new(Cell::new(0usize));
    let finished = Rc::new(Cell::new(0usize));

    let (v, f) = (violations.clone(), finished.clone());
    block_on(async move {
        let lock = Rc::new(Lock::new());
        let owner: Rc<Cell<Option<ThreadId>>> = Rc::new(Cell::new(None));
        let mut threads = Vec::new();

        for i in 0..1000u64 {
            let (lock, owner, v, f) = (lock.clone(), owner.clone(), v.clone(), f.clone());
            threads.push(Thread::spawn(async move {
                let me = Thread::current().ok_or(Error::OutsideThread)?.id();
                let _guard = lock.lock().await?;
                if owner.get().is_some() {
                    v.set(v.get() + 1);
                }
                owner.set(Some(me));
                Thread::sleep(Duration::from_micros((i % 7) * 100)).await?;
                if owner.get() != Some(me) {
                    v.set(v.get() + 1);
                }
                owner.set(None);
                f.set(f.get() + 1);
                Ok::<_, Error>(())
            })?);
        }

        join_all(threads).await?;
        assert!(!lock.locked());
        Ok::<_, Error>(())
    })
    .unwrap();

    assert_eq!(violations.get(), 0);
    assert_eq!(finished.get(), 1000);
}

#[test]
fn reentrant_lock_nests() {
    block_on(async {
        let rlock = ReentrantLock::new();
        for _ in 0..10 {
            rlock.acquire(None).await?;
        }
        assert_eq!(rlock.depth(), 10);
        for _ in 0..10 {
            rlock.release()?;
        }
        assert_eq!(rlock.depth(), 0);
        assert!(matches!(rlock.release(), Err(Error::NotOwner { .. })));
        Ok::<_, Error>(())
    })
    .unwrap();
}

#[test]
fn reentrant_lock_excludes_other_threads() {
    block_on(async {
        let rlock = Rc::new(ReentrantLock::new());
        let log = Rc::new(RefCell::new(Vec::new()));

        let outer = rlock.lock().await?;
        let inner = rlock.lock().await?;

        let (r, l) = (rlock.clone(), log.clone());
        let other = Thread::spawn(async move {
            let _guard = r.lock().await?;
            l.borrow_mut().push("other");
            Ok::<_, Error>(())
        })?;

        Thread::sleep(Duration::from_millis(5)).await?;
        drop(inner);
        Thread::sleep(Duration::from_millis(5)).await?;
        // Depth 1 still held.
        assert!(log.borrow().is_empty());
        log.borrow_mut().push("main");
        drop(outer);

        other.join(None).await?;
        assert_eq!(*log.borrow(), vec!["main", "other"]);
        Ok::<_, Error>(())
    })
    .unwrap();
}

fn spawn_condition_waiter(cond: &Rc<Condition>, woke: &Rc<Cell<usize>>) -> Result<Thread, Error> {
    let (cond, woke) = (cond.clone(), woke.clone());
    Thread::spawn(async move {
        let _guard = cond.lock().await?;
        cond.wait(None).await?;
        woke.set(woke.get() + 1);
        Ok::<_, Error>(())
    })
}

#[test]
fn condition_notify_wakes_one() {
    block_on(async {
        let cond = Rc::new(Condition::new());
        let woke = Rc::new(Cell::new(0));
        let a = spawn_condition_waiter(&cond, &woke)?;
        let b = spawn_condition_waiter(&cond, &woke)?;
        Thread::sleep(Duration::ZERO).await?;

        {
            let _guard = cond.lock().await?;
            cond.notify(1)?;
            // Woken thread cannot proceed while we hold the lock.
            Thread::sleep(Duration::from_millis(5)).await?;
            assert_eq!(woke.get(), 0);
        }
        Thread::sleep(Duration::from_millis(20)).await?;
        assert_eq!(woke.get(), 1);

        {
            let _guard = cond.lock().await?;
            cond.notify(1)?;
        }
        join_all(vec![a, b]).await?;
        assert_eq!(woke.get(), 2);
        Ok::<_, Error>(())
    })
    .unwrap();
}

#[test]
fn condition_notify_all_wakes_both() {
    block_on(async {
        let cond = Rc::new(Condition::new());
        let woke = Rc::new(Cell::new(0));
        let a = spawn_condition_waiter(&cond, &woke)?;
        let b = spawn_condition_waiter(&cond, &woke)?;
        Thread::sleep(Duration::ZERO).await?;

        {
            let _guard = cond.lock().await?;
            cond.notify_all()?;
        }
        join_all(vec![a, b]).await?;
        assert_eq!(woke.get(), 2);
        Ok::<_, Error>(())
    })
    .unwrap();
}

#[test]
fn condition_without_notify_times_out() {
    block_on(async {
        let cond = Condition::new();
        let _guard = cond.lock().await?;
        let result = cond.wait(Some(Duration::from_millis(10))).await;
        assert!(matches!(result, Err(Error::WaitTimeout)));
        assert!(cond.reentrant_lock().is_owned());
        Ok::<_, Error>(())
    })
    .unwrap();
}

#[test]
fn condition_shares_external_lock() {
    block_on(async {
        let rlock = Rc::new(ReentrantLock::new());
        let cond = Condition::with_lock(rlock.clone());
        rlock.acquire(None).await?;
        cond.notify(3)?;
        rlock.release()?;
        assert!(matches!(cond.notify(1), Err(Error::NotOwner { .. })));
        Ok::<_, Error>(())
    })
    .unwrap();
}

#[test]
fn semaphore_never_goes_negative() {
    let peak = Rc::new(Cell::new(0usize));
    let p = peak.clone();
    block_on(async move {
        let sem = Rc::new(Semaphore::new(3));
        let active = Rc::new(Cell::new(0usize));
        let mut threads = Vec::new();
        for i in 0..20u64 {
            let (sem, active, p) = (sem.clone(), active.clone(), p.clone());
            threads.push(Thread::spawn(async move {
                let _permit = sem.lock().await?;
                active.set(active.get() + 1);
                p.set(p.get().max(active.get()));
                Thread::sleep(Duration::from_micros(200 * (i % 3))).await?;
                active.set(active.get() - 1);
                Ok::<_, Error>(())
            })?);
        }
        join_all(threads).await?;
        assert_eq!(sem.value(), 3);
        Ok::<_, Error>(())
    })
    .unwrap();
    assert_eq!(peak.get(), 3);
}

#[test]
fn bounded_semaphore_over_release() {
    block_on(async {
        let sem = BoundedSemaphore::new(2);
        sem.acquire(None).await?;
        sem.release()?;
        let err = sem.release().unwrap_err();
        assert!(err.is_usage());
        assert_eq!(sem.value(), 2);
        assert_eq!(sem.max(), 2);
        Ok::<_, Error>(())
    })
    .unwrap();
}

#[test]
fn timeouts_leave_primitives_usable() {
    block_on(async {
        let event = Event::new();
        assert!(event.wait(Some(Duration::from_millis(2))).await.unwrap_err().is_timeout());
        event.set();
        event.wait(Some(Duration::from_millis(2))).await?;

        let sem = Semaphore::new(0);
        assert!(sem.acquire(Some(Duration::from_millis(2))).await.is_err());
        sem.release();
        sem.acquire(Some(Duration::from_millis(2))).await?;

        let lock = Rc::new(Lock::new());
        let held = lock.lock().await?;
        let timed_out = Rc::new(Cell::new(false));
        let (l, t) = (lock.clone(), timed_out.clone());
        let loser = Thread::spawn(async move {
            t.set(l.acquire(Some(Duration::from_millis(2))).await.is_err());
            Ok::<_, Error>(())
        })?;
        loser.join(None).await?;
        assert!(timed_out.get());
        drop(held);
        let _again = lock.lock().await?;
        Ok::<_, Error>(())
    })
    .unwrap();
}
