mod common;

use std::sync::Arc;

use sct_sched::*;

const L0: ResourceId = ResourceId(0);
const L1: ResourceId = ResourceId(1);
const M: ResourceId = ResourceId(0x10);
const C: ResourceId = ResourceId(0x11);

fn philosophers() -> ThreadedTarget {
    ThreadedTarget::new("threaded-dining", |ctx: &Ctx| {
        let a = ctx.spawn(|ctx: &Ctx| {
            ctx.lock(L0);
            ctx.lock(L1);
            ctx.unlock(L1);
            ctx.unlock(L0);
        });
        let b = ctx.spawn(|ctx: &Ctx| {
            ctx.lock(L1);
            ctx.lock(L0);
            ctx.unlock(L0);
            ctx.unlock(L1);
        });
        ctx.join(a);
        ctx.join(b);
    })
}

fn explorer(config: SchedConfig) -> Explorer {
    Explorer::new(config, Arc::new(StaticInfo::new()))
}

#[test]
fn test_threaded_dining_deadlocks_and_tears_down() {
    common::setup_test();
    let mut config = common::config(StrategyKind::Random, 42, 200);
    config.stop_on_deadlock = true;
    let report = explorer(config)
        .explore(|_| Ok(philosophers()), |_| {})
        .unwrap();
    assert_eq!(report.deadlocks(), 1);
}

#[test]
fn test_threaded_counter_sees_every_increment() {
    common::setup_test();
    let report = explorer(common::config(StrategyKind::Random, 9, 20))
        .explore(
            |_| {
                Ok(ThreadedTarget::new("threaded-counter", |ctx: &Ctx| {
                    let workers: Vec<_> = (0..3)
                        .map(|_| {
                            ctx.spawn(|ctx: &Ctx| {
                                ctx.fetch_add(0, 1);
                                ctx.yield_now();
                                ctx.fetch_add(0, 1);
                            })
                        })
                        .collect();
                    for w in workers {
                        ctx.join(w);
                    }
                    assert_eq!(ctx.load(0), 6);
                }))
            },
            |_| {},
        )
        .unwrap();
    assert_eq!(report.exit_code(), 0);
    assert!(report.distinct_schedules() > 1);
}

#[test]
fn test_threaded_condition_handoff() {
    common::setup_test();
    let report = explorer(common::config(StrategyKind::Random, 1, 30))
        .explore(
            |_| {
                Ok(ThreadedTarget::new("threaded-handoff", |ctx: &Ctx| {
                    let waiter = ctx.spawn(|ctx: &Ctx| {
                        ctx.lock(M);
                        while ctx.load(0) == 0 {
                            ctx.cond_wait(C, M);
                        }
                        ctx.unlock(M);
                    });
                    ctx.lock(M);
                    ctx.fetch_add(0, 1);
                    ctx.signal(C);
                    ctx.unlock(M);
                    ctx.join(waiter);
                }))
            },
            |_| {},
        )
        .unwrap();
    assert_eq!(report.exit_code(), 0, "{report}");
}

#[test]
fn test_threaded_barrier_and_try_lock() {
    common::setup_test();
    let b = ResourceId(0x20);
    let report = explorer(common::config(StrategyKind::Random, 2, 20))
        .explore(
            |_| {
                Ok(ThreadedTarget::new("threaded-barrier", move |ctx: &Ctx| {
                    let w = ctx.spawn(move |ctx: &Ctx| {
                        ctx.fetch_add(0, 1);
                        ctx.barrier_wait(b, 2);
                        assert_eq!(ctx.load(0), 2);
                    });
                    ctx.fetch_add(0, 1);
                    ctx.barrier_wait(b, 2);
                    if ctx.try_lock(M) {
                        ctx.unlock(M);
                    }
                    ctx.join(w);
                }))
            },
            |_| {},
        )
        .unwrap();
    assert_eq!(report.exit_code(), 0, "{report}");
}

#[test]
fn test_threaded_panic_is_fatal() {
    common::setup_test();
    let err = explorer(common::config(StrategyKind::Random, 0, 1))
        .explore(
            |_| {
                Ok(ThreadedTarget::new("threaded-panic", |ctx: &Ctx| {
                    ctx.yield_now();
                    panic!("assertion in target");
                }))
            },
            |_| {},
        )
        .unwrap_err();
    assert!(matches!(err, SchedError::Target(_)), "{err}");
}

#[test]
fn test_stalled_thread_is_watchdog_exit() {
    common::setup_test();
    let mut config = common::config(StrategyKind::Random, 0, 1);
    config.watchdog_timeout_ms = Some(50);
    let report = explorer(config)
        .explore(
            |_| {
                Ok(ThreadedTarget::new("threaded-stall", |ctx: &Ctx| {
                    ctx.yield_now();
                    std::thread::sleep(std::time::Duration::from_millis(500));
                }))
            },
            |_| {},
        )
        .unwrap();
    assert_eq!(report.watchdogs(), 1);
}
