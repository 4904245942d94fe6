//! End-to-end runs of a worker without brokers: every task stays local and
//! the scheduler interleaves them on one worker.

use std::{
    sync::{Arc, Mutex},
    thread,
    time::{Duration, Instant},
};

use shoal::{
    Completion, Context, GroupId, Registry, ReturnWhen, TaskError, Worker, WorkerConfig,
    WorkerError,
};

fn registry() -> Registry {
    Registry::new()
        .with("square", |_: &Context, n: u64| Ok(n * n))
        .with("fail", |_: &Context, msg: String| -> Result<u64, TaskError> {
            Err(TaskError::raised(msg))
        })
        .with("explode", |_: &Context, _: u64| -> Result<u64, TaskError> {
            panic!("kaboom")
        })
        .with("sleep", |_: &Context, ms: u64| {
            thread::sleep(Duration::from_millis(ms));
            Ok(ms)
        })
        .with("func0", |ctx: &Context, n: u64| {
            ctx.submit::<u64, u64>("func1", &n)?.result()
        })
        .with("func1", |ctx: &Context, n: u64| {
            Ok(ctx.map::<u64, u64, _>("func2", 1..=n)?.into_iter().sum::<u64>())
        })
        .with("func2", |ctx: &Context, n: u64| {
            let futures = (1..=n)
                .map(|i| ctx.submit::<u64, u64>("func3", &i))
                .collect::<Result<Vec<_>, TaskError>>()?;
            let mut total = 0;
            for done in ctx.as_completed(futures, None) {
                total += done?.result()?;
            }
            Ok(total)
        })
        .with("func3", |ctx: &Context, n: u64| {
            Ok(ctx.map::<u64, u64, _>("func4", 1..=n)?.into_iter().sum::<u64>())
        })
        .with("func4", |_: &Context, n: u64| Ok(n * n))
        .with("catch", |ctx: &Context, msg: String| {
            let child = ctx.submit::<String, u64>("fail", &msg)?;
            Ok(child.result() == Err(TaskError::Raised(msg)))
        })
}

fn worker() -> Worker {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    Worker::new(WorkerConfig::default(), registry()).unwrap()
}

#[test]
fn fan_out_fan_in() {
    let total = worker()
        .run(|ctx| {
            let futures = (1..=4u64)
                .map(|n| ctx.submit::<u64, u64>("square", &n))
                .collect::<Result<Vec<_>, _>>()?;
            futures.iter().map(|f| f.result()).sum::<Result<u64, _>>()
        })
        .unwrap();
    assert_eq!(total, 30);
}

#[test]
fn nested_fan_out() {
    let total = worker()
        .run(|ctx| ctx.submit::<u64, u64>("func0", &20)?.result())
        .unwrap();
    assert_eq!(total, 76153);
}

#[test]
fn nested_fan_out_small() {
    let total = worker()
        .run(|ctx| ctx.submit::<u64, u64>("func0", &6)?.result())
        .unwrap();
    assert_eq!(total, 378);
}

#[test]
fn failure_is_reraised_with_its_message() {
    let caught = worker()
        .run(|ctx| ctx.submit::<String, bool>("catch", &"bad input".to_string())?.result())
        .unwrap();
    assert!(caught);
}

#[test]
fn failure_reaches_the_root() {
    let err = worker()
        .run(|ctx| ctx.submit::<String, u64>("fail", &"no luck".to_string())?.result())
        .unwrap_err();
    match err {
        WorkerError::Root(TaskError::Raised(msg)) => assert_eq!(msg, "no luck"),
        other => panic!("unexpected error: {}", other),
    }
}

#[test]
fn panic_becomes_a_failure() {
    let err = worker()
        .run(|ctx| {
            let f = ctx.submit::<u64, u64>("explode", &1)?;
            Ok(f.result())
        })
        .unwrap()
        .unwrap_err();
    assert_eq!(err, TaskError::Panicked("kaboom".into()));
}

#[test]
fn unknown_function_is_refused_at_submit() {
    let err = worker()
        .run(|ctx| ctx.submit::<u64, u64>("nope", &1).map(|_| ()))
        .unwrap_err();
    assert!(matches!(err, WorkerError::Root(TaskError::UnknownFunction(name)) if name == "nope"));
}

#[test]
fn zero_timeout_wait_does_not_block() {
    let (split, elapsed, total) = worker()
        .run(|ctx| {
            let futures = (0..1000u64)
                .map(|n| ctx.submit::<u64, u64>("square", &n))
                .collect::<Result<Vec<_>, _>>()?;
            let began = Instant::now();
            let split = ctx.wait(&futures, Some(Duration::ZERO), ReturnWhen::AllCompleted)?;
            let elapsed = began.elapsed();
            let total = futures.iter().map(|f| f.result()).sum::<Result<u64, _>>()?;
            Ok((split, elapsed, total))
        })
        .unwrap();
    assert_eq!(split.done.len() + split.not_done.len(), 1000);
    assert!(elapsed < Duration::from_secs(1));
    assert_eq!(total, (0..1000u64).map(|n| n * n).sum::<u64>());
}

#[test]
fn repeated_zero_timeout_waits_agree() {
    let (first, second) = worker()
        .run(|ctx| {
            let futures = (0..10u64)
                .map(|n| ctx.submit::<u64, u64>("square", &n))
                .collect::<Result<Vec<_>, _>>()?;
            let first = ctx.wait(&futures, Some(Duration::ZERO), ReturnWhen::AllCompleted)?;
            let second = ctx.wait(&futures, Some(Duration::ZERO), ReturnWhen::AllCompleted)?;
            Ok((first, second))
        })
        .unwrap();
    assert_eq!(first, second);
}

#[test]
fn wait_for_everything() {
    let split = worker()
        .run(|ctx| {
            let futures = (0..8u64)
                .map(|n| ctx.submit::<u64, u64>("square", &n))
                .collect::<Result<Vec<_>, _>>()?;
            ctx.wait(&futures, None, ReturnWhen::AllCompleted)
        })
        .unwrap();
    assert_eq!(split.done.len(), 8);
    assert!(split.not_done.is_empty());
}

#[test]
fn first_exception_returns_early() {
    let split = worker()
        .run(|ctx| {
            let bad = ctx.submit::<String, u64>("fail", &"first".to_string())?;
            let good = ctx.submit::<u64, u64>("square", &2)?;
            let futures = vec![bad, good];
            ctx.wait(&futures, None, ReturnWhen::FirstException)
        })
        .unwrap();
    assert_eq!(split.done.len(), 1);
    assert_eq!(split.not_done.len(), 1);
}

#[test]
fn map_keeps_argument_order() {
    let values = worker()
        .run(|ctx| ctx.map::<u64, u64, _>("square", [5, 1, 4, 2]))
        .unwrap();
    assert_eq!(values, vec![25, 1, 16, 4]);
}

#[test]
fn map_reduce_folds_every_result() {
    let total = worker()
        .run(|ctx| ctx.map_reduce::<u64, u64, _, _>("square", 1..=10, |a, b| a + b))
        .unwrap();
    assert_eq!(total, Some(385));

    let empty = worker()
        .run(|ctx| ctx.map_reduce::<u64, u64, _, _>("square", Vec::new(), |a, b| a + b))
        .unwrap();
    assert_eq!(empty, None);
}

#[test]
fn as_completed_yields_every_future() {
    let mut values = worker()
        .run(|ctx| {
            ctx.map_as_completed::<u64, u64, _>("square", 1..=5)?
                .collect::<Result<Vec<_>, _>>()
        })
        .unwrap();
    values.sort_unstable();
    assert_eq!(values, vec![1, 4, 9, 16, 25]);
}

#[test]
fn cancel_before_start() {
    let (cancelled, flagged, result, again) = worker()
        .run(|ctx| {
            let f = ctx.submit::<u64, u64>("square", &3)?;
            let cancelled = f.cancel();
            Ok((cancelled, f.cancelled(), f.result(), f.cancel()))
        })
        .unwrap();
    assert!(cancelled);
    assert!(flagged);
    assert_eq!(result, Err(TaskError::Cancelled));
    assert!(!again);
}

#[test]
fn cancel_after_completion_is_refused() {
    let (cancelled, value) = worker()
        .run(|ctx| {
            let f = ctx.submit::<u64, u64>("square", &3)?;
            let value = f.result()?;
            Ok((f.cancel(), value))
        })
        .unwrap();
    assert!(!cancelled);
    assert_eq!(value, 9);
}

#[test]
fn result_timeout_expires_while_a_sibling_runs() {
    let (timed_out, late) = worker()
        .run(|ctx| {
            let _hog = ctx.submit::<u64, u64>("sleep", &300)?;
            let quick = ctx.submit::<u64, u64>("square", &7)?;
            let timed_out = quick.result_timeout(Duration::from_millis(50));
            Ok((timed_out, quick.result()?))
        })
        .unwrap();
    assert_eq!(timed_out, Err(TaskError::Timeout));
    assert_eq!(late, 49);
}

#[test]
fn result_timeout_returns_value_in_time() {
    let value = worker()
        .run(|ctx| {
            ctx.submit::<u64, u64>("square", &6)?
                .result_timeout(Duration::from_secs(5))
        })
        .unwrap();
    assert_eq!(value, 36);
}

#[test]
fn done_callbacks_fire_once_in_order() {
    let seen: Arc<Mutex<Vec<&'static str>>> = Arc::default();
    let log = seen.clone();
    worker()
        .run(move |ctx| {
            let f = ctx.submit::<u64, u64>("square", &2)?;
            let first = log.clone();
            f.add_done_callback(move |_| first.lock().unwrap().push("first"))?;
            let second = log.clone();
            f.add_done_callback(move |_| second.lock().unwrap().push("second"))?;
            f.result()?;
            let late = log.clone();
            f.add_done_callback(move |done: &Completion| {
                assert_eq!(done.result::<u64>(), Ok(4));
                late.lock().unwrap().push("late");
            })?;
            Ok(())
        })
        .unwrap();
    assert_eq!(*seen.lock().unwrap(), vec!["first", "second", "late"]);
}

#[test]
fn panicking_callback_is_contained() {
    let value = worker()
        .run(|ctx| {
            let f = ctx.submit::<u64, u64>("square", &5)?;
            f.add_done_callback(|_| panic!("callback bug"))?;
            f.result()
        })
        .unwrap();
    assert_eq!(value, 25);
}

#[test]
fn group_callbacks_see_every_completion() {
    let seen: Arc<Mutex<Vec<u64>>> = Arc::default();
    let log = seen.clone();
    let worker = worker();
    worker.on_group(GroupId(7), move |done| {
        if let Ok(value) = done.result::<u64>() {
            log.lock().unwrap().push(value);
        }
    });
    worker
        .run(|ctx| {
            let futures = (1..=3u64)
                .map(|n| ctx.submit_grouped::<u64, u64>("square", &n, &[GroupId(7)]))
                .collect::<Result<Vec<_>, _>>()?;
            let untagged = ctx.submit::<u64, u64>("square", &10)?;
            for f in futures.iter().chain([&untagged]) {
                f.result()?;
            }
            Ok(())
        })
        .unwrap();
    let mut seen = seen.lock().unwrap().clone();
    seen.sort_unstable();
    assert_eq!(seen, vec![1, 4, 9]);
}

#[test]
fn exception_reports_without_raising() {
    let (bad, good) = worker()
        .run(|ctx| {
            let bad = ctx.submit::<String, u64>("fail", &"oops".to_string())?;
            let good = ctx.submit::<u64, u64>("square", &1)?;
            Ok((bad.exception()?, good.exception()?))
        })
        .unwrap();
    assert_eq!(bad, Some(TaskError::Raised("oops".into())));
    assert_eq!(good, None);
}

#[test]
fn shared_constants_are_write_once() {
    let (value, missing, again) = worker()
        .run(|ctx| {
            ctx.set_shared("scale", &3u64)?;
            let value = ctx.shared::<u64>("scale", None)?;
            let missing = ctx.shared::<u64>("offset", Some(Duration::from_millis(10)))?;
            let again = ctx.set_shared("scale", &4u64);
            Ok((value, missing, again))
        })
        .unwrap();
    assert_eq!(value, Some(3));
    assert_eq!(missing, None);
    assert!(matches!(again, Err(TaskError::InvalidState(_))));
}

#[test]
fn futures_report_progress() {
    let (before, after) = worker()
        .run(|ctx| {
            let f = ctx.submit::<u64, u64>("square", &9)?;
            let before = (f.done(), f.running());
            f.result()?;
            Ok((before, (f.done(), f.running())))
        })
        .unwrap();
    assert_eq!(before, (false, false));
    assert_eq!(after, (true, false));
}

#[test]
fn blocking_outside_a_task_is_refused() {
    let leaked = Arc::new(Mutex::new(None));
    let slot = leaked.clone();
    worker()
        .run(move |ctx| {
            *slot.lock().unwrap() = Some(ctx.submit::<u64, u64>("square", &2)?);
            Ok(())
        })
        .unwrap();
    let future = leaked.lock().unwrap().take().unwrap();
    assert!(future.result().is_err());
}
