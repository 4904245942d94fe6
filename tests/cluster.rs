//! Jobs spread over a loopback cluster: one broker, a few service workers
//! and an origin, each with its own QUIC endpoint.

use std::{
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

use shoal::{
    Broker, BrokerConfig, Context, NetError, Registry, TaskError, Worker, WorkerConfig,
    WorkerError,
};

fn registry() -> Registry {
    Registry::new()
        .with("square", |_: &Context, n: u64| Ok(n * n))
        .with("sleep", |_: &Context, ms: u64| {
            thread::sleep(Duration::from_millis(ms));
            Ok(ms)
        })
        .with("where", |ctx: &Context, _: u64| Ok(ctx.worker_addr().to_string()))
        .with("scaled", |ctx: &Context, n: u64| {
            let scale = ctx
                .shared::<u64>("scale", Some(Duration::from_secs(5)))?
                .ok_or_else(|| TaskError::raised("scale was never published"))?;
            Ok(scale * n)
        })
        .with("fail", |_: &Context, msg: String| -> Result<u64, TaskError> {
            Err(TaskError::raised(msg))
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
}

struct Cluster {
    broker: String,
    broker_thread: JoinHandle<Result<(), NetError>>,
    services: Vec<JoinHandle<Result<(), WorkerError>>>,
}

impl Cluster {
    /// Starts a broker and `services` workers serving it, and gives the
    /// workers a moment to announce their capacity.
    fn start(services: usize) -> Self {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let broker = {
            let _guard = runtime.enter();
            Broker::bind(BrokerConfig::default()).unwrap()
        };
        let addr = broker.addr().to_string();
        let broker_thread = thread::spawn(move || runtime.block_on(broker.run()));

        let services = (0..services)
            .map(|_| {
                let config = WorkerConfig::builder().brokers(vec![addr.clone()]).build();
                thread::spawn(move || Worker::new(config, registry())?.serve())
            })
            .collect();
        thread::sleep(Duration::from_millis(500));
        Self {
            broker: addr,
            broker_thread,
            services,
        }
    }

    fn origin(&self) -> Worker {
        let config = WorkerConfig::builder()
            .brokers(vec![self.broker.clone()])
            .origin(true)
            .build();
        Worker::new(config, registry()).unwrap()
    }

    /// Waits for the shutdown the origin broadcast on exit to take
    /// everything down.
    fn join(self) {
        for service in self.services {
            service.join().unwrap().unwrap();
        }
        self.broker_thread.join().unwrap().unwrap();
    }
}

#[test]
fn fan_out_over_the_cluster() {
    let cluster = Cluster::start(2);
    let total = cluster
        .origin()
        .run(|ctx| {
            let futures = (1..=4u64)
                .map(|n| ctx.submit::<u64, u64>("square", &n))
                .collect::<Result<Vec<_>, _>>()?;
            futures.iter().map(|f| f.result()).sum::<Result<u64, _>>()
        })
        .unwrap();
    assert_eq!(total, 30);
    cluster.join();
}

#[test]
fn nested_fan_out_over_the_cluster() {
    let cluster = Cluster::start(3);
    let total = cluster
        .origin()
        .run(|ctx| ctx.submit::<u64, u64>("func0", &6)?.result())
        .unwrap();
    assert_eq!(total, 378);
    cluster.join();
}

#[test]
fn tasks_run_on_other_workers() {
    let cluster = Cluster::start(2);
    let origin = cluster.origin();
    let me = origin.address().to_string();
    let places = origin
        .run(|ctx| ctx.map::<u64, String, _>("where", 0..16))
        .unwrap();
    assert_eq!(places.len(), 16);
    assert!(places.iter().any(|addr| *addr != me));
    cluster.join();
}

#[test]
fn sleeping_tasks_overlap() {
    let cluster = Cluster::start(4);
    let (mut values, elapsed) = cluster
        .origin()
        .run(|ctx| {
            let began = Instant::now();
            let futures = (0..4)
                .map(|_| ctx.submit::<u64, u64>("sleep", &400))
                .collect::<Result<Vec<_>, _>>()?;
            let values = ctx
                .as_completed(futures, Some(Duration::from_secs(20)))
                .map(|done| done.and_then(|f| f.result()))
                .collect::<Result<Vec<_>, _>>()?;
            Ok((values, began.elapsed()))
        })
        .unwrap();
    values.sort_unstable();
    assert_eq!(values, vec![400; 4]);
    assert!(elapsed < Duration::from_millis(1600), "took {:?}", elapsed);
    cluster.join();
}

#[test]
fn map_keeps_argument_order_over_the_cluster() {
    let cluster = Cluster::start(4);
    let values = cluster
        .origin()
        .run(|ctx| ctx.map::<u64, u64, _>("sleep", [400, 300, 200, 100]))
        .unwrap();
    assert_eq!(values, vec![400, 300, 200, 100]);
    cluster.join();
}

#[test]
fn map_as_completed_yields_in_completion_order() {
    let cluster = Cluster::start(4);
    let values = cluster
        .origin()
        .run(|ctx| {
            ctx.map_as_completed::<u64, u64, _>("sleep", [400, 300, 200, 100])?
                .collect::<Result<Vec<_>, _>>()
        })
        .unwrap();
    assert_eq!(values, vec![100, 200, 300, 400]);
    cluster.join();
}

#[test]
fn clusters_shut_down_cleanly_every_time() {
    for round in 0..10u64 {
        let cluster = Cluster::start(2);
        let total = cluster
            .origin()
            .run(move |ctx| {
                let values = ctx.map::<u64, u64, _>("square", 1..=4)?;
                Ok(values.into_iter().sum::<u64>() + round)
            })
            .unwrap();
        assert_eq!(total, 30 + round);
        cluster.join();
    }
}

#[test]
fn shared_constants_reach_every_worker() {
    let cluster = Cluster::start(2);
    let values = cluster
        .origin()
        .run(|ctx| {
            ctx.set_shared("scale", &3u64)?;
            ctx.map::<u64, u64, _>("scaled", 1..=6)
        })
        .unwrap();
    assert_eq!(values, vec![3, 6, 9, 12, 15, 18]);
    cluster.join();
}

#[test]
fn remote_failures_keep_their_kind() {
    let cluster = Cluster::start(2);
    let errors = cluster
        .origin()
        .run(|ctx| {
            let futures = (0..4)
                .map(|i| ctx.submit::<String, u64>("fail", &format!("bad {}", i)))
                .collect::<Result<Vec<_>, _>>()?;
            Ok(futures.iter().map(|f| f.result()).collect::<Vec<_>>())
        })
        .unwrap();
    for (i, err) in errors.into_iter().enumerate() {
        assert_eq!(err, Err(TaskError::Raised(format!("bad {}", i))));
    }
    cluster.join();
}

#[test]
fn unreachable_broker_fails_fast() {
    let config = WorkerConfig::builder()
        .brokers(vec!["127.0.0.1:9".to_string()])
        .connect_timeout(Duration::from_millis(300))
        .build();
    let began = Instant::now();
    assert!(Worker::new(config, registry()).is_err());
    assert!(began.elapsed() < Duration::from_secs(5));
}
