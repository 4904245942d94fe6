use std::{env, net::SocketAddr, process::ExitCode};

use shoal::{Broker, BrokerConfig, Context, Registry, TaskError, Worker, WorkerConfig};
use tracing::{error, info};

const USAGE: &str = "usage:
    shoal broker <bind-addr> [peer-broker...]
    shoal worker <broker-addr>...
    shoal demo <n> [broker-addr...]";

fn main() -> ExitCode {
    tracing_subscriber::fmt::init();

    let args: Vec<String> = env::args().skip(1).collect();
    let result = match args.split_first() {
        Some((cmd, rest)) if cmd == "broker" => broker(rest),
        Some((cmd, rest)) if cmd == "worker" => worker(rest),
        Some((cmd, rest)) if cmd == "demo" => demo(rest),
        _ => Err(USAGE.to_owned()),
    };
    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{}", e);
            ExitCode::FAILURE
        }
    }
}

fn broker(args: &[String]) -> Result<(), String> {
    let (bind, peers) = args.split_first().ok_or(USAGE)?;
    let bind: SocketAddr = bind.parse().map_err(|e| format!("bad bind address {}: {}", bind, e))?;
    let runtime = tokio::runtime::Runtime::new().map_err(|e| e.to_string())?;
    runtime.block_on(async {
        let broker = Broker::bind(
            BrokerConfig::builder()
                .bind(bind)
                .peers(peers.to_vec())
                .build(),
        )
        .map_err(|e| e.to_string())?;
        info!(addr = %broker.addr(), "starting broker");
        broker.run().await.map_err(|e| e.to_string())
    })
}

fn worker(brokers: &[String]) -> Result<(), String> {
    if brokers.is_empty() {
        return Err(USAGE.to_owned());
    }
    let config = WorkerConfig::builder().brokers(brokers.to_vec()).build();
    let worker = Worker::new(config, registry()).map_err(|e| e.to_string())?;
    info!(addr = %worker.address(), "serving");
    worker.serve().map_err(|e| e.to_string())
}

/// Runs the nested sum-of-squares job, locally when no broker is given.
fn demo(args: &[String]) -> Result<(), String> {
    let (n, brokers) = args.split_first().ok_or(USAGE)?;
    let n: u64 = n.parse().map_err(|e| format!("bad n {}: {}", n, e))?;
    let config = WorkerConfig::builder()
        .brokers(brokers.to_vec())
        .origin(true)
        .build();
    let worker = Worker::new(config, registry()).map_err(|e| e.to_string())?;
    match worker.run(move |ctx| ctx.submit::<u64, u64>("func0", &n)?.result()) {
        Ok(total) => {
            println!("{}", total);
            Ok(())
        }
        Err(e) => {
            error!("job failed: {}", e);
            Err(e.to_string())
        }
    }
}

fn registry() -> Registry {
    Registry::new()
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
