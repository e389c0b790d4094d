use std::{process::ExitCode, sync::Arc, time::Instant};

use fastlock::{
    mock::{spawn_mutator, MockObject},
    runtime::options::{describe_flags, parse_locking_config},
    MonitorRuntime,
};

const THREADS: usize = 4;
const ITERATIONS: usize = 100_000;

fn main() -> ExitCode {
    env_logger::init();

    let args = std::env::args().skip(1).collect::<Vec<_>>();
    if args.iter().any(|arg| arg == "--help") {
        print!("usage: fastlock [flags]\n\n{}", describe_flags());
        return ExitCode::SUCCESS;
    }

    let mut config = match parse_locking_config(args, std::env::vars()) {
        Ok(config) => config,
        Err(error) => {
            eprintln!("{error}");
            return ExitCode::FAILURE;
        }
    };
    config.profile_monitors = true;

    let runtime = match MonitorRuntime::new(config) {
        Ok(runtime) => runtime,
        Err(error) => {
            eprintln!("{error}");
            return ExitCode::FAILURE;
        }
    };
    let locking = Arc::new(runtime.locking());

    // one object only ever touched by its first thread, one shared by all.
    let private = Arc::new(MockObject::new(&runtime.new_class("Private"), 0usize));
    let shared = Arc::new(MockObject::new(&runtime.new_class("Shared"), 0usize));

    let start = Instant::now();
    let private_owner = {
        let locking = locking.clone();
        let private = private.clone();
        spawn_mutator(&runtime, "private", move |me| {
            for _ in 0..ITERATIONS {
                private.synchronized(&locking, me, |value| *value += 1);
                me.safepoint_poll();
            }
        })
    };

    let workers = (0..THREADS)
        .map(|i| {
            let locking = locking.clone();
            let shared = shared.clone();
            spawn_mutator(&runtime, format!("shared-{i}"), move |me| {
                for _ in 0..ITERATIONS {
                    shared.synchronized(&locking, me, |value| *value += 1);
                    me.safepoint_poll();
                }
            })
        })
        .collect::<Vec<_>>();

    let mut failed = false;
    for handle in std::iter::once(private_owner).chain(workers) {
        match handle.join() {
            Ok(Ok(())) => {}
            Ok(Err(unbalanced)) => {
                eprintln!("{unbalanced}");
                failed = true;
            }
            Err(_) => failed = true,
        }
    }
    let elapsed = start.elapsed();

    let me = runtime.attach_current_thread("main");
    let private_total = private.synchronized(&locking, &me, |value| *value);
    let shared_total = shared.synchronized(&locking, &me, |value| *value);
    drop(me);

    println!("private: {private_total}, shared: {shared_total} in {elapsed:?}");
    println!("{} monitor(s) inflated", runtime.monitor_count());
    print!("{}", runtime.counters());

    if failed || private_total != ITERATIONS || shared_total != THREADS * ITERATIONS {
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}
