use criterion::{black_box, criterion_group, criterion_main, Criterion};
use fastlock::{mock::test_config, LockingConfig, MonitorRuntime, ObjectHeader};

fn bench_enter_exit(c: &mut Criterion, name: &str, config: LockingConfig, inflate: bool) {
    let runtime = MonitorRuntime::new(LockingConfig {
        profile_monitors: false,
        verify_balanced_monitors: false,
        ..config
    })
    .unwrap();
    let locking = runtime.locking();
    let me = runtime.attach_current_thread("bench");
    let object = ObjectHeader::new(&runtime.new_class(name));
    if inflate {
        runtime.inflate(&me, &object);
    }

    c.bench_function(name, |b| {
        b.iter(|| {
            locking.enter(&me, black_box(&object));
            locking.exit(&me, black_box(&object));
        });
    });

    runtime.detach_current_thread(me).unwrap();
}

pub fn criterion_benchmark(c: &mut Criterion) {
    bench_enter_exit(c, "biased", test_config(), false);
    bench_enter_exit(
        c,
        "thin",
        LockingConfig {
            use_biased_locking: false,
            ..test_config()
        },
        false,
    );
    bench_enter_exit(
        c,
        "inflated",
        LockingConfig {
            use_biased_locking: false,
            ..test_config()
        },
        true,
    );
    bench_enter_exit(
        c,
        "runtime only",
        LockingConfig {
            use_fast_locking: false,
            use_biased_locking: false,
            ..test_config()
        },
        false,
    );

    c.bench_function("thin recursive", |b| {
        let runtime = MonitorRuntime::new(LockingConfig {
            use_biased_locking: false,
            ..LockingConfig::default()
        })
        .unwrap();
        let locking = runtime.locking();
        let me = runtime.attach_current_thread("bench");
        let object = ObjectHeader::new(&runtime.new_class("Recursive"));

        locking.enter(&me, &object);
        b.iter(|| {
            locking.enter(&me, black_box(&object));
            locking.exit(&me, black_box(&object));
        });
        locking.exit(&me, &object);
    });
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
