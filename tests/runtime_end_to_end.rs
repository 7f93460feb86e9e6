// tests/runtime_end_to_end.rs
//! Whole-runtime runs with real worker threads

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use taskweave::data::DataLayout;
use taskweave::sched::{ArchKind, WorkerId};
use taskweave::task::KernelContext;
use taskweave::{AccessMode, Codelet, Runtime, RuntimeConfig, RuntimeError, Task};

fn config(policy: &str, ncpus: usize, ncuda: usize) -> RuntimeConfig {
    let mut config = RuntimeConfig::default();
    config.topology.ncpus = ncpus;
    config.topology.ncuda = ncuda;
    config.topology.device_memory_mb = 4;
    config.sched.policy = policy.to_string();
    config.sched.seed = Some(7);
    config.observability.metrics = false;
    config.workers.idle_timeout_us = 200;
    config
}

fn add_one(ctx: &KernelContext<'_>) {
    let values: Vec<f64> = ctx.read_f64(0).iter().map(|v| v + 1.0).collect();
    ctx.write_f64(0, &values);
}

fn add_one_codelet() -> Arc<Codelet> {
    Arc::new(
        Codelet::new("add_one", 1)
            .with_implementation(ArchKind::Cpu, add_one)
            .with_implementation(ArchKind::Cuda, add_one),
    )
}

/// `ntiles` tiles, each incremented `rounds` times
fn run_tiles(runtime: &Runtime, ntiles: usize, rounds: usize) -> Vec<Vec<f64>> {
    let codelet = add_one_codelet();
    let tiles: Vec<_> = (0..ntiles)
        .map(|i| runtime.register_vector_f64(&[i as f64; 32]).unwrap())
        .collect();
    for _ in 0..rounds {
        for tile in &tiles {
            let task = Task::builder(Arc::clone(&codelet))
                .buffer(tile, AccessMode::ReadWrite)
                .build();
            runtime.submit(&task).unwrap();
        }
    }
    runtime.wait_for_all();
    let values = tiles.iter().map(|t| runtime.read_f64(t).unwrap()).collect();
    for tile in &tiles {
        runtime.unregister(tile).unwrap();
    }
    values
}

#[test]
fn test_every_policy_computes_the_same_result() {
    for policy in ["eager", "prio", "random", "ws", "dm", "dmda", "dmdas", "heft", "modular-eager", "modular-heft", "modular-random"] {
        let runtime = Runtime::new(config(policy, 2, 2)).unwrap();
        let values = run_tiles(&runtime, 6, 5);
        for (i, tile) in values.iter().enumerate() {
            assert!(
                tile.iter().all(|&v| v == i as f64 + 5.0),
                "{policy}: tile {i} holds {:?}",
                &tile[..2]
            );
        }
        let stats = runtime.stats();
        assert_eq!(stats.tasks.submitted, 30, "{policy}");
        assert_eq!(stats.tasks.executed, 30, "{policy}");
        assert_eq!(stats.tasks.lost, 0, "{policy}");
        assert_eq!(stats.queued, 0, "{policy}");
        runtime.shutdown();
    }
}

#[test]
fn test_readers_see_the_last_write() {
    let runtime = Runtime::new(config("dmda", 2, 1)).unwrap();
    let source = runtime.register_vector_f64(&[3.0; 8]).unwrap();
    let copies: Vec<_> = (0..4)
        .map(|_| runtime.register_vector_f64(&[0.0; 8]).unwrap())
        .collect();

    let double = Arc::new(
        Codelet::new("double", 1)
            .with_implementation(ArchKind::Cpu, |ctx| {
                let values: Vec<f64> = ctx.read_f64(0).iter().map(|v| v * 2.0).collect();
                ctx.write_f64(0, &values);
            })
            .with_implementation(ArchKind::Cuda, |ctx| {
                let values: Vec<f64> = ctx.read_f64(0).iter().map(|v| v * 2.0).collect();
                ctx.write_f64(0, &values);
            }),
    );
    let copy = Arc::new(
        Codelet::new("copy", 2)
            .with_implementation(ArchKind::Cpu, |ctx| ctx.write_f64(1, &ctx.read_f64(0)))
            .with_implementation(ArchKind::Cuda, |ctx| ctx.write_f64(1, &ctx.read_f64(0))),
    );

    let writer = Task::builder(double).buffer(&source, AccessMode::ReadWrite).build();
    runtime.submit(&writer).unwrap();
    for target in &copies {
        let task = Task::builder(Arc::clone(&copy))
            .buffer(&source, AccessMode::Read)
            .buffer(target, AccessMode::Write)
            .build();
        runtime.submit(&task).unwrap();
    }
    runtime.wait_for_all();

    for target in &copies {
        assert_eq!(runtime.read_f64(target).unwrap(), vec![6.0; 8]);
    }
    runtime.shutdown();
}

#[test]
fn test_partitioned_work_gathers_back() {
    let runtime = Runtime::new(config("eager", 2, 1)).unwrap();
    let vector = runtime
        .register_vector_f64(&(0..16).map(f64::from).collect::<Vec<_>>())
        .unwrap();

    let children = runtime.partition(&vector, 4).unwrap();
    assert_eq!(children.len(), 4);

    // The father is off limits while partitioned
    let on_father = Task::builder(add_one_codelet())
        .buffer(&vector, AccessMode::ReadWrite)
        .build();
    assert!(matches!(
        runtime.submit(&on_father),
        Err(RuntimeError::Partitioned(_))
    ));

    let codelet = add_one_codelet();
    for child in &children {
        let task = Task::builder(Arc::clone(&codelet))
            .buffer(child, AccessMode::ReadWrite)
            .build();
        runtime.submit(&task).unwrap();
    }
    runtime.wait_for_all();
    runtime.unpartition(&vector).unwrap();

    let expected: Vec<f64> = (1..17).map(f64::from).collect();
    assert_eq!(runtime.read_f64(&vector).unwrap(), expected);
    runtime.shutdown();
}

#[test]
fn test_scratch_buffer_is_private() {
    let runtime = Runtime::new(config("eager", 2, 0)).unwrap();
    let scratch = runtime.register(DataLayout::vector(4, 8), None).unwrap();
    let results: Vec<_> = (0..4)
        .map(|_| runtime.register_vector_f64(&[0.0]).unwrap())
        .collect();

    let codelet = Arc::new(
        Codelet::new("use_scratch", 2).with_implementation(ArchKind::Cpu, |ctx| {
            ctx.write_f64(0, &[1.0, 2.0, 3.0, 4.0]);
            let sum: f64 = ctx.read_f64(0).iter().sum();
            ctx.write_f64(1, &[sum]);
        }),
    );
    for result in &results {
        let task = Task::builder(Arc::clone(&codelet))
            .buffer(&scratch, AccessMode::Scratch)
            .buffer(result, AccessMode::Write)
            .build();
        runtime.submit(&task).unwrap();
    }
    runtime.wait_for_all();

    for result in &results {
        assert_eq!(runtime.read_f64(result).unwrap(), vec![10.0]);
    }
    runtime.shutdown();
}

#[test]
fn test_custom_context_only_uses_its_workers() {
    let runtime = Runtime::new(config("eager", 3, 0)).unwrap();
    let ctx = runtime
        .create_context("pinned", "heft", &[WorkerId(2)])
        .unwrap();

    let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
    let record = Arc::clone(&seen);
    let codelet = Arc::new(Codelet::new("where", 0).with_implementation(ArchKind::Cpu, move |ctx| {
        record.lock().push(ctx.worker);
    }));
    for _ in 0..8 {
        let task = Task::builder(Arc::clone(&codelet)).context(ctx).build();
        runtime.submit(&task).unwrap();
    }
    runtime.wait_for_all();

    assert_eq!(seen.lock().len(), 8);
    assert!(seen.lock().iter().all(|&worker| worker == WorkerId(2)));
    let stats = runtime.stats();
    let pinned = stats.contexts.iter().find(|c| c.id == ctx).unwrap();
    assert_eq!(pinned.policy, "heft");
    assert_eq!(pinned.nworkers, 1);
    assert_eq!(pinned.finished, 8);

    runtime.delete_context(ctx).unwrap();
    runtime.shutdown();
}

#[test]
fn test_async_copies_and_device_traffic() {
    let mut config = config("dmda", 1, 2);
    config.memory.async_copies = true;
    let runtime = Runtime::new(config).unwrap();

    let gpu_only = Arc::new(Codelet::new("gpu", 1).with_implementation(ArchKind::Cuda, add_one));
    let handles: Vec<_> = (0..4)
        .map(|_| runtime.register_vector_f64(&[1.0; 64]).unwrap())
        .collect();
    for handle in &handles {
        for _ in 0..3 {
            let task = Task::builder(Arc::clone(&gpu_only))
                .buffer(handle, AccessMode::ReadWrite)
                .build();
            runtime.submit(&task).unwrap();
        }
    }
    runtime.wait_for_all();

    for handle in &handles {
        assert_eq!(runtime.read_f64(handle).unwrap(), vec![4.0; 64]);
    }
    let stats = runtime.stats();
    assert_eq!(stats.tasks.executed, 12);
    // At least one transfer in and one back per handle
    assert!(stats.copies >= 8, "only {} copies", stats.copies);
    runtime.shutdown();
}

#[test]
fn test_acquire_waits_for_submitted_writers() {
    let runtime = Runtime::new(config("ws", 2, 0)).unwrap();
    let handle = runtime.register_vector_f64(&[0.0]).unwrap();
    let codelet = add_one_codelet();
    for _ in 0..20 {
        let task = Task::builder(Arc::clone(&codelet))
            .buffer(&handle, AccessMode::ReadWrite)
            .build();
        runtime.submit(&task).unwrap();
    }

    // Submitted before the acquire, so all twenty writes are visible
    let value = runtime
        .with_data(&handle, AccessMode::Read, |bytes| {
            f64::from_le_bytes(bytes[..8].try_into().unwrap())
        })
        .unwrap();
    assert_eq!(value, 20.0);
    runtime.shutdown();
}

#[test]
fn test_callbacks_and_shutdown() {
    let runtime = Runtime::new(config("modular-ws", 2, 0)).unwrap();
    let done = Arc::new(AtomicUsize::new(0));
    for _ in 0..16 {
        let counter = Arc::clone(&done);
        let task = Task::control()
            .callback(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .build();
        runtime.submit(&task).unwrap();
    }
    runtime.shutdown();
    assert_eq!(done.load(Ordering::SeqCst), 16);

    // Idempotent, and closed for business
    runtime.shutdown();
    let late = Task::control().build();
    assert!(matches!(runtime.submit(&late), Err(RuntimeError::ShutDown)));
}
