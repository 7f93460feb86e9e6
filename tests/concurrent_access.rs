// tests/concurrent_access.rs
//! Application threads competing for shared handles

use parking_lot::{Condvar, Mutex};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use taskweave::data::{AccessMode, DataHandle, DataLayout, HandleId};
use taskweave::deps::{acquire_data, notify_data_dependencies, ReadySink};
use taskweave::task::TaskRef;

struct NoTasks;

impl ReadySink for NoTasks {
    fn push_ready(&self, task: TaskRef) {
        panic!("unexpected task {}", task.id());
    }
}

#[derive(Default)]
struct Holders {
    readers: AtomicUsize,
    writers: AtomicUsize,
}

fn wait_granted(handle: &DataHandle, mode: AccessMode) {
    let granted = Arc::new((Mutex::new(false), Condvar::new()));
    let signal = Arc::clone(&granted);
    acquire_data(handle, mode, move || {
        *signal.0.lock() = true;
        signal.1.notify_all();
    });
    let mut done = granted.0.lock();
    while !*done {
        granted.1.wait(&mut done);
    }
}

#[test]
fn test_writers_are_exclusive_and_nobody_deadlocks() {
    const NTHREADS: usize = 8;
    const ROUNDS: usize = 300;
    let handles: Arc<Vec<_>> = Arc::new(
        (0..4)
            .map(|i| DataHandle::register(HandleId(i), DataLayout::Variable { elem_size: 8 }, None, 1))
            .collect(),
    );
    let holders: Arc<Vec<Holders>> = Arc::new((0..4).map(|_| Holders::default()).collect());

    let threads: Vec<_> = (0..NTHREADS)
        .map(|t| {
            let handles = Arc::clone(&handles);
            let holders = Arc::clone(&holders);
            thread::spawn(move || {
                for round in 0..ROUNDS {
                    // Two distinct handles, always taken in id order
                    let first = (t + round) % 4;
                    let second = (first + 1 + round % 3) % 4;
                    let mut picked = [first, second];
                    picked.sort_unstable();
                    let mode = if (t + round) % 3 == 0 {
                        AccessMode::Write
                    } else {
                        AccessMode::Read
                    };

                    for &i in &picked {
                        wait_granted(&handles[i], mode);
                        let holder = &holders[i];
                        if mode == AccessMode::Write {
                            assert_eq!(holder.writers.fetch_add(1, Ordering::SeqCst), 0);
                            assert_eq!(holder.readers.load(Ordering::SeqCst), 0);
                        } else {
                            holder.readers.fetch_add(1, Ordering::SeqCst);
                            assert_eq!(holder.writers.load(Ordering::SeqCst), 0);
                        }
                    }
                    thread::yield_now();
                    for &i in &picked {
                        let holder = &holders[i];
                        if mode == AccessMode::Write {
                            holder.writers.fetch_sub(1, Ordering::SeqCst);
                        } else {
                            holder.readers.fetch_sub(1, Ordering::SeqCst);
                        }
                        notify_data_dependencies(&handles[i], &NoTasks);
                    }
                }
            })
        })
        .collect();

    for thread in threads {
        thread.join().unwrap();
    }
    for handle in handles.iter() {
        let header = handle.lock();
        assert_eq!(header.refcnt, 0);
        assert!(header.req_list.is_empty());
    }
}
