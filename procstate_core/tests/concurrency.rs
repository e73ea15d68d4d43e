//! Concurrent atomic exchange through independent registry attachments.

mod common;

use common::{init_logging, small_registry, unique_app};
use std::collections::HashSet;
use std::sync::{Arc, Barrier};
use std::thread;

const WRITERS: usize = 8;
const ROUNDS: usize = 200;

#[test]
fn exchange_never_observes_torn_values() {
    init_logging();
    let app = unique_app("conc_swap");
    let owner = small_registry(&app);
    let me = owner.register_self("counter", std::process::id() as i32, 0).unwrap();
    me.set_parameter("token", b"init").unwrap();

    let barrier = Arc::new(Barrier::new(WRITERS));
    let workers: Vec<_> = (0..WRITERS)
        .map(|w| {
            let app = app.clone();
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                // own attachment per writer
                let reg = small_registry(&app);
                let handle = reg.handle_for("counter").unwrap();
                barrier.wait();

                let mut observed = Vec::with_capacity(ROUNDS);
                for r in 0..ROUNDS {
                    // long values make a torn read easy to spot
                    let value = format!("w{:02}-r{:04}-", w, r).repeat(8);
                    let old = handle
                        .get_and_set_parameter_atomic("token", value.as_bytes())
                        .unwrap()
                        .expect("token vanished");
                    observed.push(String::from_utf8(old).unwrap());
                }
                observed
            })
        })
        .collect();

    let mut written: HashSet<String> = (0..WRITERS)
        .flat_map(|w| (0..ROUNDS).map(move |r| format!("w{:02}-r{:04}-", w, r).repeat(8)))
        .collect();
    written.insert("init".to_string());

    let mut seen = HashSet::new();
    for worker in workers {
        for old in worker.join().unwrap() {
            assert!(written.contains(&old), "torn or foreign value: {:?}", old);
            assert!(seen.insert(old.clone()), "value returned twice: {:?}", old);
        }
    }

    // every value except the last one written was handed back exactly once
    let last = String::from_utf8(me.get_parameter("token").unwrap().unwrap()).unwrap();
    assert!(!seen.contains(&last));
    seen.insert(last);
    assert_eq!(seen, written);
}

#[test]
fn concurrent_registration_keeps_names_unique() {
    init_logging();
    let app = unique_app("conc_register");
    let observer = small_registry(&app);

    let workers: Vec<_> = (0..8)
        .map(|i| {
            let app = app.clone();
            thread::spawn(move || {
                let reg = small_registry(&app);
                // two threads per name
                let name = format!("proc{}", i % 4);
                let handle = reg.register_self(&name, i as i32, 0).unwrap();
                // dropping the handle leaves the entry registered
                handle.set_parameter("id", &[i as u8]).unwrap();
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }

    let mut names = observer.list_processes().unwrap();
    names.sort();
    assert_eq!(names, vec!["proc0", "proc1", "proc2", "proc3"]);

    let usage = observer.usage().unwrap();
    assert!(usage.is_plausible(), "{}", usage);
    for p in &usage.processes {
        assert!(p.param_count <= 1);
    }
}
