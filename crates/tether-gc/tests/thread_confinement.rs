use std::rc::Rc;
use std::thread;

use tether_gc::{register, release, resolve, stats, with_registry, RootsConfig};

#[test]
fn test_each_thread_has_its_own_registry() {
    let _ = env_logger::builder().is_test(true).try_init();
    let slot = register(Rc::new(String::from("main"))).unwrap();

    let worker = thread::spawn(move || {
        // The slot names an entry in the main thread's table only.
        let here = stats();
        (here.live, resolve(slot).is_none())
    });
    let (live, missing) = worker.join().unwrap();
    assert_eq!(live, 0);
    assert!(missing);

    assert_eq!(stats().live, 1);
    release(slot).unwrap();
    assert_eq!(stats().live, 0);
}

#[test]
fn test_configuration_is_per_thread() {
    tether_gc::configure(&RootsConfig {
        initial_capacity: 2,
        max_entries: Some(2),
    });
    assert!(tether_gc::reserve(3).is_err());

    let other = thread::spawn(|| tether_gc::reserve(3).is_ok());
    assert!(other.join().unwrap());
}

#[test]
fn test_with_registry_sees_pinned_values() {
    let a = register(Rc::new(1u16)).unwrap();
    let b = register(Rc::new(2u16)).unwrap();
    let total: u16 = with_registry(|roots| {
        [a, b]
            .iter()
            .map(|slot| *roots.get_as::<u16>(*slot).unwrap())
            .sum()
    });
    assert_eq!(total, 3);
    release(a).unwrap();
    release(b).unwrap();
}
