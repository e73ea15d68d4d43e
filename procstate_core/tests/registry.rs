//! Registry and handle behaviour through the public API.

mod common;

use common::{init_logging, small_registry, unique_app};
use procstate_core::registry::MAX_PARAM_LENGTH;
use procstate_core::{ProcStateError, ProcessRegistry, Resource};
use std::collections::HashSet;
use std::time::Duration;

fn payload_snapshot(registry: &ProcessRegistry) -> Vec<u8> {
    registry.segment().locked().unwrap().data().to_vec()
}

#[test]
fn listed_names_are_unique() {
    init_logging();
    let reg = small_registry(&unique_app("reg_unique"));

    let names = ["fdp", "radar", "tracker", "display"];
    let _handles: Vec<_> = names
        .iter()
        .enumerate()
        .map(|(i, n)| reg.register_self(n, 1000 + i as i32, 0).unwrap())
        .collect();
    // registering an existing name again must not add a second entry
    reg.register_self("radar", 2000, 0).unwrap();

    let listed = reg.list_processes().unwrap();
    assert_eq!(listed.len(), names.len());
    let set: HashSet<_> = listed.iter().map(String::as_str).collect();
    assert_eq!(set, names.iter().copied().collect());
}

#[test]
fn parameter_round_trip() {
    init_logging();
    let reg = small_registry(&unique_app("reg_roundtrip"));
    let me = reg.register_self("fdp", 1, 0).unwrap();

    let values: Vec<Vec<u8>> = vec![
        Vec::new(),
        b"1".to_vec(),
        vec![0u8; 17],
        (0..=255u8).take(MAX_PARAM_LENGTH).collect(),
    ];
    for (i, value) in values.iter().enumerate() {
        let key = format!("k{}", i);
        me.set_parameter(&key, value).unwrap();
        assert_eq!(me.get_parameter(&key).unwrap().as_deref(), Some(value.as_slice()));
    }

    // overwrite keeps position and count
    me.set_parameter("k1", b"2").unwrap();
    assert_eq!(me.get_parameter("k1").unwrap(), Some(b"2".to_vec()));
    assert_eq!(me.list_parameters().unwrap(), vec!["k0", "k1", "k2", "k3"]);
    assert_eq!(me.get_parameter("missing").unwrap(), None);
    assert!(me.has_parameter("k2").unwrap());
}

#[test]
fn oversized_value_leaves_segment_untouched() {
    init_logging();
    let reg = small_registry(&unique_app("reg_bound"));
    let me = reg.register_self("fdp", 1, 0).unwrap();
    me.set_parameter("a", b"first").unwrap();
    me.set_parameter("b", &[7u8; MAX_PARAM_LENGTH]).unwrap();

    let before = payload_snapshot(&reg);
    for key in ["a", "b", "c"] {
        let err = me.set_parameter(key, &[1u8; MAX_PARAM_LENGTH + 1]).unwrap_err();
        assert!(matches!(err, ProcStateError::ValueTooLarge { .. }));
        assert!(err.is_fatal());
        assert!(me
            .get_and_set_parameter_atomic(key, &[1u8; MAX_PARAM_LENGTH + 1])
            .is_err());
    }
    assert_eq!(payload_snapshot(&reg), before);

    assert_eq!(me.get_parameter("a").unwrap(), Some(b"first".to_vec()));
    assert_eq!(me.get_parameter("b").unwrap(), Some(vec![7u8; MAX_PARAM_LENGTH]));
    assert!(!me.has_parameter("c").unwrap());
}

#[test]
fn foreign_handle_resolves_lazily() {
    init_logging();
    let app = unique_app("reg_lazy");
    let owner_reg = small_registry(&app);
    let observer_reg = small_registry(&app);

    let radar = observer_reg.handle_for("radar").unwrap();
    assert!(!radar.is_valid());
    assert!(matches!(
        radar.get_parameter("mode"),
        Err(ProcStateError::NotFound(_))
    ));

    let me = owner_reg.register_self("radar", 77, 3).unwrap();
    me.set_parameter("mode", b"scan").unwrap();

    assert!(radar.is_valid());
    assert_eq!(radar.get_parameter("mode").unwrap(), Some(b"scan".to_vec()));
    assert_eq!(radar.pid().unwrap(), 77);
    assert_eq!(radar.flags().unwrap(), 3);

    // writes through the foreign handle land in the owner's chain
    radar.set_parameter("range", b"40nm").unwrap();
    assert_eq!(me.get_parameter("range").unwrap(), Some(b"40nm".to_vec()));

    me.unregister().unwrap();
    assert!(!radar.is_valid());
}

#[test]
fn atomic_exchange_returns_previous_value() {
    init_logging();
    let reg = small_registry(&unique_app("reg_swap"));
    let me = reg.register_self("fdp", 1, 0).unwrap();

    assert_eq!(me.get_and_set_parameter_atomic("token", b"a").unwrap(), None);
    assert_eq!(
        me.get_and_set_parameter_atomic("token", b"b").unwrap(),
        Some(b"a".to_vec())
    );
    assert_eq!(me.get_parameter("token").unwrap(), Some(b"b".to_vec()));
}

#[test]
fn param_pool_exhaustion_is_recoverable() {
    init_logging();
    let reg = small_registry(&unique_app("reg_params"));
    let me = reg.register_self("fdp", 1, 0).unwrap();

    for i in 0..32 {
        me.set_parameter(&format!("p{}", i), b"x").unwrap();
    }
    let err = me.set_parameter("one_too_many", b"x").unwrap_err();
    match &err {
        ProcStateError::CapacityExhausted { resource, .. } => {
            assert_eq!(*resource, Resource::ParameterSlot)
        }
        other => panic!("unexpected error {:?}", other),
    }
    assert!(!err.is_fatal());

    // existing keys can still be overwritten
    me.set_parameter("p0", b"y").unwrap();
    assert_eq!(me.get_parameter("p0").unwrap(), Some(b"y".to_vec()));

    let usage = reg.usage().unwrap();
    assert_eq!(usage.used_param, 32);
    assert_eq!(usage.free_param(), 0);
    assert!(usage.is_plausible());
}

#[test]
fn unregister_returns_blocks_to_pool() {
    init_logging();
    let reg = small_registry(&unique_app("reg_unreg"));
    let me = reg.register_self("fdp", 1, 0).unwrap();
    me.set_parameter("a", b"1").unwrap();
    me.set_parameter("b", b"2").unwrap();
    me.unregister().unwrap();

    let usage = reg.usage().unwrap();
    assert_eq!(usage.used_psd, 0);
    assert_eq!(usage.used_param, 0);
    assert_eq!(usage.pool_param, 0);
    assert!(reg.list_processes().unwrap().is_empty());
}

#[test]
fn process_info_snapshot() {
    init_logging();
    let reg = ProcessRegistry::builder()
        .application_name(unique_app("reg_info"))
        .segment_id("itest")
        .shm_size(64 * 1024)
        .max_psd_blocks(8)
        .psd_timeout(Some(Duration::from_secs(120)))
        .build()
        .unwrap();
    let me = reg.register_self("fdp", 4242, 9).unwrap();
    me.set_parameter("a", b"1").unwrap();

    let info = reg.process_info("fdp").unwrap().unwrap();
    assert_eq!(info.name, "fdp");
    assert_eq!(info.pid, 4242);
    assert_eq!(info.flags, 9);
    assert_eq!(info.parameter_count, 1);
    assert!(!info.timed_out);
    assert!(!reg.is_timed_out(&info));
    assert!(info.heartbeat_age() < Duration::from_secs(5));

    assert!(reg.process_info("nobody").unwrap().is_none());
    assert_eq!(reg.process_infos().unwrap().len(), 1);
}

#[test]
fn read_only_registry_refuses_writes() {
    init_logging();
    let app = unique_app("reg_ro");
    let writer = small_registry(&app);
    let me = writer.register_self("fdp", 1, 0).unwrap();
    me.set_parameter("mode", b"on").unwrap();

    let reader = ProcessRegistry::builder()
        .application_name(&app)
        .segment_id("itest")
        .shm_size(64 * 1024)
        .max_psd_blocks(8)
        .read_only(true)
        .build()
        .unwrap();
    assert!(reader.is_read_only());
    assert!(matches!(
        reader.register_self("other", 2, 0),
        Err(ProcStateError::ReadOnly(_))
    ));

    let fdp = reader.handle_for("fdp").unwrap();
    assert_eq!(fdp.get_parameter("mode").unwrap(), Some(b"on".to_vec()));
    assert!(matches!(
        fdp.set_parameter("mode", b"off"),
        Err(ProcStateError::ReadOnly(_))
    ));
    assert!(matches!(fdp.touch(), Err(ProcStateError::ReadOnly(_))));
}

#[test]
fn typed_values() {
    init_logging();
    let reg = small_registry(&unique_app("reg_typed"));
    let me = reg.register_self("fdp", 1, 0).unwrap();

    me.set("altitude", &35_000u32).unwrap();
    me.set("callsign", "DLH4AB").unwrap();
    assert_eq!(me.get::<u32>("altitude").unwrap(), Some(35_000));
    assert_eq!(me.get::<String>("callsign").unwrap().as_deref(), Some("DLH4AB"));
    assert_eq!(me.get_and_set("altitude", &36_000u32).unwrap(), Some(35_000));
    assert_eq!(me.get::<u32>("missing").unwrap(), None);

    let err = me.set("huge", &"x".repeat(MAX_PARAM_LENGTH)).unwrap_err();
    assert!(matches!(err, ProcStateError::ValueTooLarge { .. }));
}

#[test]
fn usage_summary_text() {
    init_logging();
    let reg = small_registry(&unique_app("reg_summary"));
    let me = reg.register_self("fdp", 1, 0).unwrap();
    me.set_parameter("a", b"1").unwrap();

    let short = reg.usage_summary(true).unwrap();
    assert!(short.contains("Total SHM size: 64 kb"));
    assert!(short.contains("Process count: 1/8"));
    assert!(short.contains("Parameter count: 1/32"));
    assert!(!short.contains("fdp"));

    let full = reg.usage_summary(false).unwrap();
    assert!(full.contains("fdp: params:   1"));
}

#[test]
fn names_over_limit_are_rejected() {
    init_logging();
    let reg = small_registry(&unique_app("reg_names"));
    let long_proc = "p".repeat(51);
    assert!(matches!(
        reg.register_self(&long_proc, 1, 0),
        Err(ProcStateError::InvalidInput(_))
    ));

    let me = reg.register_self(&"p".repeat(50), 1, 0).unwrap();
    assert!(matches!(
        me.set_parameter(&"k".repeat(101), b"v"),
        Err(ProcStateError::InvalidInput(_))
    ));
    me.set_parameter(&"k".repeat(100), b"v").unwrap();
}

#[test]
fn detach_without_cleanup_keeps_entries() {
    init_logging();
    let app = unique_app("reg_keep");
    let observer = small_registry(&app);

    let crashing = small_registry(&app);
    let me = crashing.register_self("ghost", 5, 0).unwrap();
    me.set_parameter("mode", b"scan").unwrap();

    // a live handle blocks the detach
    let other = crashing.clone();
    assert!(matches!(
        other.detach_without_cleanup(),
        Err(ProcStateError::InvalidInput(_))
    ));
    drop(me);
    crashing.detach_without_cleanup().unwrap();

    assert_eq!(observer.list_processes().unwrap(), vec!["ghost"]);
    let ghost = observer.handle_for("ghost").unwrap();
    assert_eq!(ghost.get_parameter("mode").unwrap(), Some(b"scan".to_vec()));
}

#[test]
fn last_detach_without_cleanup_leaves_stale_segment() {
    init_logging();
    let app = unique_app("reg_stale");
    let reg = small_registry(&app);
    reg.register_self("ghost", 5, 0).unwrap();
    reg.detach_without_cleanup().unwrap();

    // nobody attached: the next opener heals it into a fresh registry
    let fresh = small_registry(&app);
    assert!(fresh.list_processes().unwrap().is_empty());
}
