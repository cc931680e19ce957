//! Tests for the slot allocator: location selection, CPU pool admission,
//! NUMA affinity, and guard-based release.

mod test_harness;

use std::time::Duration;

use slotd::error::SlotError;
use slotd::slots::SlotType;
use test_harness::{assert_eventually, cpu_request, disk_request, orchid_u64, TestManagerBuilder};

#[tokio::test]
async fn test_happy_acquire_and_release() {
    let harness = TestManagerBuilder::new()
        .slot_count(2)
        .location_with_quota("ssd", 100)
        .build()
        .await;
    let manager = harness.manager.clone();

    let slot = manager
        .acquire_slot(disk_request(10, None), cpu_request(2.0, false))
        .unwrap();
    assert_eq!(slot.slot_type(), SlotType::Common);
    assert!(slot.slot_index() < 2);
    assert_eq!(manager.get_used_slot_count(), 1);

    drop(slot);

    let manager_clone = manager.clone();
    assert_eventually(
        move || {
            let manager = manager_clone.clone();
            async move { manager.get_used_slot_count() == 0 }
        },
        Duration::from_secs(2),
        "slot was not released",
    )
    .await;
}

#[tokio::test]
async fn test_release_restores_counters() {
    let harness = TestManagerBuilder::new()
        .slot_count(2)
        .cpu_limit(8.0)
        .idle_cpu_fraction(0.5)
        .numa_node(0, 8.0, "0-7")
        .build()
        .await;
    let manager = harness.manager.clone();
    manager.update_dynamic_config(slotd::config::DynamicConfig {
        enable_numa_node_scheduling: true,
        ..Default::default()
    });

    let before = manager.build_orchid();

    let slot = manager
        .acquire_slot(disk_request(0, None), cpu_request(3.0, true))
        .unwrap();
    assert_eq!(slot.slot_type(), SlotType::Idle);
    assert!(slot.numa_affinity().is_some());
    drop(slot);

    let manager_clone = manager.clone();
    let expected = before.clone();
    assert_eventually(
        move || {
            let manager = manager_clone.clone();
            let expected = expected.clone();
            async move { manager.build_orchid() == expected }
        },
        Duration::from_secs(2),
        "counters were not restored after release",
    )
    .await;
}

#[tokio::test]
async fn test_medium_filter() {
    let harness = TestManagerBuilder::new()
        .slot_count(4)
        .location("ssd")
        .location("hdd")
        .default_medium("ssd")
        .build()
        .await;
    let manager = &harness.manager;

    // ssd resolved to index 1, hdd to index 2 by the harness directory.
    let slot = manager
        .acquire_slot(disk_request(1, Some(2)), cpu_request(1.0, false))
        .unwrap();
    assert_eq!(slot.location().medium_name(), "hdd");

    let slot = manager
        .acquire_slot(disk_request(1, None), cpu_request(1.0, false))
        .unwrap();
    assert_eq!(slot.location().medium_name(), "ssd");
}

#[tokio::test]
async fn test_unknown_medium_is_skipped() {
    let harness = TestManagerBuilder::new().location("ssd").build().await;

    let err = harness
        .manager
        .acquire_slot(disk_request(1, Some(99)), cpu_request(1.0, false))
        .unwrap_err();
    assert!(matches!(
        err,
        SlotError::SlotNotFound {
            alive_location_count: 1,
            skipped_by_medium: 1,
            ..
        }
    ));
}

/// Disk feasibility counts live session reservations into usage: with a
/// 10-byte quota and 5 bytes reserved, a 6-byte request is rejected and a
/// 5-byte request fits exactly.
#[tokio::test]
async fn test_disk_space_exhaustion() {
    let harness = TestManagerBuilder::new()
        .slot_count(4)
        .location_with_quota("ssd", 10)
        .build()
        .await;
    let manager = &harness.manager;

    let _held = manager
        .acquire_slot(disk_request(5, None), cpu_request(1.0, false))
        .unwrap();

    let err = manager
        .acquire_slot(disk_request(6, None), cpu_request(1.0, false))
        .unwrap_err();
    assert!(matches!(
        err,
        SlotError::SlotNotFound {
            skipped_by_disk_space: 1,
            feasible_location_count: 0,
            ..
        }
    ));

    let slot = manager
        .acquire_slot(disk_request(5, None), cpu_request(1.0, false))
        .unwrap();
    assert_eq!(slot.slot_type(), SlotType::Common);
}

#[tokio::test]
async fn test_least_loaded_location_wins() {
    let harness = TestManagerBuilder::new()
        .slot_count(4)
        .location("ssd")
        .location("ssd")
        .build()
        .await;
    let manager = &harness.manager;

    let first = manager
        .acquire_slot(disk_request(0, None), cpu_request(1.0, false))
        .unwrap();
    let second = manager
        .acquire_slot(disk_request(0, None), cpu_request(1.0, false))
        .unwrap();

    // The second acquire must land on the other, less loaded location.
    assert_ne!(first.location().id(), second.location().id());
}

#[tokio::test]
async fn test_idle_pool_cap() {
    let harness = TestManagerBuilder::new()
        .slot_count(4)
        .cpu_limit(8.0)
        .idle_cpu_fraction(0.5) // idle pool ceiling: 4 CPUs
        .build()
        .await;
    let manager = harness.manager.clone();

    let first = manager
        .acquire_slot(disk_request(0, None), cpu_request(3.0, true))
        .unwrap();
    assert_eq!(first.slot_type(), SlotType::Idle);

    let second = manager
        .acquire_slot(disk_request(0, None), cpu_request(3.0, true))
        .unwrap();
    assert_eq!(second.slot_type(), SlotType::Common);

    drop(first);
    let manager_clone = manager.clone();
    assert_eventually(
        move || {
            let manager = manager_clone.clone();
            async move { orchid_u64(&manager, "used_idle_slot_count") == 0 }
        },
        Duration::from_secs(2),
        "idle budget was not returned",
    )
    .await;

    let third = manager
        .acquire_slot(disk_request(0, None), cpu_request(3.0, true))
        .unwrap();
    assert_eq!(third.slot_type(), SlotType::Idle);
}

#[tokio::test]
async fn test_zero_idle_fraction_lands_in_common() {
    let harness = TestManagerBuilder::new()
        .cpu_limit(8.0)
        .idle_cpu_fraction(0.0)
        .build()
        .await;

    let slot = harness
        .manager
        .acquire_slot(disk_request(0, None), cpu_request(2.0, true))
        .unwrap();
    assert_eq!(slot.slot_type(), SlotType::Common);
}

#[tokio::test]
async fn test_numa_affinity_spreads_over_nodes() {
    let harness = TestManagerBuilder::new()
        .slot_count(4)
        .numa_node(0, 8.0, "0-7")
        .numa_node(1, 8.0, "8-15")
        .build()
        .await;
    let manager = &harness.manager;
    manager.update_dynamic_config(slotd::config::DynamicConfig {
        enable_numa_node_scheduling: true,
        ..Default::default()
    });

    let first = manager
        .acquire_slot(disk_request(0, None), cpu_request(3.0, false))
        .unwrap();
    let second = manager
        .acquire_slot(disk_request(0, None), cpu_request(3.0, false))
        .unwrap();

    let first_node = first.numa_affinity().unwrap().numa_node_id;
    let second_node = second.numa_affinity().unwrap().numa_node_id;
    assert_ne!(first_node, second_node);

    // Both ledger entries now hold 5 free CPUs.
    let orchid = manager.build_orchid();
    for node in ["node_0", "node_1"] {
        assert_eq!(
            orchid["numa_node_states"][node]["free_cpu_count"].as_f64(),
            Some(5.0)
        );
    }
}

#[tokio::test]
async fn test_no_affinity_when_numa_scheduling_disabled() {
    let harness = TestManagerBuilder::new()
        .numa_node(0, 8.0, "0-7")
        .build()
        .await;

    let slot = harness
        .manager
        .acquire_slot(disk_request(0, None), cpu_request(2.0, false))
        .unwrap();
    assert!(slot.numa_affinity().is_none());
}

#[tokio::test]
async fn test_empty_numa_ledger_still_acquires() {
    let harness = TestManagerBuilder::new().build().await;
    harness.manager.update_dynamic_config(slotd::config::DynamicConfig {
        enable_numa_node_scheduling: true,
        ..Default::default()
    });

    let slot = harness
        .manager
        .acquire_slot(disk_request(0, None), cpu_request(2.0, false))
        .unwrap();
    assert!(slot.numa_affinity().is_none());
}

#[tokio::test]
async fn test_oversized_cpu_request_gets_no_affinity() {
    let harness = TestManagerBuilder::new().numa_node(0, 4.0, "0-3").build().await;
    let manager = &harness.manager;
    manager.update_dynamic_config(slotd::config::DynamicConfig {
        enable_numa_node_scheduling: true,
        ..Default::default()
    });

    let slot = manager
        .acquire_slot(disk_request(0, None), cpu_request(6.0, false))
        .unwrap();
    assert!(slot.numa_affinity().is_none());

    // The ledger must be untouched.
    let orchid = manager.build_orchid();
    assert_eq!(
        orchid["numa_node_states"]["node_0"]["free_cpu_count"].as_f64(),
        Some(4.0)
    );
}

#[tokio::test]
async fn test_zero_slot_count() {
    let harness = TestManagerBuilder::new().slot_count(0).build().await;
    let manager = &harness.manager;

    assert!(!manager.is_enabled());
    let err = manager
        .acquire_slot(disk_request(0, None), cpu_request(1.0, false))
        .unwrap_err();
    assert!(matches!(err, SlotError::SlotNotFound { .. }));
}

#[tokio::test]
async fn test_no_alive_locations() {
    let harness = TestManagerBuilder::new().location("ssd").build().await;
    let manager = &harness.manager;

    for location in manager.get_locations() {
        location.disable(SlotError::Io("disk fault".to_string()));
    }

    let err = manager
        .acquire_slot(disk_request(0, None), cpu_request(1.0, false))
        .unwrap_err();
    assert!(matches!(
        err,
        SlotError::SlotNotFound {
            alive_location_count: 0,
            ..
        }
    ));
    assert!(!manager.is_enabled());
}

#[tokio::test]
async fn test_acquire_requires_bound_default_medium() {
    let harness = TestManagerBuilder::new().without_init_media().build().await;

    let err = harness
        .manager
        .acquire_slot(disk_request(0, None), cpu_request(1.0, false))
        .unwrap_err();
    assert!(matches!(
        err,
        SlotError::SlotNotFound {
            skipped_by_medium: 1,
            ..
        }
    ));
}

/// Failed acquires must not leak free slots or idle budget.
#[tokio::test]
async fn test_failed_acquire_mutates_nothing() {
    let harness = TestManagerBuilder::new()
        .slot_count(2)
        .location_with_quota("ssd", 10)
        .idle_cpu_fraction(0.5)
        .build()
        .await;
    let manager = &harness.manager;

    let before = manager.build_orchid();
    let result = manager.acquire_slot(disk_request(100, None), cpu_request(1.0, true));
    assert!(result.is_err());
    assert_eq!(manager.build_orchid(), before);
}

#[tokio::test]
async fn test_slot_indices_are_exclusive() {
    let harness = TestManagerBuilder::new().slot_count(4).build().await;
    let manager = &harness.manager;

    let slots: Vec<_> = (0..4)
        .map(|_| {
            manager
                .acquire_slot(disk_request(0, None), cpu_request(1.0, false))
                .unwrap()
        })
        .collect();

    let mut indices: Vec<usize> = slots.iter().map(|slot| slot.slot_index()).collect();
    indices.sort_unstable();
    indices.dedup();
    assert_eq!(indices.len(), 4);
    assert_eq!(manager.get_used_slot_count(), 4);

    // All slots taken: the next acquire fails without touching state.
    let err = manager
        .acquire_slot(disk_request(0, None), cpu_request(1.0, false))
        .unwrap_err();
    assert!(matches!(err, SlotError::SlotNotFound { .. }));
}

#[tokio::test]
async fn test_interleaved_acquire_release_balances() {
    let harness = TestManagerBuilder::new().slot_count(3).build().await;
    let manager = harness.manager.clone();

    for _ in 0..5 {
        let a = manager
            .acquire_slot(disk_request(0, None), cpu_request(1.0, false))
            .unwrap();
        let b = manager
            .acquire_slot(disk_request(0, None), cpu_request(1.0, false))
            .unwrap();
        drop(a);

        // Releases are asynchronous; wait for the pool to reflect the drop.
        let manager_clone = manager.clone();
        assert_eventually(
            move || {
                let manager = manager_clone.clone();
                async move { manager.get_used_slot_count() == 1 }
            },
            Duration::from_secs(2),
            "release of first slot not observed",
        )
        .await;

        let c = manager
            .acquire_slot(disk_request(0, None), cpu_request(1.0, false))
            .unwrap();
        drop(c);
        drop(b);

        let manager_clone = manager.clone();
        assert_eventually(
            move || {
                let manager = manager_clone.clone();
                async move {
                    manager.get_used_slot_count() == 0
                        && orchid_u64(&manager, "free_slot_count") == 3
                }
            },
            Duration::from_secs(2),
            "free slot pool did not return to full",
        )
        .await;
    }
}
