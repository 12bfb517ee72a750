/// Integration tests for snowflake id generation on the real clock
use std::collections::HashSet;
use std::sync::Arc;

use aegis_gateway::clock::ManualClock;
use aegis_gateway::snowflake::{SnowflakeId, SnowflakeIdGenerator, CUSTOM_EPOCH_MILLIS};
use aegis_gateway::GatewayError;

#[test]
fn test_tight_loop_is_strictly_increasing() {
    let generator = SnowflakeIdGenerator::new(3, 1).unwrap();
    let mut previous = 0;
    for _ in 0..5_000 {
        let id = generator.next_id().unwrap();
        assert!(id > previous, "{} not greater than {}", id, previous);
        previous = id;
    }

    let parts = SnowflakeId::decompose(previous);
    assert_eq!(parts.worker_id, 3);
    assert_eq!(parts.datacenter_id, 1);
    assert!(parts.timestamp_millis > CUSTOM_EPOCH_MILLIS);
}

#[test]
fn test_shared_generator_across_threads_yields_unique_ids() {
    let generator = Arc::new(SnowflakeIdGenerator::new(0, 0).unwrap());
    let handles: Vec<_> = (0..4)
        .map(|_| {
            let generator = generator.clone();
            std::thread::spawn(move || {
                (0..2_000)
                    .map(|_| generator.next_id().unwrap())
                    .collect::<Vec<u64>>()
            })
        })
        .collect();

    let mut seen = HashSet::new();
    for handle in handles {
        for id in handle.join().unwrap() {
            assert!(seen.insert(id), "duplicate id {}", id);
        }
    }
    assert_eq!(seen.len(), 8_000);
}

#[test]
fn test_clock_rewind_is_fatal_until_time_catches_up() {
    let clock = Arc::new(ManualClock::new(CUSTOM_EPOCH_MILLIS + 50_000));
    let generator = SnowflakeIdGenerator::with_clock(1, 1, clock.clone()).unwrap();

    let before = generator.next_id().unwrap();
    clock.set(CUSTOM_EPOCH_MILLIS + 49_990);
    match generator.next_id() {
        Err(GatewayError::ClockMovedBackwards { last_millis, now_millis }) => {
            assert_eq!(last_millis, CUSTOM_EPOCH_MILLIS + 50_000);
            assert_eq!(now_millis, CUSTOM_EPOCH_MILLIS + 49_990);
        }
        other => panic!("expected clock regression, got {:?}", other),
    }

    clock.set(CUSTOM_EPOCH_MILLIS + 50_001);
    assert!(generator.next_id().unwrap() > before);
}

#[test]
fn test_out_of_range_ids_rejected() {
    assert!(matches!(
        SnowflakeIdGenerator::new(32, 0),
        Err(GatewayError::InvalidGeneratorId { field: "worker_id", value: 32 })
    ));
    assert!(matches!(
        SnowflakeIdGenerator::new(0, 32),
        Err(GatewayError::InvalidGeneratorId { field: "datacenter_id", .. })
    ));
    assert!(SnowflakeIdGenerator::new(31, 31).is_ok());
}
