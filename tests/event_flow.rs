//! End-to-end frame cycles: parallel producers in one system, consumers
//! in sibling systems, broker-managed stream lifetime in between.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use evstream::prelude::*;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

#[derive(Debug, Clone, Copy, PartialEq, Eq, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
struct Damage {
    target: u64,
    amount: u32,
    source: u32,
}

fn drain_all(reader: &mut StreamReader) -> u64 {
    let mut total = 0;
    for lane in 0..reader.lane_count() {
        let count = reader.begin_lane(lane);
        for _ in 0..count {
            let event: Damage = reader.read();
            total += event.amount as u64;
        }
        reader.end_lane();
    }
    total
}

fn produce_parallel(
    system: &mut EventSystem,
    pool: &TaskPool,
    lanes: u32,
    events_per_lane: u32,
) -> u64 {
    let writers = system.create_writers::<Damage>(lanes).unwrap();
    let mut handles = Vec::new();
    let mut expected = 0u64;
    for (lane, mut writer) in writers.into_iter().enumerate() {
        for i in 0..events_per_lane {
            expected += (lane as u64) * 100 + i as u64;
        }
        handles.push(pool.spawn(&[], move || {
            for i in 0..events_per_lane {
                writer.write(&Damage {
                    target: i as u64,
                    amount: (lane as u32) * 100 + i,
                    source: lane as u32,
                });
            }
        }));
    }
    system
        .add_producer_handle::<Damage>(TaskHandle::combine(&handles))
        .unwrap();
    expected
}

#[test]
fn producer_and_consumer_in_one_system() {
    let pool = TaskPool::new(4);
    let mut share = StreamShare::new();
    let mut system = EventSystem::new(&mut share);

    let expected = produce_parallel(&mut system, &pool, 4, 1000);

    let seen = Arc::new(AtomicU64::new(0));
    let sink = Arc::clone(&seen);
    let handle = system
        .schedule_consumer::<Damage, _>(&pool, &TaskHandle::ready(), move |_, mut reader| {
            sink.fetch_add(drain_all(&mut reader), Ordering::SeqCst);
        })
        .unwrap();
    handle.wait();
    assert_eq!(seen.load(Ordering::SeqCst), expected);

    system.update(&mut share, &pool).unwrap().wait();
    assert_eq!(share.owed_count(), 0);
}

#[test]
fn events_reach_sibling_system_next_cycle() {
    let pool = TaskPool::new(4);
    let mut share = StreamShare::new();
    let mut producer = EventSystem::new(&mut share);
    let mut consumer = EventSystem::new(&mut share);

    // Frame 0: producer writes, nobody in this system reads.
    let expected = produce_parallel(&mut producer, &pool, 2, 500);
    producer.update(&mut share, &pool).unwrap().wait();
    consumer.update(&mut share, &pool).unwrap().wait();

    // Frame 1: the sibling sees the shared streams.
    assert!(consumer.has_readers::<Damage>().unwrap());
    let seen = Arc::new(AtomicU64::new(0));
    let sink = Arc::clone(&seen);
    let handle = consumer
        .schedule_consumer::<Damage, _>(&pool, &TaskHandle::ready(), move |_, mut reader| {
            sink.fetch_add(drain_all(&mut reader), Ordering::SeqCst);
        })
        .unwrap();
    handle.wait();
    assert_eq!(seen.load(Ordering::SeqCst), expected);

    // Frame boundary settles the debt and frees the stream.
    producer.update(&mut share, &pool).unwrap().wait();
    consumer.update(&mut share, &pool).unwrap().wait();
    assert_eq!(share.owed_count(), 0);
}

#[test]
fn shared_stream_is_freed_after_all_systems_pass() {
    let pool = TaskPool::new(2);
    let mut share = StreamShare::new();
    let mut producer = EventSystem::new(&mut share);
    let mut consumer_a = EventSystem::new(&mut share);
    let mut consumer_b = EventSystem::new(&mut share);

    produce_parallel(&mut producer, &pool, 1, 10);
    producer.update(&mut share, &pool).unwrap().wait();
    assert_eq!(share.owed_count(), 1);

    // Deliver to both consumers.
    consumer_a.update(&mut share, &pool).unwrap().wait();
    consumer_b.update(&mut share, &pool).unwrap().wait();

    // Watch the stream through a weak handle taken from a reader.
    let (gate, readers) = consumer_a.get_readers::<Damage>(&TaskHandle::ready()).unwrap();
    gate.wait();
    assert_eq!(readers.len(), 1);
    consumer_a
        .add_consumer_handle::<Damage>(TaskHandle::ready())
        .unwrap();
    drop(readers);

    // Only consumer_a passes a frame boundary: debt remains.
    consumer_a.update(&mut share, &pool).unwrap().wait();
    assert_eq!(share.owed_count(), 1);

    // consumer_b's boundary settles the last debt.
    consumer_b.update(&mut share, &pool).unwrap().wait();
    assert_eq!(share.owed_count(), 0);
}

#[test]
fn reader_order_is_deterministic_across_runs() {
    let order_of_run = || -> Vec<u32> {
        let pool = TaskPool::new(4);
        let mut share = StreamShare::new();
        let mut system = EventSystem::new(&mut share);

        // Three streams with distinct lane counts, created in a fixed
        // order while the pool is busy with unrelated jitter.
        for lanes in [3u32, 1, 5] {
            let _jitter = pool.spawn(&[], || {
                std::thread::sleep(std::time::Duration::from_micros(100));
            });
            let writers = system.create_writers::<Damage>(lanes).unwrap();
            let handles: Vec<TaskHandle> = writers
                .into_iter()
                .map(|mut writer| {
                    pool.spawn(&[], move || {
                        writer.write(&Damage {
                            target: 0,
                            amount: 1,
                            source: 0,
                        });
                    })
                })
                .collect();
            system
                .add_producer_handle::<Damage>(TaskHandle::combine(&handles))
                .unwrap();
        }

        let (gate, readers) = system.get_readers::<Damage>(&TaskHandle::ready()).unwrap();
        gate.wait();
        let order = readers.iter().map(|r| r.lane_count()).collect();
        system
            .add_consumer_handle::<Damage>(TaskHandle::ready())
            .unwrap();
        system.update(&mut share, &pool).unwrap().wait();
        order
    };

    let first = order_of_run();
    for _ in 0..5 {
        assert_eq!(order_of_run(), first);
    }
    assert_eq!(first, vec![3, 1, 5]);
}

#[test]
fn shutdown_settles_undelivered_streams() {
    let pool = TaskPool::new(2);
    let mut share = StreamShare::new();
    let mut producer = EventSystem::new(&mut share);
    let consumer = EventSystem::new(&mut share);

    produce_parallel(&mut producer, &pool, 2, 100);
    producer.update(&mut share, &pool).unwrap().wait();
    assert_eq!(share.owed_count(), 1);

    // The consumer never ran a frame: the shared stream is still
    // sitting in its mailbox. Shutdown must settle that debt.
    let done = consumer.shutdown(&mut share, &pool).unwrap();
    done.wait();
    assert_eq!(share.owed_count(), 0);

    let done = producer.shutdown(&mut share, &pool).unwrap();
    done.wait();
    assert_eq!(share.subscriber_count(), 0);
}
