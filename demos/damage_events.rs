//! Basic usage: parallel producers, one consumer, one frame cycle.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use evstream::prelude::*;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
struct Damage {
    target: u64,
    amount: u32,
    kind: u32,
}

fn main() {
    tracing_subscriber::fmt().with_max_level(tracing::Level::DEBUG).init();

    let pool = TaskPool::new(4);
    let mut share = StreamShare::new();
    let mut system = EventSystem::new(&mut share);

    // 1. Producers: one writer per lane, running in parallel on the pool.
    let writers = system.create_writers::<Damage>(4).unwrap();
    let handles: Vec<TaskHandle> = writers
        .into_iter()
        .map(|mut writer| {
            let lane = writer.lane();
            pool.spawn(&[], move || {
                for i in 0..1000 {
                    writer.write(&Damage {
                        target: i,
                        amount: (lane + 1) * 10,
                        kind: lane,
                    });
                }
            })
        })
        .collect();
    system
        .add_producer_handle::<Damage>(TaskHandle::combine(&handles))
        .unwrap();

    // 2. Consumer: scheduled behind the producers' handle, reads every
    //    lane of every stream.
    let total = Arc::new(AtomicU64::new(0));
    let sink = Arc::clone(&total);
    let done = system
        .schedule_consumer::<Damage, _>(&pool, &TaskHandle::ready(), move |_, mut reader| {
            for lane in 0..reader.lane_count() {
                let count = reader.begin_lane(lane);
                for _ in 0..count {
                    let event: Damage = reader.read();
                    sink.fetch_add(event.amount as u64, Ordering::Relaxed);
                }
                reader.end_lane();
            }
        })
        .unwrap();
    done.wait();
    println!("total damage this frame: {}", total.load(Ordering::Relaxed));

    // 3. Frame boundary: recycle containers, let the broker dispose the
    //    frame's streams once every handle is in.
    let frame = system.update(&mut share, &pool).unwrap();
    frame.wait();

    system.shutdown(&mut share, &pool).unwrap().wait();
}
