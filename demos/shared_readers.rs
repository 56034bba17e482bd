//! Two subsystems on one share broker: events produced by the physics
//! system are read by the audio system one frame later, and the buffer
//! is freed only after both systems have passed a frame boundary.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use evstream::prelude::*;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, KnownLayout, Immutable)]
#[repr(C)]
struct Collision {
    body_a: u32,
    body_b: u32,
    impulse: f32,
}

fn main() {
    tracing_subscriber::fmt().with_max_level(tracing::Level::TRACE).init();

    let pool = TaskPool::new(4);
    let mut share = StreamShare::new();
    let mut physics = EventSystem::new(&mut share);
    let mut audio = EventSystem::new(&mut share);

    // Frame 0: physics produces collisions; audio has nothing yet.
    let mut writers = physics.create_writers::<Collision>(2).unwrap();
    let handles: Vec<TaskHandle> = writers
        .drain(..)
        .map(|mut writer| {
            pool.spawn(&[], move || {
                for i in 0..16 {
                    writer.write(&Collision {
                        body_a: i,
                        body_b: i + 1,
                        impulse: i as f32 * 0.5,
                    });
                }
            })
        })
        .collect();
    physics
        .add_producer_handle::<Collision>(TaskHandle::combine(&handles))
        .unwrap();

    physics.update(&mut share, &pool).unwrap().wait();
    audio.update(&mut share, &pool).unwrap().wait();

    // Frame 1: the shared stream shows up in the audio system.
    let heard = Arc::new(AtomicU32::new(0));
    let sink = Arc::clone(&heard);
    let done = audio
        .schedule_consumer::<Collision, _>(&pool, &TaskHandle::ready(), move |_, mut reader| {
            for lane in 0..reader.lane_count() {
                let count = reader.begin_lane(lane);
                for _ in 0..count {
                    let _c: Collision = reader.read();
                    sink.fetch_add(1, Ordering::Relaxed);
                }
                reader.end_lane();
            }
        })
        .unwrap();
    done.wait();
    println!("audio heard {} collisions", heard.load(Ordering::Relaxed));

    // Frame boundaries settle the read debt; the broker frees the
    // stream after the last one.
    physics.update(&mut share, &pool).unwrap().wait();
    audio.update(&mut share, &pool).unwrap().wait();
    println!("streams still tracked: {}", share.owed_count());

    audio.shutdown(&mut share, &pool).unwrap().wait();
    physics.shutdown(&mut share, &pool).unwrap().wait();
}
