//! Reference-counted stream lifetime across subscribers: a shared
//! buffer is freed exactly once, by whichever consumer finishes last.

use std::any::TypeId;
use std::sync::{Arc, Weak};

use evstream::schedule::{TaskHandle, TaskPool};
use evstream::stream::EventStream;
use evstream::system::{ShareError, StreamShare};

fn tracked_stream() -> (Vec<Arc<EventStream>>, Weak<EventStream>) {
    let stream = Arc::new(EventStream::new(2));
    let weak = Arc::downgrade(&stream);
    (vec![stream], weak)
}

fn key() -> TypeId {
    TypeId::of::<u64>()
}

#[test]
fn freed_only_after_every_subscriber_releases() {
    let pool = TaskPool::new(2);
    let mut share = StreamShare::new();
    let owner = share.subscribe();
    let subscribers: Vec<_> = (0..4).map(|_| share.subscribe()).collect();
    let (streams, weak) = tracked_stream();

    share
        .distribute(owner, key(), streams.clone(), &TaskHandle::ready(), &pool)
        .unwrap();
    assert_eq!(share.owed_count(), 1);

    // Every strict subset of releases must leave the stream alive.
    let (last, rest) = subscribers.split_last().unwrap();
    for subscriber in rest {
        let handle = share
            .release(*subscriber, &streams, &TaskHandle::ready(), &pool)
            .unwrap();
        handle.wait();
        assert!(
            weak.upgrade().is_some(),
            "stream freed while a subscriber still owed a read"
        );
    }

    let handle = share
        .release(*last, &streams, &TaskHandle::ready(), &pool)
        .unwrap();
    assert_eq!(share.owed_count(), 0);
    drop(streams);
    handle.wait();
    assert!(weak.upgrade().is_none(), "last release must free the stream");
}

#[test]
fn release_order_does_not_matter() {
    let pool = TaskPool::new(2);
    let mut share = StreamShare::new();
    let owner = share.subscribe();
    let a = share.subscribe();
    let b = share.subscribe();
    let c = share.subscribe();
    let (streams, weak) = tracked_stream();

    share
        .distribute(owner, key(), streams.clone(), &TaskHandle::ready(), &pool)
        .unwrap();

    // Reverse of subscription order.
    for subscriber in [c, a, b] {
        assert!(weak.upgrade().is_some());
        share
            .release(subscriber, &streams, &TaskHandle::ready(), &pool)
            .unwrap();
    }
    drop(streams);
    // Disposal may still be in flight on the pool.
    drop(pool);
    assert!(weak.upgrade().is_none());
}

#[test]
fn disposal_waits_for_every_release_gate() {
    let pool = TaskPool::new(4);
    let mut share = StreamShare::new();
    let owner = share.subscribe();
    let a = share.subscribe();
    let b = share.subscribe();
    let (streams, weak) = tracked_stream();

    share
        .distribute(owner, key(), streams.clone(), &TaskHandle::ready(), &pool)
        .unwrap();

    // Subscriber `a` releases early, but its reader task is slow.
    let slow = pool.spawn(&[], || {
        std::thread::sleep(std::time::Duration::from_millis(50));
    });
    share.release(a, &streams, &slow, &pool).unwrap();

    let handle = share
        .release(b, &streams, &TaskHandle::ready(), &pool)
        .unwrap();
    drop(streams);
    handle.wait();
    // The last release's own gate was ready, but disposal must still
    // have waited for the slow gate surrendered earlier.
    assert!(slow.is_complete());
    assert!(weak.upgrade().is_none());
}

#[test]
fn double_release_is_detected() {
    let pool = TaskPool::new(1);
    let mut share = StreamShare::new();
    let owner = share.subscribe();
    let a = share.subscribe();
    let _b = share.subscribe();
    let (streams, _weak) = tracked_stream();

    share
        .distribute(owner, key(), streams.clone(), &TaskHandle::ready(), &pool)
        .unwrap();
    share
        .release(a, &streams, &TaskHandle::ready(), &pool)
        .unwrap();
    assert_eq!(
        share
            .release(a, &streams, &TaskHandle::ready(), &pool)
            .err(),
        Some(ShareError::NotOwed(a))
    );
}

#[test]
fn unsubscribe_requires_settled_debts() {
    let pool = TaskPool::new(1);
    let mut share = StreamShare::new();
    let owner = share.subscribe();
    let reader = share.subscribe();
    let (streams, _weak) = tracked_stream();

    share
        .distribute(owner, key(), streams.clone(), &TaskHandle::ready(), &pool)
        .unwrap();
    assert_eq!(
        share.unsubscribe(reader).err(),
        Some(ShareError::OutstandingReads(reader))
    );

    share
        .release(reader, &streams, &TaskHandle::ready(), &pool)
        .unwrap();
    share.unsubscribe(reader).unwrap();
    share.unsubscribe(owner).unwrap();
}

#[test]
fn multiple_streams_tracked_independently() {
    let pool = TaskPool::new(2);
    let mut share = StreamShare::new();
    let owner = share.subscribe();
    let other = share.subscribe();

    let (first, weak_first) = tracked_stream();
    let (second, weak_second) = tracked_stream();
    let both: Vec<Arc<EventStream>> = first.iter().chain(second.iter()).cloned().collect();

    share
        .distribute(owner, key(), both.clone(), &TaskHandle::ready(), &pool)
        .unwrap();
    assert_eq!(share.owed_count(), 2);

    // Release just the first stream.
    let handle = share
        .release(other, &first, &TaskHandle::ready(), &pool)
        .unwrap();
    drop((first, both));
    handle.wait();
    assert_eq!(share.owed_count(), 1);
    assert!(weak_first.upgrade().is_none());
    assert!(weak_second.upgrade().is_some());

    let handle = share
        .release(other, &second, &TaskHandle::ready(), &pool)
        .unwrap();
    drop(second);
    handle.wait();
    assert_eq!(share.owed_count(), 0);
    assert!(weak_second.upgrade().is_none());
}
