use super::*;
use crate::result::SendOutcome;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU32, Ordering};
use std::thread;

fn observe<T: Message, A: Message>(ch: &Channel<A, T>) -> Arc<Mutex<Vec<T>>> {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    ch.receive_all(move |m| sink.lock().push(m)).expect("subscribe");
    seen
}

#[test]
fn seeded_channel_maps_and_accepts_direct_enqueues() {
    // channel(0,1,2) -> map(inc); subscribe; enqueue ch 3; enqueue b 4
    let ch = channel_of([0, 1, 2]);
    let b = ch.map(|v: i64| v + 1);
    let seen = observe(&b);
    ch.enqueue(3);
    b.enqueue(4);
    assert_eq!(*seen.lock(), vec![1, 2, 3, 4, 5]);
}

#[test]
fn filter_over_map_composes() {
    let ch = channel_of([0, 1, 2]);
    let b = ch.map(|v: i64| v + 1).filter(|v| v % 2 == 0);
    let seen = observe(&b);
    ch.enqueue(3);
    ch.enqueue(4);
    assert_eq!(*seen.lock(), vec![2, 4]);
}

#[test]
fn remove_is_filter_complement() {
    let ch = channel_of([1, 2, 3, 4]);
    let odds = ch.remove(|v: &i64| v % 2 == 0);
    let seen = observe(&odds);
    assert_eq!(*seen.lock(), vec![1, 3]);
}

#[test]
fn read_pops_then_cancel_rejects_pending() {
    let ch = channel();
    ch.enqueue("m");
    let first = ch.read();
    assert_eq!(first.try_get(), Some(Ok("m")));

    let second = ch.read();
    assert!(!second.is_realized());
    assert!(ch.cancel_read(&second));
    assert_eq!(second.error_value(), Some(FlowError::Cancelled));
}

#[test]
fn cancelled_read_releases_no_message() {
    let ch = channel();
    let pending = ch.read();
    ch.cancel_read(&pending);
    ch.enqueue(1);
    assert_eq!(ch.read().try_get(), Some(Ok(1)));
}

#[test]
fn read_with_timeout_errors_and_releases_consumer() {
    let ch = channel::<u32>();
    let rc = ch.read_with(ReadOptions::new().timeout(Duration::from_millis(20)));
    assert_eq!(
        rc.wait(Some(Duration::from_secs(2))),
        Err(FlowError::Timeout)
    );
    // the timed-out consumer is gone: the next read gets the message
    ch.enqueue(5);
    assert_eq!(ch.read().try_get(), Some(Ok(5)));
}

#[test]
fn read_with_on_timeout_value_translates() {
    let ch = channel::<u32>();
    let rc = ch.read_with(
        ReadOptions::new()
            .timeout(Duration::from_millis(20))
            .on_timeout(99),
    );
    assert_eq!(rc.wait(Some(Duration::from_secs(2))), Ok(99));
}

#[test]
fn arrival_beats_generous_timeout() {
    let ch = channel::<u32>();
    let rc = ch.read_with(ReadOptions::new().timeout(Duration::from_secs(30)));
    ch.enqueue(7);
    assert_eq!(rc.wait(Some(Duration::from_secs(2))), Ok(7));
}

#[test]
fn read_with_on_drained_translates() {
    let ch = channel::<u32>();
    ch.close();
    let rc = ch.read_with(ReadOptions::new().on_drained(0));
    assert_eq!(rc.try_get(), Some(Ok(0)));
}

#[test]
fn predicated_read_resolves_false_and_keeps_message() {
    let ch = channel_of([3u32]);
    let rc = ch.read_with(ReadOptions::new().predicate(|m| m % 2 == 0, 0));
    assert_eq!(rc.try_get(), Some(Ok(0)));
    assert_eq!(ch.read().try_get(), Some(Ok(3)));
}

#[test]
fn closed_channel_replays_then_drains() {
    let ch = closed_channel([1, 2, 3]);
    assert!(ch.is_closed());
    assert!(!ch.is_drained());
    assert!(matches!(
        ch.enqueue(4),
        SendResult::Done(SendOutcome::Closed)
    ));
    let replayed: Vec<i32> = ch.iter().collect();
    assert_eq!(replayed, vec![1, 2, 3]);
    assert!(ch.is_drained());
}

#[test]
fn fork_sees_messages_but_closing_it_spares_source() {
    let ch = channel();
    let f = ch.fork();
    let seen = observe(&f);
    ch.enqueue(1);
    f.close();
    ch.enqueue(2);
    assert!(!ch.is_closed());
    assert_eq!(*seen.lock(), vec![1]);
}

#[test]
fn closing_source_closes_fork_and_tap() {
    let ch = channel::<u32>();
    let f = ch.fork();
    let t = ch.tap();
    ch.close();
    assert!(f.is_closed());
    assert!(t.is_closed());
}

#[test]
fn closing_tap_spares_source_and_drops_back_pressure() {
    let ch = channel::<u32>();
    let t = ch.tap();
    t.close();
    assert!(!ch.is_closed());
    // with only a closed tap downstream, sends are discarded, not deferred
    let seen = observe(&ch);
    assert!(matches!(
        ch.enqueue(1),
        SendResult::Done(SendOutcome::Consumed)
    ));
    assert_eq!(*seen.lock(), vec![1]);
}

#[test]
fn source_error_reaches_fork() {
    let ch = channel::<u32>();
    let f = ch.fork();
    ch.fail(FlowError::callback("upstream"));
    assert!(matches!(f.state(), NodeState::Error(_)));
}

#[test]
fn siphon_flows_and_closes_downstream() {
    let src = channel_of([1, 2]);
    let dst = channel::<i32>();
    let seen = observe(&dst);
    siphon(&src, &dst).expect("siphon");
    src.enqueue(3);
    assert_eq!(*seen.lock(), vec![1, 2, 3]);

    src.close();
    assert!(dst.is_closed());
}

#[test]
fn siphon_into_permanent_dst_survives_source_close() {
    let src = channel::<i32>();
    let dst = channel_with(&ChannelOptions::default().permanent(true), []);
    siphon(&src, &dst).expect("siphon");
    src.close();
    assert!(!dst.is_closed());
    assert!(dst.close_force());
}

#[test]
fn join_couples_closure_both_ways() {
    let src = channel::<i32>();
    let dst = channel::<i32>();
    join(&src, &dst).expect("join");
    dst.close();
    assert!(src.is_closed(), "closing the join destination closes the source");
}

#[test]
fn bridge_join_backpressures_through_callback() {
    let src = channel::<u32>();
    let dst = channel::<u32>();
    let down = dst.clone();
    bridge_join(&src, &dst, "double", move |m| down.enqueue(m * 2)).expect("bridge");
    let seen = observe(&dst);
    let r = src.enqueue(4);
    assert!(matches!(r, SendResult::Done(SendOutcome::Consumed)));
    assert_eq!(*seen.lock(), vec![8]);

    src.close();
    assert!(dst.is_closed(), "bridge join cascades closure");
}

#[test]
fn receive_all_unsubscribe_stops_delivery() {
    let ch = channel();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    let key = ch.receive_all(move |m: u32| sink.lock().push(m)).expect("subscribe");
    ch.enqueue(1);
    assert!(ch.unsubscribe(key));
    assert!(!ch.unsubscribe(key), "second unsubscribe is a no-op");
    ch.enqueue(2);
    assert_eq!(*seen.lock(), vec![1]);
}

#[test]
fn receive_all_on_closed_channel_is_refused() {
    let ch = channel::<u32>();
    ch.close();
    assert!(matches!(
        ch.receive_all(|_| {}),
        Err(FlowError::AlreadyClosed)
    ));
}

#[test]
fn mimic_copies_description_and_transactionality() {
    let ch = channel_with::<u32>(
        &ChannelOptions::described("ticks").transactional(true),
        [],
    );
    let m = ch.mimic();
    assert_eq!(m.label().as_str(), "ticks");
    assert!(m.emitter_node().is_transactional());
    assert!(!m.is_closed());
}

#[test]
fn splice_pairs_front_receiver_with_back_emitter() {
    let front = channel::<u32>();
    let back = front.map(|v| v * 2);
    let pipe = splice(&front, &back);
    let seen = observe(&pipe);
    pipe.enqueue(3);
    assert_eq!(*seen.lock(), vec![6]);
}

#[test]
fn ground_discards_instead_of_buffering() {
    let ch = channel::<u32>();
    ch.ground().expect("ground");
    assert!(matches!(
        ch.enqueue(1),
        SendResult::Done(SendOutcome::Discarded)
    ));
    assert_eq!(ch.drain_available(), Vec::<u32>::new());
}

#[test]
fn iter_timeout_ends_on_silence() {
    let ch = channel_of([1, 2]);
    let collected: Vec<i32> = ch.iter_timeout(Duration::from_millis(30)).collect();
    assert_eq!(collected, vec![1, 2]);
}

#[test]
fn blocking_iter_sees_concurrent_enqueues_until_close() {
    let ch = channel::<u32>();
    let producer = ch.clone();
    let handle = thread::spawn(move || {
        for i in 0..5 {
            producer.enqueue(i);
            thread::sleep(Duration::from_millis(5));
        }
        producer.close();
    });
    let collected: Vec<u32> = ch.iter().collect();
    handle.join().expect("producer");
    assert_eq!(collected, vec![0, 1, 2, 3, 4]);
}

#[test]
fn on_closed_fires_for_subscribers() {
    let ch = channel::<u32>();
    let hits = Arc::new(AtomicU32::new(0));
    let h = hits.clone();
    ch.on_closed(move || {
        h.fetch_add(1, Ordering::SeqCst);
    });
    ch.close();
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

#[test]
fn enqueue_with_no_subscribers_defers_until_read() {
    let ch = channel::<u32>();
    let r = ch.enqueue(1);
    let ack = match r {
        SendResult::Deferred(rc) => rc,
        other => panic!("expected deferred: {other:?}"),
    };
    assert!(!ack.is_realized());
    assert_eq!(ch.read().try_get(), Some(Ok(1)));
    assert_eq!(ack.try_get(), Some(Ok(SendOutcome::Consumed)));
}
