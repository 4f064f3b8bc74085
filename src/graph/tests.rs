use super::*;
use crate::config::ChannelOptions;
use crate::error::FlowError;
use crate::message::Message;
use crate::queue::{Consumer, Release};
use crate::result::{SendOutcome, SendResult};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::thread;
use std::time::Duration;

fn collector<T: Message>(
    sink: &Arc<Mutex<Vec<T>>>,
) -> Arc<Terminal<T>> {
    let sink = sink.clone();
    Terminal::consuming("collector", move |m| sink.lock().push(m))
}

#[test]
fn messages_buffer_until_first_link_then_flush_in_order() {
    let node = identity_node(&ChannelOptions::default(), [1, 2, 3]);
    assert!(matches!(
        node.ingest(4, Release::none()),
        SendResult::Deferred(_)
    ));

    let seen = Arc::new(Mutex::new(Vec::new()));
    node.link(Edge::standard("sink", collector(&seen))).expect("link");
    assert_eq!(*seen.lock(), vec![1, 2, 3, 4], "backlog flushes in order");

    let r = node.ingest(5, Release::none());
    assert!(matches!(r, SendResult::Done(SendOutcome::Consumed)));
    assert_eq!(*seen.lock(), vec![1, 2, 3, 4, 5]);
}

#[test]
fn operator_transforms_on_ingress() {
    let node: Arc<Node<u32, u32>> = Node::new(
        &ChannelOptions::described("inc"),
        Box::new(|m: u32| Ok(Some(m + 1))),
    );
    let seen = Arc::new(Mutex::new(Vec::new()));
    node.link(Edge::standard("sink", collector(&seen))).expect("link");
    node.ingest(1, Release::none());
    node.ingest(2, Release::none());
    assert_eq!(*seen.lock(), vec![2, 3]);
}

#[test]
fn filtering_operator_discards() {
    let node: Arc<Node<u32, u32>> = Node::new(
        &ChannelOptions::default(),
        Box::new(|m: u32| Ok((m % 2 == 0).then_some(m))),
    );
    let seen = Arc::new(Mutex::new(Vec::new()));
    node.link(Edge::standard("sink", collector(&seen))).expect("link");
    assert!(matches!(
        node.ingest(1, Release::none()),
        SendResult::Done(SendOutcome::Discarded)
    ));
    node.ingest(2, Release::none());
    assert_eq!(*seen.lock(), vec![2]);
}

#[test]
fn failing_operator_poisons_the_node() {
    let node: Arc<Node<u32, u32>> = Node::new(
        &ChannelOptions::default(),
        Box::new(|_| Err(FlowError::callback("bad op"))),
    );
    assert!(node.ingest(1, Release::none()).is_fail());
    assert!(matches!(node.state(), NodeState::Error(_)));
    // errored nodes serve error results to everything that follows
    assert!(node.ingest(2, Release::none()).is_fail());
    let rc = node.receive(Consumer::simple());
    assert_eq!(rc.error_value(), Some(FlowError::callback("bad op")));
}

#[test]
fn waiting_consumer_beats_buffering() {
    let node = identity_node::<u32>(&ChannelOptions::default(), []);
    let rc = node.receive(Consumer::simple());
    assert!(matches!(
        node.ingest(9, Release::none()),
        SendResult::Done(SendOutcome::Consumed)
    ));
    assert_eq!(rc.try_get(), Some(Ok(9)));
}

#[test]
fn split_node_delivers_to_every_non_tap_edge_once() {
    let node = identity_node(&ChannelOptions::default(), []);
    let a = Arc::new(Mutex::new(Vec::new()));
    let b = Arc::new(Mutex::new(Vec::new()));
    node.link(Edge::standard("a", collector(&a))).expect("link a");
    node.link(Edge::standard("b", collector(&b))).expect("link b");
    assert!(matches!(node.state(), NodeState::Split));

    let r = node.ingest(5, Release::none());
    assert!(matches!(r, SendResult::Done(SendOutcome::Split)));
    assert_eq!(*a.lock(), vec![5]);
    assert_eq!(*b.lock(), vec![5]);
}

#[test]
fn tap_edges_carry_no_back_pressure() {
    let node = identity_node(&ChannelOptions::default(), []);
    let tap_seen = Arc::new(Mutex::new(Vec::new()));
    let failing_tap = Terminal::new("failing tap", |_: u32| {
        SendResult::Fail(FlowError::callback("tap exploded"))
    });
    node.link(Edge::tap("bad", failing_tap)).expect("link");
    node.link(Edge::tap("good", collector(&tap_seen))).expect("link");
    let main = Arc::new(Mutex::new(Vec::new()));
    node.link(Edge::standard("main", collector(&main))).expect("link");

    let r = node.ingest(1, Release::none());
    assert!(
        matches!(r, SendResult::Done(SendOutcome::Consumed)),
        "tap failure must not surface: {r:?}"
    );
    assert_eq!(*tap_seen.lock(), vec![1]);
    assert_eq!(*main.lock(), vec![1]);
}

#[test]
fn fifo_per_edge_under_concurrent_producers() {
    let node = identity_node(&ChannelOptions::default(), []);
    let seen = Arc::new(Mutex::new(Vec::new()));
    node.link(Edge::standard("sink", collector(&seen))).expect("link");

    let handles: Vec<_> = (0..4u32)
        .map(|p| {
            let node = node.clone();
            thread::spawn(move || {
                for i in 0..100u32 {
                    node.ingest(p * 1000 + i, Release::none());
                }
            })
        })
        .collect();
    for h in handles {
        h.join().expect("producer");
    }

    let seen = seen.lock();
    assert_eq!(seen.len(), 400);
    // per-producer order is preserved even though producers interleave
    for p in 0..4u32 {
        let mine: Vec<u32> = seen.iter().copied().filter(|v| v / 1000 == p).collect();
        let mut sorted = mine.clone();
        sorted.sort_unstable();
        assert_eq!(mine, sorted, "producer {p} reordered");
    }
}

#[test]
fn consume_streams_through_owner_and_blocks_rivals() {
    let node = identity_node(&ChannelOptions::default(), [1, 2]);
    let seen = Arc::new(Mutex::new(Vec::new()));
    let unconsume = node
        .consume(Edge::standard("owner", collector(&seen)))
        .expect("consume");
    assert!(matches!(node.state(), NodeState::Consumed));
    assert_eq!(*seen.lock(), vec![1, 2], "backlog flushed at consume time");

    node.ingest(3, Release::none());
    assert_eq!(*seen.lock(), vec![1, 2, 3]);

    let rival = node.consume(Edge::standard("rival", Terminal::discarding("rival")));
    assert!(matches!(rival, Err(FlowError::AlreadyConsumed)));
    let link_denied = node.link(Edge::standard("late", Terminal::discarding("late")));
    assert!(matches!(link_denied, Err(FlowError::AlreadyConsumed)));

    unconsume();
    assert!(matches!(node.state(), NodeState::Open));
    node.consume(Edge::standard("again", Terminal::discarding("again")))
        .expect("consumable again after unconsume");
}

#[test]
fn close_is_monotone_and_idempotent() {
    let node = identity_node::<u32>(&ChannelOptions::default(), []);
    assert!(node.close());
    assert!(node.is_closed());
    assert!(node.close(), "second close is a no-op");
    assert!(node.is_closed());
    assert!(matches!(
        node.ingest(1, Release::none()),
        SendResult::Done(SendOutcome::Closed)
    ));
}

#[test]
fn close_cascades_downstream_but_permanent_refuses() {
    let src = identity_node::<u32>(&ChannelOptions::default(), []);
    let plain = identity_node::<u32>(&ChannelOptions::default(), []);
    let durable = identity_node::<u32>(&ChannelOptions::default().permanent(true), []);
    src.link(Edge::standard("plain", plain.clone())).expect("link");
    src.link(Edge::standard("durable", durable.clone())).expect("link");

    src.close();
    assert!(plain.is_closed());
    assert!(!durable.is_closed(), "permanent node ignores the cascade");

    assert!(!durable.close(), "plain close still refused");
    assert!(durable.close_force(), "explicit force closes it");
    assert!(durable.is_closed());
}

#[test]
fn closed_node_drains_then_reports_drained() {
    let node = identity_node(&ChannelOptions::default(), [7, 8]);
    node.close();
    assert!(matches!(node.state(), NodeState::Closed));
    assert_eq!(node.receive(Consumer::simple()).try_get(), Some(Ok(7)));
    assert!(!node.is_drained());
    assert_eq!(node.receive(Consumer::simple()).try_get(), Some(Ok(8)));
    assert!(node.is_drained());
    assert_eq!(
        node.receive(Consumer::simple()).error_value(),
        Some(FlowError::Drained)
    );
}

#[test]
fn on_closed_and_on_drained_fire_in_lifecycle_order() {
    let node = identity_node(&ChannelOptions::default(), [1]);
    let events = Arc::new(Mutex::new(Vec::new()));
    let (c, d) = (events.clone(), events.clone());
    node.on_closed(Box::new(move || c.lock().push("closed")));
    node.on_drained(Box::new(move || d.lock().push("drained")));

    node.close();
    assert_eq!(*events.lock(), vec!["closed"]);
    node.receive(Consumer::simple());
    assert_eq!(*events.lock(), vec!["closed", "drained"]);

    // late registration fires immediately
    let late = Arc::new(AtomicU32::new(0));
    let l = late.clone();
    node.on_closed(Box::new(move || {
        l.fetch_add(1, Ordering::SeqCst);
    }));
    assert_eq!(late.load(Ordering::SeqCst), 1);
}

#[test]
fn error_cascades_through_taps_too() {
    let src = identity_node::<u32>(&ChannelOptions::default(), []);
    let main = identity_node::<u32>(&ChannelOptions::default(), []);
    let tapped = identity_node::<u32>(&ChannelOptions::default(), []);
    src.link(Edge::standard("main", main.clone())).expect("link");
    src.link(Edge::tap("tap", tapped.clone())).expect("link");

    src.fail_node(FlowError::callback("upstream died"));
    assert!(matches!(main.state(), NodeState::Error(_)));
    assert!(matches!(tapped.state(), NodeState::Error(_)));
}

#[test]
fn pending_receive_fails_on_close() {
    let node = identity_node::<u32>(&ChannelOptions::default(), []);
    let rc = node.receive(Consumer::simple());
    node.close();
    assert_eq!(rc.error_value(), Some(FlowError::Drained));
}

#[test]
fn cancellation_hooks_run_once() {
    let node = identity_node::<u32>(&ChannelOptions::default(), []);
    let hits = Arc::new(AtomicU32::new(0));
    let h = hits.clone();
    node.register_cancellation(
        7,
        Box::new(move || {
            h.fetch_add(1, Ordering::SeqCst);
        }),
    );
    assert!(node.cancel(7));
    assert!(!node.cancel(7));
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

#[test]
fn unlink_detaches_and_restores_state() {
    let node = identity_node::<u32>(&ChannelOptions::default(), []);
    let a = node.link(Edge::standard("a", Terminal::discarding("a"))).expect("link");
    let _b = node.link(Edge::standard("b", Terminal::discarding("b"))).expect("link");
    assert!(matches!(node.state(), NodeState::Split));
    assert!(node.unlink(a));
    assert!(!node.unlink(a));
    assert!(matches!(node.state(), NodeState::Open));
}

#[test]
fn grounded_node_stays_open_across_links() {
    let node = identity_node::<u32>(&ChannelOptions::default().grounded(true), []);
    node.link(Edge::standard("a", Terminal::discarding("a"))).expect("link");
    node.link(Edge::standard("b", Terminal::discarding("b"))).expect("link");
    assert!(matches!(node.state(), NodeState::Open));
}

#[test]
fn queued_producer_acked_when_consumer_arrives() {
    let node = identity_node::<u32>(&ChannelOptions::default(), []);
    let listener = match node.ingest(4, Release::none()) {
        SendResult::Deferred(l) => l,
        other => panic!("expected deferred back-pressure: {other:?}"),
    };
    assert!(!listener.is_realized());
    let rc = node.receive(Consumer::simple());
    assert_eq!(rc.try_get(), Some(Ok(4)));
    assert_eq!(listener.try_get(), Some(Ok(SendOutcome::Consumed)));
}

#[test]
fn chained_nodes_hand_over_without_reordering() {
    let a = identity_node::<u32>(&ChannelOptions::default(), []);
    let b: Arc<Node<u32, u32>> = Node::new(
        &ChannelOptions::default(),
        Box::new(|m: u32| Ok(Some(m * 10))),
    );
    let seen = Arc::new(Mutex::new(Vec::new()));
    b.link(Edge::standard("sink", collector(&seen))).expect("link");
    a.link(Edge::standard("a->b", b.clone())).expect("link");

    let handles: Vec<_> = (0..2u32)
        .map(|p| {
            let a = a.clone();
            thread::spawn(move || {
                for i in 0..50u32 {
                    a.ingest(p * 100 + i, Release::none());
                }
            })
        })
        .collect();
    for h in handles {
        h.join().expect("producer");
    }
    thread::sleep(Duration::from_millis(20));

    let seen = seen.lock();
    assert_eq!(seen.len(), 100);
    for p in 0..2u32 {
        let mine: Vec<u32> = seen
            .iter()
            .copied()
            .filter(|v| (v / 10) / 100 == p)
            .collect();
        let mut sorted = mine.clone();
        sorted.sort_unstable();
        assert_eq!(mine, sorted, "producer {p} reordered across the chain");
    }
}
