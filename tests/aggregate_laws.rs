use std::time::Duration;

use proptest::prelude::*;
use stampede::aggregate::{
    Aggregate, HistogramShape, SessionEvent, Statistics, StatisticsSet, merge,
};
use stampede::{Outcome, SessionCounters};

#[derive(Clone, Debug)]
struct Event {
    metric: &'static str,
    outcome: Outcome,
    latency: Duration,
}

fn outcome() -> impl Strategy<Value = Outcome> {
    prop_oneof![
        4 => Just(Outcome::Success),
        1 => Just(Outcome::Invalid),
        1 => Just(Outcome::ConnectionError),
        1 => Just(Outcome::Timeout),
        1 => Just(Outcome::InternalError),
    ]
}

fn event() -> impl Strategy<Value = Event> {
    (
        prop_oneof![Just("get"), Just("post"), Just("delete")],
        outcome(),
        1u64..5_000_000_000,
    )
        .prop_map(|(metric, outcome, nanos)| Event {
            metric,
            outcome,
            latency: Duration::from_nanos(nanos),
        })
}

fn record(events: &[Event]) -> StatisticsSet {
    let mut statistics = Statistics::new(HistogramShape::default()).unwrap();
    for event in events {
        statistics.record_request(event.metric);
        statistics.record(
            event.metric,
            event.outcome,
            event.latency.as_nanos() as u64,
        );
    }
    statistics.snapshot()
}

proptest! {
    #[test]
    fn merge_is_commutative(a in prop::collection::vec(event(), 0..200), b in prop::collection::vec(event(), 0..200)) {
        let (a, b) = (record(&a), record(&b));
        prop_assert_eq!(merge(&a, &b).unwrap(), merge(&b, &a).unwrap());
    }

    #[test]
    fn merge_is_associative(
        a in prop::collection::vec(event(), 0..100),
        b in prop::collection::vec(event(), 0..100),
        c in prop::collection::vec(event(), 0..100),
    ) {
        let (a, b, c) = (record(&a), record(&b), record(&c));
        let left = merge(&merge(&a, &b).unwrap(), &c).unwrap();
        let right = merge(&a, &merge(&b, &c).unwrap()).unwrap();
        prop_assert_eq!(left, right);
    }

    #[test]
    fn partitions_merge_to_the_whole(
        events in prop::collection::vec(event(), 0..500),
        shards in prop::collection::vec(0usize..8, 500),
    ) {
        let mut parts = vec![Vec::new(); 8];
        for (event, shard) in events.iter().zip(shards) {
            parts[shard].push(event.clone());
        }
        let merged = parts
            .iter()
            .map(|part| record(part))
            .try_fold(StatisticsSet::default(), |acc, part| merge(&acc, &part))
            .unwrap();
        let whole = record(&events);
        prop_assert_eq!(merged.len(), whole.len());
        for (metric, snapshot) in whole.iter() {
            prop_assert_eq!(merged.get(metric), Some(snapshot));
        }
    }

    #[test]
    fn session_counters_merge_like_one_stream(
        events in prop::collection::vec(
            prop_oneof![
                Just(SessionEvent::Started),
                Just(SessionEvent::Blocked),
                Just(SessionEvent::Completed),
                Just(SessionEvent::Failed),
                Just(SessionEvent::Terminated),
            ],
            0..300,
        ),
        split in 0usize..300,
    ) {
        let split = split.min(events.len());
        let mut whole = SessionCounters::default();
        whole.aggregate(&events);
        let mut left = SessionCounters::default();
        left.aggregate(&events[..split]);
        let mut right = SessionCounters::default();
        right.aggregate(&events[split..]);
        left.merge(&right).unwrap();
        prop_assert_eq!(left, whole);
    }
}
