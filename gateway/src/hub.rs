//! Ordered event fan-out with replay on reconnect.
//!
//! Every sequenced event gets the next id, is folded into the running [RoundSnapshot],
//! appended to a bounded ring buffer and broadcast, all under one lock. A reconnecting
//! client either receives exactly the buffered events after its `lastEventId` or, if
//! those have aged out, a snapshot that is consistent with the id it carries.

use liftoff_types::{
    api::UNSEQUENCED, now_millis, Envelope, Event, RoundSnapshot,
};
use std::{
    collections::VecDeque,
    sync::{Mutex, MutexGuard, PoisonError},
};
use tokio::sync::broadcast;

/// What a (re)connecting client needs before following the live stream.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Replay {
    /// Every event after the client's last id, in order (possibly empty).
    Events(Vec<Envelope>),
    /// The client is too far behind (or new); start from this state.
    Snapshot(Envelope),
}

struct State {
    next_id: u64,
    buffer: VecDeque<Envelope>,
    snapshot: RoundSnapshot,
}

pub struct RealtimeHub {
    capacity: usize,
    state: Mutex<State>,
    sender: broadcast::Sender<Envelope>,
}

impl RealtimeHub {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (sender, _) = broadcast::channel(capacity);
        Self {
            capacity,
            state: Mutex::new(State {
                next_id: 1,
                buffer: VecDeque::with_capacity(capacity),
                snapshot: RoundSnapshot::default(),
            }),
            sender,
        }
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Assign the next id to `event`, buffer it and send it to every subscriber.
    pub fn publish(&self, event: Event) -> Envelope {
        let mut state = self.state();
        let id = state.next_id;
        state.next_id += 1;
        state.snapshot.apply(id, &event);

        let envelope = Envelope::new(id, now_millis(), event);
        if state.buffer.len() == self.capacity {
            state.buffer.pop_front();
        }
        state.buffer.push_back(envelope.clone());

        // No subscribers is not an error
        let _ = self.sender.send(envelope.clone());
        envelope
    }

    /// Send an event to current subscribers without sequencing or buffering it.
    pub fn broadcast(&self, event: Event) -> Envelope {
        let envelope = Envelope::new(UNSEQUENCED, now_millis(), event);
        let _ = self.sender.send(envelope.clone());
        envelope
    }

    /// Subscribe to the live stream and compute what the client missed.
    ///
    /// Both happen under the publish lock so nothing falls between the replay and the
    /// first live event.
    pub fn connect(&self, last_event_id: Option<u64>) -> (Replay, broadcast::Receiver<Envelope>) {
        let state = self.state();
        let receiver = self.sender.subscribe();
        let replay = match last_event_id {
            Some(last) if Self::retained(&state, last) => Replay::Events(
                state
                    .buffer
                    .iter()
                    .filter(|envelope| envelope.id > last)
                    .cloned()
                    .collect(),
            ),
            _ => Replay::Snapshot(Self::snapshot_envelope(&state)),
        };
        (replay, receiver)
    }

    /// Current state as a snapshot envelope.
    pub fn snapshot(&self) -> Envelope {
        Self::snapshot_envelope(&self.state())
    }

    /// Id of the most recent sequenced event (0 before the first).
    pub fn last_event_id(&self) -> u64 {
        self.state().next_id - 1
    }

    pub fn subscribers(&self) -> usize {
        self.sender.receiver_count()
    }

    fn retained(state: &State, last: u64) -> bool {
        let latest = state.next_id - 1;
        let oldest = state
            .buffer
            .front()
            .map_or(state.next_id, |envelope| envelope.id);
        last <= latest && last.saturating_add(1) >= oldest
    }

    fn snapshot_envelope(state: &State) -> Envelope {
        Envelope::new(
            UNSEQUENCED,
            now_millis(),
            Event::Snapshot(state.snapshot.clone()),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use liftoff_types::{
        api::{MultiplierUpdate, RoundStarted, SyncTick},
        Multiplier, Phase,
    };

    fn started(round_id: u64) -> Event {
        Event::RoundStarted(RoundStarted {
            round_id,
            seed_hash: format!("hash-{round_id}"),
            client_seed: "client".into(),
            nonce: round_id,
            betting_ms: 5_000,
        })
    }

    fn update(round_id: u64, multiplier: u64) -> Event {
        Event::MultiplierUpdate(MultiplierUpdate {
            round_id,
            multiplier: Multiplier(multiplier),
            elapsed_ms: 0,
        })
    }

    fn ids(replay: &Replay) -> Vec<u64> {
        match replay {
            Replay::Events(events) => events.iter().map(|envelope| envelope.id).collect(),
            Replay::Snapshot(_) => panic!("expected events, got snapshot"),
        }
    }

    #[test]
    fn test_ids_strictly_increase() {
        let hub = RealtimeHub::new(16);
        let first = hub.publish(started(1));
        let second = hub.publish(update(1, 101));
        assert_eq!(first.id, 1);
        assert_eq!(second.id, 2);
        assert_eq!(hub.last_event_id(), 2);
    }

    #[test]
    fn test_replay_after_last_event_id() {
        let hub = RealtimeHub::new(16);
        hub.publish(started(1));
        for multiplier in 101..106 {
            hub.publish(update(1, multiplier));
        }
        let (replay, _) = hub.connect(Some(3));
        assert_eq!(ids(&replay), vec![4, 5, 6]);

        let (replay, _) = hub.connect(Some(6));
        assert_eq!(ids(&replay), Vec::<u64>::new());
    }

    #[test]
    fn test_snapshot_when_outside_retention() {
        let hub = RealtimeHub::new(4);
        hub.publish(started(1));
        for multiplier in 101..110 {
            hub.publish(update(1, multiplier));
        }
        // Buffer holds ids 7..=10
        assert_eq!(ids(&hub.connect(Some(6)).0), vec![7, 8, 9, 10]);

        let (replay, _) = hub.connect(Some(5));
        let Replay::Snapshot(envelope) = replay else {
            panic!("expected snapshot");
        };
        assert_eq!(envelope.id, UNSEQUENCED);
        let Event::Snapshot(snapshot) = envelope.event else {
            panic!("expected snapshot event");
        };
        assert_eq!(snapshot.last_event_id, 10);
        assert_eq!(snapshot.round_id, Some(1));
        assert_eq!(snapshot.phase, Phase::Running);
        assert_eq!(snapshot.multiplier, Some(Multiplier(109)));
    }

    #[test]
    fn test_new_client_and_future_id_get_snapshot() {
        let hub = RealtimeHub::new(4);
        hub.publish(started(1));
        assert!(matches!(hub.connect(None).0, Replay::Snapshot(_)));
        assert!(matches!(hub.connect(Some(42)).0, Replay::Snapshot(_)));
    }

    #[test]
    fn test_empty_hub_replay() {
        let hub = RealtimeHub::new(4);
        assert_eq!(ids(&hub.connect(Some(0)).0), Vec::<u64>::new());
    }

    #[tokio::test]
    async fn test_live_stream_follows_replay_without_gaps() {
        let hub = RealtimeHub::new(8);
        hub.publish(started(1));
        hub.publish(update(1, 101));
        let (replay, mut receiver) = hub.connect(Some(1));
        assert_eq!(ids(&replay), vec![2]);

        hub.publish(update(1, 102));
        hub.broadcast(Event::SyncTick(SyncTick { server_time: 5 }));
        let live = receiver.recv().await.unwrap();
        assert_eq!(live.id, 3);
        let tick = receiver.recv().await.unwrap();
        assert!(!tick.is_sequenced());
        assert_eq!(hub.last_event_id(), 3);
    }
}
