//! The round engine.
//!
//! One task owns the current [liftoff_execution::Round] and applies every phase change,
//! bet and cashout in the order it sees them. Everything else talks to it through the
//! [Mailbox] and hears back through a [Publisher].

use liftoff_execution::fair;
use liftoff_gateway::RealtimeHub;
use liftoff_types::{Event, Multiplier, Wei};
use rand::rngs::StdRng;
use std::{sync::Arc, time::Duration};
use tokio::sync::mpsc;

mod actor;
mod ingress;

pub use actor::Actor;
pub use ingress::{Mailbox, MailboxError, Message};

#[derive(Clone, Debug)]
pub struct Config {
    pub betting: Duration,
    pub cooldown: Duration,
    /// Late bets are accepted this long after a round starts running.
    pub grace: Duration,
    pub tick: Duration,
    pub min_bet: Wei,
    pub max_bet: Wei,
    pub max_payout: Multiplier,
    pub client_seed: String,
    pub mailbox_size: usize,
}

/// Destination for engine events.
pub trait Publisher: Send + Sync + 'static {
    fn publish(&self, event: Event);
}

impl Publisher for Arc<RealtimeHub> {
    fn publish(&self, event: Event) {
        RealtimeHub::publish(self, event);
    }
}

impl Publisher for mpsc::UnboundedSender<Event> {
    fn publish(&self, event: Event) {
        let _ = self.send(event);
    }
}

/// Source of per-round server seeds.
pub trait SeedSource: Send + 'static {
    fn next_seed(&mut self) -> String;
}

impl SeedSource for StdRng {
    fn next_seed(&mut self) -> String {
        fair::generate_server_seed(self)
    }
}

/// Reuses one server seed; rounds still differ by nonce.
pub struct Fixed(pub String);

impl SeedSource for Fixed {
    fn next_seed(&mut self) -> String {
        self.0.clone()
    }
}
