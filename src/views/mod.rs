//! Headless views: actors that keep a snapshot of remote rows in sync and
//! run role-gated mutations against the store.
//!
//! Each view subscribes on start and unsubscribes on stop. Change
//! notifications are debounced on the trailing edge and then trigger a full
//! refetch of the affected collection.

pub mod vault_detail;
pub mod vault_list;

use backon::ExponentialBuilder;
use ractor::{ActorRef, Message};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use crate::store::ChangeEvent;

pub use vault_detail::{Refetch, VaultDetailHandle, VaultDetailMessage};
pub use vault_list::{VaultListHandle, VaultListMessage};

/// Retries for follow-up writes that must not be left half-done.
pub(crate) fn write_retry_policy() -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(100))
        .with_max_delay(Duration::from_secs(1))
        .with_max_times(3)
        .with_jitter()
}

/// Subscription callback that casts every change into the actor's mailbox.
pub(crate) fn forward_changes<M, F>(
    actor: &ActorRef<M>,
    wrap: F,
) -> impl Fn(ChangeEvent) + Send + Sync + 'static
where
    M: Message,
    F: Fn(ChangeEvent) -> M + Send + Sync + 'static,
{
    let actor = actor.clone();
    move |event| {
        let _ = ractor::cast!(actor, wrap(event));
    }
}

/// Trailing-edge debounce. Every notification arms a timer tagged with a new
/// generation; only the timer holding the latest generation is acted on.
#[derive(Debug)]
pub(crate) struct Debouncer {
    window: Duration,
    generation: u64,
}

impl Debouncer {
    pub(crate) fn new(window: Duration) -> Self {
        Self {
            window,
            generation: 0,
        }
    }

    pub(crate) fn arm<M, F>(&mut self, myself: &ActorRef<M>, make: F)
    where
        M: Message,
        F: FnOnce(u64) -> M + Send + 'static,
    {
        self.generation += 1;
        let generation = self.generation;
        let window = self.window;
        let me = myself.clone();
        tokio::spawn(async move {
            tokio::time::sleep(window).await;
            let _ = ractor::cast!(me, make(generation));
        });
    }

    pub(crate) fn is_current(&self, generation: u64) -> bool {
        generation == self.generation
    }
}

pub(crate) fn publish<T: Clone>(publisher: &watch::Sender<Arc<T>>, snapshot: &T) {
    publisher.send_replace(Arc::new(snapshot.clone()));
}
