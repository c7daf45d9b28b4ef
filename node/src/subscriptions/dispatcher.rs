//! Per-subscription delivery dispatcher: offset-tracked, filter-evaluated,
//! at-least-once with a bounded read-ahead window. Within one subscription,
//! first deliveries strictly follow the event sequence.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, mpsc};

use crate::core::shutdown::Shutdown;
use crate::storage::{txn, Filter, OffsetType, Query, SharedStore, SortDir, StorageTxn};
use crate::types::{Event, FirstEvent, Subscription};
use crate::utilities::time::now_millis;

use super::{Ack, DeliveryTransport, EventDelivery};

struct InFlight {
    event: Event,
    attempts: u32,
    due: u64,
}

pub(crate) struct SubscriptionDispatcher {
    sub: Subscription,
    store: SharedStore,
    transport: Arc<dyn DeliveryTransport>,
    wake_rx: broadcast::Receiver<()>,
    ack_tx: mpsc::Sender<Ack>,
    ack_rx: mpsc::Receiver<Ack>,
    /// Outstanding un-acked deliveries keyed by sequence.
    pending: BTreeMap<i64, InFlight>,
    /// Highest sequence examined (delivered or filtered out).
    highest_scanned: i64,
    dead_lettered: u64,
}

impl SubscriptionDispatcher {
    pub(crate) fn new(
        sub: Subscription,
        store: SharedStore,
        transport: Arc<dyn DeliveryTransport>,
        wake_rx: broadcast::Receiver<()>,
    ) -> Self {
        let (ack_tx, ack_rx) = mpsc::channel(100);
        Self {
            sub,
            store,
            transport,
            wake_rx,
            ack_tx,
            ack_rx,
            pending: BTreeMap::new(),
            highest_scanned: 0,
            dead_lettered: 0,
        }
    }

    pub(crate) async fn run(mut self, mut shutdown: Shutdown) {
        match self.initial_offset().await {
            Ok(offset) => self.highest_scanned = offset,
            Err(err) => {
                log::error!(
                    "Subscription {} failed to load its offset: {err}",
                    self.sub.name
                );
                return;
            }
        }

        loop {
            if let Err(err) = self.fill().await {
                log::error!("Subscription {} fill failed: {err}", self.sub.name);
            }

            let next_due = self
                .pending
                .values()
                .map(|d| d.due)
                .min()
                .map(|due| due.saturating_sub(now_millis()))
                .unwrap_or(60_000);

            tokio::select! {
                _ = shutdown.shutdown_signal_rcv.recv() => {
                    log::info!(
                        "Shutting down subscription dispatcher {} ({} dead-lettered)",
                        self.sub.name,
                        self.dead_lettered
                    );
                    break;
                }
                wake = self.wake_rx.recv() => {
                    match wake {
                        Ok(()) => {}
                        // Falling behind on pulses is fine, state is re-read.
                        Err(broadcast::error::RecvError::Lagged(_)) => {}
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
                Some(ack) = self.ack_rx.recv() => {
                    if let Err(err) = self.handle_ack(ack).await {
                        log::error!("Subscription {} ack handling failed: {err}", self.sub.name);
                    }
                }
                _ = tokio::time::sleep(Duration::from_millis(next_due)) => {
                    if let Err(err) = self.redeliver_due().await {
                        log::error!("Subscription {} redelivery failed: {err}", self.sub.name);
                    }
                }
            }
        }
    }

    async fn initial_offset(&mut self) -> anyhow::Result<i64> {
        let sub = self.sub.clone();
        let mut store = self.store.lock().await;
        let offset = txn(store.as_mut(), |t| {
            if let Some(stored) = t.get_offset(OffsetType::Subscription, &sub.id)? {
                return Ok(stored);
            }
            let initial = match sub.options.first_event {
                FirstEvent::Oldest => 0,
                FirstEvent::Newest => t.max_event_sequence()?,
                FirstEvent::Sequence(s) => s,
            };
            t.upsert_offset(OffsetType::Subscription, &sub.id, initial)?;
            Ok(initial)
        })?;
        Ok(offset)
    }

    /// Pull events above the scan point, deliver the matching ones, and keep
    /// the outstanding window at read_ahead.
    async fn fill(&mut self) -> anyhow::Result<()> {
        loop {
            let room = self
                .sub
                .options
                .read_ahead
                .saturating_sub(self.pending.len());
            if room == 0 {
                return Ok(());
            }

            let events = {
                let scan_from = self.highest_scanned;
                let namespace = self.sub.namespace.clone();
                let mut store = self.store.lock().await;
                txn(store.as_mut(), |t| {
                    t.query_events(
                        &Query::new()
                            .filter(Filter::And(vec![
                                Filter::Eq("namespace", namespace.into()),
                                Filter::Gt("sequence", scan_from.into()),
                            ]))
                            .sort("sequence", SortDir::Asc)
                            .limit(room),
                    )
                })?
            };
            if events.is_empty() {
                return Ok(());
            }

            for event in events {
                let sequence = event.sequence;
                if self.matches(&event).await? {
                    if let Err(err) = self.send(event, 0).await {
                        // No consumer attached (or transport hiccup): stop
                        // scanning so this event is retried from here.
                        log::debug!(
                            "Delivery on {} stalled at {sequence}: {err}",
                            self.sub.name
                        );
                        self.persist_offset().await?;
                        return Ok(());
                    }
                } // Filtered-out events are consumed silently.
                self.highest_scanned = self.highest_scanned.max(sequence);
            }
            self.persist_offset().await?;
        }
    }

    async fn matches(&mut self, event: &Event) -> anyhow::Result<bool> {
        if !self.sub.filter.matches_event(event) {
            return Ok(false);
        }
        if !self.sub.filter.needs_message() {
            return Ok(true);
        }

        // Author/tag filters require the referenced message.
        let record = {
            let namespace = self.sub.namespace.clone();
            let reference = event.reference.clone();
            let mut store = self.store.lock().await;
            txn(store.as_mut(), |t| t.get_message(&namespace, &reference))?
        };
        Ok(match record {
            Some(record) => self.sub.filter.matches_message(&record.message),
            None => false,
        })
    }

    async fn send(&mut self, event: Event, attempts: u32) -> anyhow::Result<()> {
        let delivery = EventDelivery {
            subscription: self.sub.name.clone(),
            event: event.clone(),
        };
        self.transport
            .deliver(&self.sub, &delivery, self.ack_tx.clone())
            .await?;
        self.pending.insert(
            event.sequence,
            InFlight {
                event,
                attempts,
                due: now_millis() + self.sub.options.ack_timeout_ms,
            },
        );
        Ok(())
    }

    async fn handle_ack(&mut self, ack: Ack) -> anyhow::Result<()> {
        if ack.ok {
            self.pending.remove(&ack.sequence);
            self.persist_offset().await?;
            return Ok(());
        }

        // Nack: schedule a redelivery after backoff, or dead-letter.
        if let Some(inflight) = self.pending.get_mut(&ack.sequence) {
            inflight.attempts += 1;
            if inflight.attempts > self.sub.options.max_retries {
                return self.dead_letter(ack.sequence).await;
            }
            inflight.due = now_millis() + backoff_ms(&self.sub, inflight.attempts);
        }
        Ok(())
    }

    async fn redeliver_due(&mut self) -> anyhow::Result<()> {
        let now = now_millis();
        let due: Vec<i64> = self
            .pending
            .iter()
            .filter(|(_, d)| d.due <= now)
            .map(|(s, _)| *s)
            .collect();

        for sequence in due {
            let Some(inflight) = self.pending.get_mut(&sequence) else {
                continue;
            };
            inflight.attempts += 1;
            if inflight.attempts > self.sub.options.max_retries {
                self.dead_letter(sequence).await?;
                continue;
            }
            inflight.due = now + backoff_ms(&self.sub, inflight.attempts);

            let delivery = EventDelivery {
                subscription: self.sub.name.clone(),
                event: inflight.event.clone(),
            };
            log::debug!(
                "Redelivering event {} on subscription {} (attempt {})",
                sequence,
                self.sub.name,
                inflight.attempts
            );
            if let Err(err) = self
                .transport
                .deliver(&self.sub, &delivery, self.ack_tx.clone())
                .await
            {
                log::warn!("Redelivery on {} failed: {err}", self.sub.name);
            }
        }
        Ok(())
    }

    /// Repeated failure: the delivery is set aside and the stream moves on.
    async fn dead_letter(&mut self, sequence: i64) -> anyhow::Result<()> {
        log::error!(
            "Dead-lettering event {sequence} on subscription {} after {} retries",
            self.sub.name,
            self.sub.options.max_retries
        );
        self.pending.remove(&sequence);
        self.dead_lettered += 1;
        self.persist_offset().await
    }

    /// The durable offset trails the oldest outstanding delivery, so a
    /// restart redelivers rather than loses.
    async fn persist_offset(&mut self) -> anyhow::Result<()> {
        let offset = match self.pending.keys().next() {
            Some(lowest) => lowest - 1,
            None => self.highest_scanned,
        };
        let sub_id = self.sub.id.clone();
        let mut store = self.store.lock().await;
        txn(store.as_mut(), |t| {
            t.upsert_offset(OffsetType::Subscription, &sub_id, offset)
        })?;
        Ok(())
    }
}

fn backoff_ms(sub: &Subscription, attempts: u32) -> u64 {
    let mut delay = sub.options.retry_initial_ms;
    for _ in 1..attempts {
        delay = delay
            .saturating_mul(u64::from(sub.options.retry_multiplier))
            .min(sub.options.retry_max_ms);
    }
    delay.min(sub.options.retry_max_ms)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_backoff_growth() {
        let mut sub = Subscription::new("ns1", "s1");
        sub.options.retry_initial_ms = 100;
        sub.options.retry_multiplier = 2;
        sub.options.retry_max_ms = 350;

        assert_eq!(backoff_ms(&sub, 1), 100);
        assert_eq!(backoff_ms(&sub, 2), 200);
        assert_eq!(backoff_ms(&sub, 3), 350);
        assert_eq!(backoff_ms(&sub, 10), 350);
    }
}
