//! Sync and emit scheduling
//!
//! The syncer drives two independent signals. "Sync" fires on a fixed
//! period from startup. "Emit" fires at the register interval announced by
//! the router fleet, which is learned by greeting the routers until one
//! replies, and replaced whenever a router broadcasts a new interval.

use crate::bus::{BusMessage, MessageBus};
use crate::{CoreError, Result};
use emitter_api::messages::{GREET_SUBJECT, START_SUBJECT};
use emitter_api::RouterGreeting;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Cadence of greet requests while no register interval is known
pub const DEFAULT_GREET_INTERVAL: Duration = Duration::from_secs(1);

/// Receiving ends of the syncer's signals
#[derive(Debug)]
pub struct SyncerEvents {
    pub sync: mpsc::Receiver<()>,
    pub emit: mpsc::Receiver<()>,
}

pub struct Syncer {
    bus: Arc<dyn MessageBus>,
    sync_interval: Duration,
    greet_interval: Duration,
    sync_tx: mpsc::Sender<()>,
    emit_tx: mpsc::Sender<()>,
}

fn new_ticker(start: Instant, period: Duration) -> Interval {
    let mut ticker = interval_at(start, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker
}

async fn tick(ticker: &mut Option<Interval>) -> Instant {
    match ticker {
        Some(ticker) => ticker.tick().await,
        None => std::future::pending().await,
    }
}

/// Pending signals are not stacked: a tick that finds one already queued is
/// dropped.
fn signal(tx: &mpsc::Sender<()>, name: &str) {
    match tx.try_send(()) {
        Ok(()) => debug!(signal = name, "Signalled"),
        Err(mpsc::error::TrySendError::Full(())) => {
            debug!(signal = name, "Signal already pending")
        }
        Err(mpsc::error::TrySendError::Closed(())) => {
            debug!(signal = name, "Signal receiver dropped")
        }
    }
}

impl Syncer {
    pub fn new(bus: Arc<dyn MessageBus>, sync_interval: Duration) -> (Self, SyncerEvents) {
        let (sync_tx, sync) = mpsc::channel(1);
        let (emit_tx, emit) = mpsc::channel(1);
        let syncer = Self {
            bus,
            sync_interval,
            greet_interval: DEFAULT_GREET_INTERVAL,
            sync_tx,
            emit_tx,
        };
        (syncer, SyncerEvents { sync, emit })
    }

    pub fn with_greet_interval(mut self, greet_interval: Duration) -> Self {
        self.greet_interval = greet_interval;
        self
    }

    /// Run until `cancel` fires. Returns an error only if the bus goes away.
    pub async fn run(self, cancel: CancellationToken) -> Result<()> {
        let mut start_sub = self.bus.subscribe(START_SUBJECT).await?;
        let inbox = format!("_INBOX.{}", Uuid::new_v4());
        let mut reply_sub = self.bus.subscribe(&inbox).await?;

        let now = Instant::now();
        let mut sync_ticker = new_ticker(now, self.sync_interval);
        let mut greet_ticker = Some(new_ticker(now, self.greet_interval));
        let mut emit_ticker: Option<Interval> = None;

        info!(sync_interval = ?self.sync_interval, "Syncer started");

        let result = loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {
                    info!("Syncer shutting down");
                    break Ok(());
                }
                _ = sync_ticker.tick() => signal(&self.sync_tx, "sync"),
                _ = tick(&mut emit_ticker) => signal(&self.emit_tx, "emit"),
                _ = tick(&mut greet_ticker) => {
                    debug!(reply_to = %inbox, "Greeting routers");
                    if let Err(e) = self.bus.publish(GREET_SUBJECT, Some(&inbox), Vec::new()).await {
                        warn!(error = %e, "Failed to greet routers");
                    }
                }
                message = start_sub.receiver.recv() => match message {
                    Some(message) => {
                        self.handle_greeting(&message, &mut emit_ticker, &mut greet_ticker)
                    }
                    None => break Err(CoreError::BusClosed),
                },
                message = reply_sub.receiver.recv() => match message {
                    Some(message) => {
                        self.handle_greeting(&message, &mut emit_ticker, &mut greet_ticker)
                    }
                    None => break Err(CoreError::BusClosed),
                },
            }
        };

        for sid in [start_sub.sid, reply_sub.sid] {
            if let Err(e) = self.bus.unsubscribe(sid).await {
                debug!(sid, error = %e, "Failed to unsubscribe");
            }
        }
        result
    }

    /// Adopt the register interval from a router greeting: emit now, then
    /// every interval from now on, and stop greeting.
    fn handle_greeting(
        &self,
        message: &BusMessage,
        emit_ticker: &mut Option<Interval>,
        greet_ticker: &mut Option<Interval>,
    ) {
        let greeting = match parse_greeting(&message.payload) {
            Ok(greeting) => greeting,
            Err(e) => {
                warn!(subject = %message.subject, error = %e, "Ignoring router greeting");
                return;
            }
        };

        let period = greeting.register_interval();
        info!(
            subject = %message.subject,
            register_interval = ?period,
            prune_threshold = greeting.prune_threshold_in_seconds,
            "Received register interval"
        );

        *greet_ticker = None;
        *emit_ticker = Some(new_ticker(Instant::now() + period, period));
        signal(&self.emit_tx, "emit");
    }
}

fn parse_greeting(payload: &[u8]) -> Result<RouterGreeting> {
    let greeting: RouterGreeting = serde_json::from_slice(payload)
        .map_err(|e| CoreError::InvalidGreeting(e.to_string()))?;
    if greeting.minimum_register_interval_in_seconds == 0 {
        return Err(CoreError::InvalidGreeting(
            "register interval must be positive".to_string(),
        ));
    }
    Ok(greeting)
}
