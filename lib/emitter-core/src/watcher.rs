//! Top-level driver serializing every routing table mutation
//!
//! The watcher owns the event handler. Cluster events, sync and emit
//! signals, and the results of background fetches are all consumed by one
//! loop, so a sync swap can never interleave with an event.

use crate::handler::EventHandler;
use crate::source::{ClusterEventSource, Snapshot};
use crate::syncer::SyncerEvents;
use crate::Result;
use emitter_api::{ActualEndpointInfo, ClusterEvent, DesiredRouteInfo};
use futures::StreamExt;
use indexmap::IndexMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Initial delay before resubscribing to the event stream
const INITIAL_BACKOFF: Duration = Duration::from_secs(1);

/// Maximum delay between resubscribe attempts
const MAX_BACKOFF: Duration = Duration::from_secs(30);

const EVENT_BUFFER: usize = 1024;

pub struct Watcher {
    handler: EventHandler,
    source: Arc<dyn ClusterEventSource>,
    events: SyncerEvents,
    cell_id: Option<String>,
}

/// Events seen while a snapshot is being fetched, latest per key
type EventCache = IndexMap<String, ClusterEvent>;

fn running_actual(event: &ClusterEvent) -> Option<&ActualEndpointInfo> {
    match event {
        ClusterEvent::ActualCreated { actual } if actual.is_running() => Some(actual),
        ClusterEvent::ActualChanged { after, .. } if after.is_running() => Some(after),
        _ => None,
    }
}

/// Keep the latest event per key; a replaced event moves to the end of the
/// replay order
fn cache_event(cache: &mut EventCache, event: ClusterEvent) {
    if let Some(key) = event.key().map(str::to_string) {
        cache.shift_remove(&key);
        cache.insert(key, event);
    }
}

impl Watcher {
    pub fn new(
        handler: EventHandler,
        source: Arc<dyn ClusterEventSource>,
        events: SyncerEvents,
    ) -> Self {
        Self {
            handler,
            source,
            events,
            cell_id: None,
        }
    }

    /// Only process actual endpoints placed on `cell_id`
    pub fn with_cell_id(mut self, cell_id: Option<String>) -> Self {
        self.cell_id = cell_id.filter(|cell| !cell.is_empty());
        self
    }

    pub async fn run(mut self, cancel: CancellationToken) -> Result<()> {
        let (event_tx, mut event_rx) = mpsc::channel(EVENT_BUFFER);
        let stream_task = tokio::spawn(stream_events(
            self.source.clone(),
            event_tx,
            cancel.clone(),
        ));

        let (snapshot_tx, mut snapshot_rx) = mpsc::channel::<Result<Snapshot>>(1);
        let (refresh_tx, mut refresh_rx) = mpsc::channel::<Result<Vec<DesiredRouteInfo>>>(16);
        let mut cache: Option<EventCache> = None;

        info!(cell_id = ?self.cell_id, "Watcher started");

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Watcher shutting down");
                    break;
                }
                Some(event) = event_rx.recv() => {
                    self.on_event(event, cache.as_mut(), &refresh_tx).await;
                }
                Some(result) = snapshot_rx.recv() => {
                    let cached = cache.take().unwrap_or_default();
                    self.on_snapshot(result, cached).await;
                }
                Some(result) = refresh_rx.recv() => match result {
                    Ok(desired) => self.handler.refresh_desired(&desired).await,
                    Err(e) => warn!(error = %e, "Failed to refresh desired routes"),
                },
                Some(()) = self.events.sync.recv() => {
                    if cache.is_some() {
                        debug!("Sync already in progress, skipping");
                    } else {
                        cache = Some(EventCache::new());
                        let source = self.source.clone();
                        let tx = snapshot_tx.clone();
                        tokio::spawn(async move {
                            let _ = tx.send(source.snapshot().await).await;
                        });
                    }
                }
                Some(()) = self.events.emit.recv() => self.handler.emit().await,
            }
        }

        if let Err(e) = stream_task.await {
            warn!(error = %e, "Event stream task failed");
        }
        Ok(())
    }

    async fn on_event(
        &mut self,
        event: ClusterEvent,
        cache: Option<&mut EventCache>,
        refresh_tx: &mpsc::Sender<Result<Vec<DesiredRouteInfo>>>,
    ) {
        if let Some(cell_id) = &self.cell_id {
            let actuals = event.actuals();
            if !actuals.is_empty() && !actuals.iter().any(|a| &a.cell_id == cell_id) {
                debug!(event_type = event.event_type(), "Ignoring event from another cell");
                return;
            }
        }

        self.handler.handle_event(&event).await;

        if let Some(actual) = running_actual(&event) {
            if self.handler.should_refresh_desired(actual) {
                debug!(process_guid = %actual.process_guid, "Refreshing desired routes");
                let source = self.source.clone();
                let tx = refresh_tx.clone();
                let process_guids = vec![actual.process_guid.clone()];
                tokio::spawn(async move {
                    let _ = tx.send(source.desired_routes_for(&process_guids).await).await;
                });
            }
        }

        if let Some(cache) = cache {
            cache_event(cache, event);
        }
    }

    async fn on_snapshot(&mut self, result: Result<Snapshot>, cached: EventCache) {
        match result {
            Ok(mut snapshot) => {
                if let Some(cell_id) = &self.cell_id {
                    snapshot.retain_cell(cell_id);
                }
                self.handler.sync(snapshot, &cached).await;
            }
            Err(e) => {
                error!(error = %e, dropped_events = cached.len(), "Failed to fetch snapshot, sync skipped");
            }
        }
    }
}

/// Forward cluster events to `tx`, resubscribing with backoff whenever the
/// subscription fails or ends
async fn stream_events(
    source: Arc<dyn ClusterEventSource>,
    tx: mpsc::Sender<ClusterEvent>,
    cancel: CancellationToken,
) {
    let mut backoff = INITIAL_BACKOFF;
    loop {
        let subscribed = tokio::select! {
            _ = cancel.cancelled() => return,
            subscribed = source.subscribe() => subscribed,
        };

        match subscribed {
            Ok(mut stream) => {
                info!("Subscribed to cluster events");
                backoff = INITIAL_BACKOFF;
                loop {
                    let next = tokio::select! {
                        _ = cancel.cancelled() => return,
                        next = stream.next() => next,
                    };
                    match next {
                        Some(Ok(event)) => {
                            if tx.send(event).await.is_err() {
                                return;
                            }
                        }
                        Some(Err(e)) => error!(error = %e, "Failed to decode cluster event"),
                        None => {
                            warn!("Cluster event stream ended");
                            break;
                        }
                    }
                }
            }
            Err(e) => {
                error!(error = %e, backoff_secs = backoff.as_secs(), "Failed to subscribe to cluster events");
            }
        }

        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(backoff) => {}
        }
        backoff = (backoff * 2).min(MAX_BACKOFF);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::tests::{actual, desired, RecordingRegistry};
    use crate::CoreError;
    use async_trait::async_trait;
    use emitter_api::{DomainSet, MessagesToEmit};
    use futures::channel::mpsc as fmpsc;
    use futures::stream::BoxStream;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tokio::sync::oneshot;

    #[derive(Default)]
    struct FakeSource {
        stream: Mutex<Option<fmpsc::UnboundedReceiver<Result<ClusterEvent>>>>,
        snapshot: Mutex<Snapshot>,
        snapshot_gate: Mutex<Option<oneshot::Receiver<()>>>,
        fail_snapshot: bool,
        desired: Mutex<Vec<DesiredRouteInfo>>,
        /// Subscriptions that fail before any stream is handed out
        failed_subscribes: Mutex<usize>,
        /// Streams that end immediately, handed out after the failures
        ended_streams: Mutex<usize>,
        subscribe_calls: AtomicUsize,
    }

    #[async_trait]
    impl ClusterEventSource for FakeSource {
        async fn subscribe(&self) -> Result<BoxStream<'static, Result<ClusterEvent>>> {
            self.subscribe_calls.fetch_add(1, Ordering::SeqCst);
            {
                let mut failed = self.failed_subscribes.lock().expect("lock");
                if *failed > 0 {
                    *failed -= 1;
                    return Err(CoreError::EventSource("connection refused".to_string()));
                }
            }
            {
                let mut ended = self.ended_streams.lock().expect("lock");
                if *ended > 0 {
                    *ended -= 1;
                    return Ok(futures::stream::empty().boxed());
                }
            }
            match self.stream.lock().expect("lock").take() {
                Some(receiver) => Ok(receiver.boxed()),
                None => Ok(futures::stream::pending().boxed()),
            }
        }

        async fn desired_routes(&self) -> Result<Vec<DesiredRouteInfo>> {
            Ok(self.snapshot.lock().expect("lock").desired.clone())
        }

        async fn desired_routes_for(&self, process_guids: &[String]) -> Result<Vec<DesiredRouteInfo>> {
            Ok(self
                .desired
                .lock()
                .expect("lock")
                .iter()
                .filter(|d| process_guids.contains(&d.process_guid))
                .cloned()
                .collect())
        }

        async fn actual_endpoints(&self) -> Result<Vec<ActualEndpointInfo>> {
            Ok(self.snapshot.lock().expect("lock").actuals.clone())
        }

        async fn domains(&self) -> Result<DomainSet> {
            Ok(self.snapshot.lock().expect("lock").domains.clone())
        }

        async fn snapshot(&self) -> Result<Snapshot> {
            let gate = self.snapshot_gate.lock().expect("lock").take();
            if let Some(gate) = gate {
                let _ = gate.await;
            }
            if self.fail_snapshot {
                return Err(CoreError::EventSource("unavailable".to_string()));
            }
            Ok(self.snapshot.lock().expect("lock").clone())
        }
    }

    struct Harness {
        events: fmpsc::UnboundedSender<Result<ClusterEvent>>,
        sync: mpsc::Sender<()>,
        emit: mpsc::Sender<()>,
        registry: Arc<RecordingRegistry>,
        cancel: CancellationToken,
        handle: tokio::task::JoinHandle<Result<()>>,
    }

    fn start(source: FakeSource, cell_id: Option<&str>) -> Harness {
        let (events, receiver) = fmpsc::unbounded();
        *source.stream.lock().expect("lock") = Some(receiver);

        let (sync, sync_rx) = mpsc::channel(1);
        let (emit, emit_rx) = mpsc::channel(1);
        let registry = Arc::new(RecordingRegistry::default());
        let handler = EventHandler::new().with_registry_emitter(registry.clone());
        let watcher = Watcher::new(
            handler,
            Arc::new(source),
            SyncerEvents {
                sync: sync_rx,
                emit: emit_rx,
            },
        )
        .with_cell_id(cell_id.map(str::to_string));

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(watcher.run(cancel.clone()));
        Harness {
            events,
            sync,
            emit,
            registry,
            cancel,
            handle,
        }
    }

    impl Harness {
        fn send(&self, event: ClusterEvent) {
            self.events.unbounded_send(Ok(event)).expect("send event");
        }

        async fn wait_for_batches(&self, count: usize) -> Vec<MessagesToEmit> {
            tokio::time::timeout(Duration::from_secs(5), async {
                loop {
                    let batches = self.registry.batches();
                    if batches.len() >= count {
                        return batches;
                    }
                    tokio::time::sleep(Duration::from_millis(5)).await;
                }
            })
            .await
            .expect("timed out waiting for emitted batches")
        }

        async fn stop(self) {
            self.cancel.cancel();
            self.handle.await.expect("join").expect("run");
        }
    }

    fn hosts(batch: &MessagesToEmit) -> Vec<String> {
        let mut hosts: Vec<String> = batch
            .registration_messages
            .iter()
            .map(|m| m.address())
            .collect();
        hosts.sort();
        hosts
    }

    #[tokio::test]
    async fn test_events_are_applied_in_order() {
        let harness = start(FakeSource::default(), None);
        harness.send(ClusterEvent::DesiredCreated {
            desired: desired("p1", &["a.com"]),
        });
        harness.send(ClusterEvent::ActualCreated {
            actual: actual("p1", "i1", "1.2.3.4"),
        });

        let batches = harness.wait_for_batches(1).await;
        assert_eq!(hosts(&batches[0]), vec!["1.2.3.4:1234"]);
        harness.stop().await;
    }

    #[tokio::test]
    async fn test_sync_signal_applies_snapshot() {
        let source = FakeSource {
            snapshot: Mutex::new(Snapshot {
                desired: vec![desired("p1", &["a.com"])],
                actuals: vec![actual("p1", "i1", "1.2.3.4")],
                domains: ["domain"].into_iter().collect(),
            }),
            ..Default::default()
        };
        let harness = start(source, None);
        harness.sync.send(()).await.expect("sync");

        let batches = harness.wait_for_batches(1).await;
        assert_eq!(hosts(&batches[0]), vec!["1.2.3.4:1234"]);
        harness.stop().await;
    }

    #[tokio::test]
    async fn test_events_during_sync_are_replayed() {
        let (release, gate) = oneshot::channel();
        let source = FakeSource {
            snapshot: Mutex::new(Snapshot {
                desired: vec![desired("p1", &["a.com"])],
                actuals: vec![actual("p1", "i1", "1.2.3.4")],
                domains: ["domain"].into_iter().collect(),
            }),
            snapshot_gate: Mutex::new(Some(gate)),
            ..Default::default()
        };
        let harness = start(source, None);
        harness.sync.send(()).await.expect("sync");
        tokio::time::sleep(Duration::from_millis(50)).await;
        harness.send(ClusterEvent::ActualCreated {
            actual: actual("p1", "i2", "1.2.3.5"),
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(harness.registry.batches().is_empty());

        release.send(()).expect("release snapshot");
        let batches = harness.wait_for_batches(1).await;
        assert_eq!(hosts(&batches[0]), vec!["1.2.3.4:1234", "1.2.3.5:1234"]);
        harness.stop().await;
    }

    #[tokio::test]
    async fn test_failed_snapshot_keeps_table() {
        let source = FakeSource {
            fail_snapshot: true,
            ..Default::default()
        };
        let harness = start(source, None);
        harness.send(ClusterEvent::DesiredCreated {
            desired: desired("p1", &["a.com"]),
        });
        harness.send(ClusterEvent::ActualCreated {
            actual: actual("p1", "i1", "1.2.3.4"),
        });
        harness.wait_for_batches(1).await;

        harness.sync.send(()).await.expect("sync");
        tokio::time::sleep(Duration::from_millis(50)).await;
        harness.emit.send(()).await.expect("emit");

        let batches = harness.wait_for_batches(2).await;
        assert_eq!(hosts(&batches[1]), vec!["1.2.3.4:1234"]);
        assert!(batches[1].unregistration_messages.is_empty());
        harness.stop().await;
    }

    #[tokio::test]
    async fn test_other_cells_are_ignored() {
        let harness = start(FakeSource::default(), Some("cell-1"));
        harness.send(ClusterEvent::DesiredCreated {
            desired: desired("p1", &["a.com"]),
        });
        let mut elsewhere = actual("p1", "i2", "1.2.3.5");
        elsewhere.cell_id = "cell-2".to_string();
        harness.send(ClusterEvent::ActualCreated { actual: elsewhere });
        harness.send(ClusterEvent::ActualCreated {
            actual: actual("p1", "i1", "1.2.3.4"),
        });

        let batches = harness.wait_for_batches(1).await;
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(harness.registry.batches().len(), 1);
        assert_eq!(hosts(&batches[0]), vec!["1.2.3.4:1234"]);
        harness.stop().await;
    }

    #[tokio::test]
    async fn test_orphaned_endpoint_refreshes_desired() {
        let source = FakeSource {
            desired: Mutex::new(vec![desired("p1", &["a.com"])]),
            ..Default::default()
        };
        let harness = start(source, None);
        harness.send(ClusterEvent::ActualCreated {
            actual: actual("p1", "i1", "1.2.3.4"),
        });

        let batches = harness.wait_for_batches(1).await;
        assert_eq!(hosts(&batches[0]), vec!["1.2.3.4:1234"]);
        harness.stop().await;
    }

    #[tokio::test]
    async fn test_cancel_stops_watcher() {
        let harness = start(FakeSource::default(), None);
        harness.stop().await;
    }

    #[test]
    fn test_cache_keeps_latest_event_per_key_at_the_end() {
        let mut cache = EventCache::new();
        cache_event(
            &mut cache,
            ClusterEvent::ActualCreated {
                actual: actual("p1", "i1", "1.2.3.4"),
            },
        );
        cache_event(
            &mut cache,
            ClusterEvent::ActualCreated {
                actual: actual("p1", "i2", "1.2.3.5"),
            },
        );
        cache_event(
            &mut cache,
            ClusterEvent::ActualRemoved {
                actual: actual("p1", "i1", "1.2.3.4"),
            },
        );
        cache_event(
            &mut cache,
            ClusterEvent::Unrecognized {
                event_type: "task_created".to_string(),
            },
        );

        let keys: Vec<&str> = cache.keys().map(String::as_str).collect();
        assert_eq!(keys, vec!["i2", "i1"]);
        assert!(matches!(cache.get("i1"), Some(ClusterEvent::ActualRemoved { .. })));
    }

    #[tokio::test]
    async fn test_latest_event_per_instance_is_replayed() {
        let (release, gate) = oneshot::channel();
        let source = FakeSource {
            snapshot: Mutex::new(Snapshot {
                desired: vec![desired("p1", &["a.com"])],
                actuals: vec![actual("p1", "i1", "1.2.3.4")],
                domains: ["domain"].into_iter().collect(),
            }),
            snapshot_gate: Mutex::new(Some(gate)),
            ..Default::default()
        };
        let harness = start(source, None);
        harness.sync.send(()).await.expect("sync");
        tokio::time::sleep(Duration::from_millis(50)).await;

        harness.send(ClusterEvent::ActualCreated {
            actual: actual("p1", "i1", "1.2.3.6"),
        });
        harness.send(ClusterEvent::ActualCreated {
            actual: actual("p1", "i2", "1.2.3.5"),
        });
        harness.send(ClusterEvent::ActualRemoved {
            actual: actual("p1", "i1", "1.2.3.6"),
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(harness.registry.batches().is_empty());

        release.send(()).expect("release snapshot");
        let batches = harness.wait_for_batches(1).await;
        assert_eq!(hosts(&batches[0]), vec!["1.2.3.5:1234"]);
        assert!(batches[0].unregistration_messages.is_empty());
        harness.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_event_stream_is_resubscribed_with_backoff() {
        let source = Arc::new(FakeSource {
            failed_subscribes: Mutex::new(2),
            ended_streams: Mutex::new(1),
            ..Default::default()
        });
        let (events, receiver) = fmpsc::unbounded();
        *source.stream.lock().expect("lock") = Some(receiver);
        let (tx, mut rx) = mpsc::channel(8);
        let cancel = CancellationToken::new();

        let started = tokio::time::Instant::now();
        let task = tokio::spawn(stream_events(source.clone(), tx, cancel.clone()));
        events
            .unbounded_send(Ok(ClusterEvent::DesiredCreated {
                desired: desired("p1", &["a.com"]),
            }))
            .expect("send event");

        let event = rx.recv().await.expect("event after resubscribe");
        assert_eq!(event.key(), Some("p1"));
        // 1s and 2s after the failures, then 1s again once a stream was obtained
        assert_eq!(source.subscribe_calls.load(Ordering::SeqCst), 4);
        assert!(started.elapsed() >= INITIAL_BACKOFF * 4);

        cancel.cancel();
        task.await.expect("join");
    }
}
