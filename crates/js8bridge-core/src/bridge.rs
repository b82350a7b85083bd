//! [`Bridge`] – the orchestrator wiring JS8Call to the bus.
//!
//! A single task owns the [`ReassemblyEngine`] and the [`CommandQueue`] and
//! multiplexes three sources with `tokio::select!`:
//!
//! 1. **Radio events** – activity frames go through the reassembly engine;
//!    every other category is published on its mapped topic.
//! 2. **Bus commands** – payloads on `<prefix>/tx/command` are parsed and
//!    enqueued.
//! 3. **Tick** – releases the next due command and, separately, sweeps idle
//!    reassembly buffers.
//!
//! Because one task owns both structures, a buffer is finalised by either the
//! final frame or the sweep, never both. No per-message failure stops the
//! loop: it is logged, counted in [`BridgeStats`], and processing continues.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use js8bridge_core::{Bridge, BridgeConfig};
//! use js8bridge_middleware::{EventBus, Js8Link, LinkConfig};
//!
//! # async fn example() -> Result<(), js8bridge_types::BridgeError> {
//! let bus = Arc::new(EventBus::default());
//! let radio = Arc::new(Js8Link::spawn(LinkConfig::new("127.0.0.1:2442")));
//! let (_stop, shutdown) = tokio::sync::watch::channel(false);
//! Bridge::new(BridgeConfig::default(), radio, bus).run(shutdown).await
//! # }
//! ```

use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use js8bridge_middleware::{BusLink, RadioLink};
use js8bridge_types::{ActivityFragment, BridgeError, Command, RadioEvent, ReassemblyResult};
use serde_json::{Value, json};
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::command_queue::CommandQueue;
use crate::reassembly::ReassemblyEngine;
use crate::stats::BridgeStats;
use crate::topic::TopicMapper;

// ─────────────────────────────────────────────────────────────────────────────
// Configuration
// ─────────────────────────────────────────────────────────────────────────────

/// Plain-value settings consumed by [`Bridge`].
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// First level of every topic, e.g. `"js8"`.
    pub topic_prefix: String,
    /// Idle time after which an open conversation is flushed as incomplete.
    pub reassembly_timeout: Duration,
    /// Minimum gap between two commands sent to JS8Call.
    pub tx_delay: Duration,
    /// Period of the release/sweep tick.
    pub tick_interval: Duration,
    /// `None` for an unbounded command queue.
    pub command_queue_capacity: Option<usize>,
    /// Publish the whole event object on dynamic topics instead of `value`.
    pub publish_full_event: bool,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            topic_prefix: "js8".to_string(),
            reassembly_timeout: Duration::from_secs(120),
            tx_delay: Duration::from_secs(15),
            tick_interval: Duration::from_millis(250),
            command_queue_capacity: None,
            publish_full_event: false,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Bridge
// ─────────────────────────────────────────────────────────────────────────────

pub struct Bridge {
    config: BridgeConfig,
    topics: TopicMapper,
    radio: Arc<dyn RadioLink>,
    bus: Arc<dyn BusLink>,
    engine: ReassemblyEngine,
    queue: CommandQueue,
    stats: Arc<BridgeStats>,
}

impl Bridge {
    pub fn new(config: BridgeConfig, radio: Arc<dyn RadioLink>, bus: Arc<dyn BusLink>) -> Self {
        let topics = TopicMapper::new(config.topic_prefix.clone());
        let engine = ReassemblyEngine::new(config.reassembly_timeout);
        let queue = CommandQueue::new(config.tx_delay, config.command_queue_capacity);
        Self {
            config,
            topics,
            radio,
            bus,
            engine,
            queue,
            stats: Arc::new(BridgeStats::new()),
        }
    }

    /// Shared handle to the bridge counters.
    pub fn stats(&self) -> Arc<BridgeStats> {
        Arc::clone(&self.stats)
    }

    pub fn topics(&self) -> &TopicMapper {
        &self.topics
    }

    pub fn pending_commands(&self) -> usize {
        self.queue.len()
    }

    pub fn open_conversations(&self) -> usize {
        self.engine.open_buffers()
    }

    // -------------------------------------------------------------------------
    // Main loop
    // -------------------------------------------------------------------------

    /// Run until `shutdown` flips to `true` (or its sender is dropped), or
    /// until either collaborator stream ends.
    ///
    /// # Errors
    ///
    /// Returns an error only if subscribing to the command topic fails.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Result<(), BridgeError> {
        let mut events = self.radio.event_stream().await;
        let mut commands = self.bus.command_stream(&self.topics.command()).await?;

        let mut ticker = tokio::time::interval(self.config.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        self.publish(&self.topics.status(), json!({ "state": "online" })).await;
        info!(
            prefix = %self.topics.prefix(),
            tx_delay_secs = self.config.tx_delay.as_secs_f64(),
            reassembly_timeout_secs = self.config.reassembly_timeout.as_secs_f64(),
            "bridge running"
        );

        if !*shutdown.borrow() {
            loop {
                tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                    event = events.next() => match event {
                        Some(raw) => self.handle_radio_event(raw, Instant::now()).await,
                        None => {
                            warn!("radio event stream ended");
                            break;
                        }
                    },
                    command = commands.next() => match command {
                        Some(payload) => {
                            self.handle_bus_command(payload).await;
                            self.release_due(Instant::now()).await;
                        }
                        None => {
                            warn!("bus command stream ended");
                            break;
                        }
                    },
                    _ = ticker.tick() => {
                        let now = Instant::now();
                        self.release_due(now).await;
                        self.sweep_expired(now).await;
                    }
                }
            }
        }

        self.shutdown().await;
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Inbound flow
    // -------------------------------------------------------------------------

    /// Route one decoded object from the radio link.
    pub async fn handle_radio_event(&mut self, raw: Value, now: Instant) {
        self.stats.record_event();
        let event = match RadioEvent::from_json(raw) {
            Ok(event) => event,
            Err(e) => {
                warn!(error = %e, "discarding malformed radio event");
                self.stats.record_malformed();
                return;
            }
        };

        if event.is_activity() {
            // Frames of a directed message carry its ID; JS8Call delivers the
            // whole message again as RX.DIRECTED.
            if let Some(id) = event.params.get("ID").filter(|id| !id.is_null()) {
                debug!(id = %id, "skipping activity frame of a directed message");
                return;
            }
            let fragment = ActivityFragment::from_event(&event);
            if let Some(result) = self.engine.ingest(fragment, now) {
                self.publish_result(result).await;
            }
            return;
        }

        // JS8Call reassembles directed messages itself; surface them with the
        // other complete messages as well as on their own topic.
        if event.is_directed() {
            self.publish_result(ReassemblyResult::from_directed(&event)).await;
        }

        let topic = self.topics.for_category(&event.kind);
        debug!(category = %event.kind, topic = %topic, "forwarding event");
        let payload = if self.config.publish_full_event {
            event.to_json()
        } else {
            event.value
        };
        if self.publish(&topic, payload).await {
            self.stats.record_passthrough();
        }
    }

    /// Flush every conversation idle for longer than the reassembly timeout.
    pub async fn sweep_expired(&mut self, now: Instant) {
        for result in self.engine.sweep(now) {
            self.publish_result(result).await;
        }
    }

    async fn publish_result(&mut self, result: ReassemblyResult) {
        let topic = if result.complete {
            info!(key = %result.key, fragments = result.fragments, text = %result.text, "message complete");
            self.topics.complete()
        } else {
            info!(key = %result.key, fragments = result.fragments, text = %result.text, "message timed out incomplete");
            self.topics.incomplete()
        };
        if self.publish(&topic, result.to_json()).await {
            self.stats.record_result(result.complete);
        }
    }

    // -------------------------------------------------------------------------
    // Outbound flow
    // -------------------------------------------------------------------------

    /// Parse and enqueue one payload received on the command topic.
    pub async fn handle_bus_command(&mut self, payload: Value) {
        let command = match Command::from_bus_payload(payload) {
            Ok(command) => command,
            Err(e) => {
                warn!(error = %e, "discarding malformed command");
                self.stats.record_malformed();
                return;
            }
        };

        debug!(command_id = %command.id, "command queued");
        self.stats.record_enqueued();
        if let Some(dropped) = self.queue.enqueue(command) {
            warn!(
                command_id = %dropped.id,
                pending = self.queue.len(),
                "command queue full; dropped oldest command"
            );
            self.stats.record_dropped();
            self.publish(&self.topics.dropped(), dropped.payload).await;
        }
    }

    /// Send the head command if the link is up and the delay has elapsed.
    pub async fn release_due(&mut self, now: Instant) {
        if self.queue.is_empty() || !self.radio.is_connected() {
            return;
        }
        let previous = self.queue.last_release();
        let Some(command) = self.queue.poll_release(now) else {
            return;
        };

        match self.radio.send(&command.payload).await {
            Ok(()) => {
                info!(command_id = %command.id, pending = self.queue.len(), "command sent to JS8Call");
                self.stats.record_released();
            }
            Err(e) => {
                warn!(command_id = %command.id, error = %e, "command send failed; keeping it at the head of the queue");
                self.stats.record_send_failure();
                self.queue.requeue_front(command, previous);
            }
        }
    }

    // -------------------------------------------------------------------------
    // Helpers
    // -------------------------------------------------------------------------

    /// Publish and report whether it succeeded.
    async fn publish(&self, topic: &str, payload: Value) -> bool {
        match self.bus.publish(topic, payload).await {
            Ok(_) => true,
            Err(e) => {
                warn!(topic = %topic, error = %e, "bus publish failed");
                self.stats.record_publish_failure();
                false
            }
        }
    }

    async fn shutdown(&mut self) {
        let buffers = self.engine.clear();
        let commands = self.queue.clear();
        let stats = self.stats.snapshot();
        info!(
            discarded_buffers = buffers,
            discarded_commands = commands,
            stats = ?stats,
            "bridge stopped"
        );
        self.publish(
            &self.topics.status(),
            json!({ "state": "offline", "stats": stats }),
        )
        .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use futures_util::stream::{self, BoxStream};
    use js8bridge_middleware::{EventBus, TopicSubscriber};
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use tokio::sync::mpsc;

    /// Radio link double that records sent commands.
    struct FakeRadio {
        connected: AtomicBool,
        failures_left: AtomicUsize,
        sent: Mutex<Vec<(Instant, Value)>>,
        events: tokio::sync::Mutex<Option<mpsc::Receiver<Value>>>,
    }

    impl FakeRadio {
        fn new() -> (Arc<Self>, mpsc::Sender<Value>) {
            let (tx, rx) = mpsc::channel(64);
            let radio = Arc::new(Self {
                connected: AtomicBool::new(true),
                failures_left: AtomicUsize::new(0),
                sent: Mutex::new(Vec::new()),
                events: tokio::sync::Mutex::new(Some(rx)),
            });
            (radio, tx)
        }

        fn sent(&self) -> Vec<(Instant, Value)> {
            self.sent.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl RadioLink for FakeRadio {
        async fn send(&self, command: &Value) -> Result<(), BridgeError> {
            if self.failures_left.load(Ordering::SeqCst) > 0 {
                self.failures_left.fetch_sub(1, Ordering::SeqCst);
                return Err(BridgeError::Transport("broken pipe".to_string()));
            }
            self.sent.lock().unwrap().push((Instant::now(), command.clone()));
            Ok(())
        }

        fn is_connected(&self) -> bool {
            self.connected.load(Ordering::SeqCst)
        }

        async fn event_stream(&self) -> BoxStream<'static, Value> {
            match self.events.lock().await.take() {
                Some(rx) => stream::unfold(rx, |mut rx| async move {
                    rx.recv().await.map(|v| (v, rx))
                })
                .boxed(),
                None => stream::empty().boxed(),
            }
        }
    }

    fn config() -> BridgeConfig {
        BridgeConfig {
            topic_prefix: "js8".to_string(),
            reassembly_timeout: Duration::from_secs(10),
            tx_delay: Duration::from_secs(2),
            tick_interval: Duration::from_millis(100),
            command_queue_capacity: None,
            publish_full_event: false,
        }
    }

    fn make_bridge(config: BridgeConfig) -> (Bridge, Arc<FakeRadio>, mpsc::Sender<Value>, Arc<EventBus>, TopicSubscriber) {
        let (radio, events_tx) = FakeRadio::new();
        let bus = Arc::new(EventBus::default());
        let watcher = bus.subscribe_filter("js8/#").unwrap();
        let bridge = Bridge::new(config, radio.clone(), bus.clone());
        (bridge, radio, events_tx, bus, watcher)
    }

    fn activity(offset: i64, text: &str, is_final: bool) -> Value {
        json!({
            "type": "RX.ACTIVITY",
            "value": "",
            "params": { "OFFSET": offset, "TEXT": text, "FINAL": is_final, "SNR": -8 }
        })
    }

    // ── Inbound flow ─────────────────────────────────────────────────────────

    #[tokio::test]
    async fn fragments_reassemble_into_complete_message() {
        let (mut bridge, _radio, _tx, _bus, mut watcher) = make_bridge(config());
        let now = Instant::now();

        bridge.handle_radio_event(activity(1, "CQ D", false), now).await;
        assert_eq!(bridge.open_conversations(), 1);
        bridge.handle_radio_event(activity(1, "E1", true), now).await;

        let message = watcher.recv().await.unwrap();
        assert_eq!(message.topic, "js8/rx/complete");
        assert_eq!(message.payload["text"], "CQ DE1");
        assert_eq!(message.payload["key"], "1");
        assert_eq!(message.payload["complete"], true);
        assert_eq!(bridge.open_conversations(), 0);
        assert_eq!(bridge.stats().snapshot().complete_published, 1);
    }

    #[tokio::test]
    async fn idle_conversation_is_published_incomplete() {
        let (mut bridge, _radio, _tx, _bus, mut watcher) = make_bridge(config());
        let t0 = Instant::now();

        bridge.handle_radio_event(activity(2, "HELLO", false), t0).await;
        bridge.sweep_expired(t0 + Duration::from_secs(5)).await;
        assert_eq!(bridge.open_conversations(), 1);

        bridge.sweep_expired(t0 + Duration::from_secs(11)).await;
        let message = watcher.recv().await.unwrap();
        assert_eq!(message.topic, "js8/rx/incomplete");
        assert_eq!(message.payload["text"], "HELLO");
        assert_eq!(message.payload["key"], "2");
        assert_eq!(message.payload["complete"], false);
        assert_eq!(bridge.stats().snapshot().incomplete_published, 1);
    }

    #[tokio::test]
    async fn other_categories_publish_value_unchanged() {
        let (mut bridge, _radio, _tx, _bus, mut watcher) = make_bridge(config());
        let event = json!({ "type": "RIG.FREQ", "value": { "freq": 7074000 } });

        bridge.handle_radio_event(event.clone(), Instant::now()).await;
        bridge.handle_radio_event(event, Instant::now()).await;

        for _ in 0..2 {
            let message = watcher.recv().await.unwrap();
            assert_eq!(message.topic, "js8/rig/freq");
            assert_eq!(message.payload, json!({ "freq": 7074000 }));
        }
        assert_eq!(bridge.stats().snapshot().passthrough_published, 2);
    }

    #[tokio::test]
    async fn full_event_option_publishes_whole_object() {
        let mut cfg = config();
        cfg.publish_full_event = true;
        let (mut bridge, _radio, _tx, _bus, mut watcher) = make_bridge(cfg);
        let event = json!({ "type": "RIG.PTT", "value": "on", "params": { "PTT": true } });

        bridge.handle_radio_event(event.clone(), Instant::now()).await;

        let message = watcher.recv().await.unwrap();
        assert_eq!(message.topic, "js8/rig/ptt");
        assert_eq!(message.payload, event);
    }

    #[tokio::test]
    async fn empty_category_goes_to_catch_all() {
        let (mut bridge, _radio, _tx, _bus, mut watcher) = make_bridge(config());
        bridge.handle_radio_event(json!({ "type": "", "value": 1 }), Instant::now()).await;

        let message = watcher.recv().await.unwrap();
        assert_eq!(message.topic, "js8/unknown");
        assert_eq!(message.payload, json!(1));
    }

    #[tokio::test]
    async fn directed_message_publishes_complete_and_own_topic() {
        let (mut bridge, _radio, _tx, _bus, mut watcher) = make_bridge(config());
        let event = json!({
            "type": "RX.DIRECTED",
            "value": "W1AW: KN4CRD SNR -10 ♢",
            "params": { "ORIGIN": "W1AW", "ID": 123 }
        });
        bridge.handle_radio_event(event, Instant::now()).await;

        let complete = watcher.recv().await.unwrap();
        assert_eq!(complete.topic, "js8/rx/complete");
        assert_eq!(complete.payload["key"], "W1AW");
        assert_eq!(complete.payload["text"], "W1AW: KN4CRD SNR -10 ♢");

        let own = watcher.recv().await.unwrap();
        assert_eq!(own.topic, "js8/rx/directed");
        assert_eq!(own.payload, json!("W1AW: KN4CRD SNR -10 ♢"));
    }

    #[tokio::test]
    async fn directed_message_is_completed_exactly_once() {
        let (mut bridge, _radio, _tx, bus, _watcher) = make_bridge(config());
        let mut all = bus.subscribe();
        let now = Instant::now();

        for (text, is_final) in [("W1AW: KN4CRD ", false), ("SNR -10 ♢", true)] {
            bridge
                .handle_radio_event(
                    json!({
                        "type": "RX.ACTIVITY",
                        "value": "",
                        "params": { "OFFSET": 1500, "TEXT": text, "FINAL": is_final, "ID": 5 }
                    }),
                    now,
                )
                .await;
        }
        assert_eq!(bridge.open_conversations(), 0);

        bridge
            .handle_radio_event(
                json!({
                    "type": "RX.DIRECTED",
                    "value": "W1AW: KN4CRD SNR -10 ♢",
                    "params": { "ORIGIN": "W1AW", "ID": 5 }
                }),
                now,
            )
            .await;

        let mut topics = Vec::new();
        while let Ok(message) = all.try_recv() {
            topics.push(message.topic);
        }
        assert_eq!(topics, ["js8/rx/complete", "js8/rx/directed"]);
        assert_eq!(bridge.stats().snapshot().complete_published, 1);
    }

    #[tokio::test]
    async fn activity_with_null_id_is_still_reassembled() {
        let (mut bridge, _radio, _tx, _bus, mut watcher) = make_bridge(config());
        let event = json!({
            "type": "RX.ACTIVITY",
            "value": "",
            "params": { "OFFSET": 900, "TEXT": "QRZ?", "FINAL": true, "ID": null }
        });
        bridge.handle_radio_event(event, Instant::now()).await;

        let message = watcher.recv().await.unwrap();
        assert_eq!(message.topic, "js8/rx/complete");
        assert_eq!(message.payload["text"], "QRZ?");
    }

    #[tokio::test(start_paused = true)]
    async fn echoed_command_category_is_not_fed_back() {
        let (bridge, radio, events_tx, bus, mut watcher) = make_bridge(config());
        let stats = bridge.stats();
        let (stop_tx, stop_rx) = watch::channel(false);
        let handle = tokio::spawn(bridge.run(stop_rx));
        wait_for_subscribers(&bus, 2).await;

        let online = watcher.recv().await.unwrap();
        assert_eq!(online.payload["state"], "online");

        events_tx
            .send(json!({ "type": "TX.COMMAND", "value": { "message": "LOOP" } }))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;

        let message = watcher.recv().await.unwrap();
        assert_eq!(message.topic, "js8/unknown");
        assert_eq!(stats.snapshot().commands_enqueued, 0);
        assert!(radio.sent().is_empty());

        stop_tx.send(true).unwrap();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn malformed_event_is_counted_and_dropped() {
        let (mut bridge, _radio, _tx, bus, _watcher) = make_bridge(config());
        let mut all = bus.subscribe();

        bridge.handle_radio_event(json!({ "value": "no type" }), Instant::now()).await;
        bridge.handle_radio_event(json!([1, 2, 3]), Instant::now()).await;

        assert!(all.try_recv().is_err());
        let snap = bridge.stats().snapshot();
        assert_eq!(snap.events_received, 2);
        assert_eq!(snap.malformed_inputs, 2);
    }

    // ── Outbound flow ────────────────────────────────────────────────────────

    #[tokio::test]
    async fn bounded_queue_drops_oldest_and_signals() {
        let mut cfg = config();
        cfg.command_queue_capacity = Some(2);
        let (mut bridge, radio, _tx, _bus, mut watcher) = make_bridge(cfg);
        radio.connected.store(false, Ordering::SeqCst);

        for n in 1..=3 {
            bridge.handle_bus_command(json!({ "type": "TX.SEND_MESSAGE", "value": format!("M{n}") })).await;
        }

        assert_eq!(bridge.pending_commands(), 2);
        let dropped = watcher.recv().await.unwrap();
        assert_eq!(dropped.topic, "js8/tx/dropped");
        assert_eq!(dropped.payload["value"], "M1");
        assert_eq!(bridge.stats().snapshot().commands_dropped, 1);
    }

    #[tokio::test]
    async fn disconnected_radio_holds_commands_until_link_returns() {
        let (mut bridge, radio, _tx, _bus, _watcher) = make_bridge(config());
        radio.connected.store(false, Ordering::SeqCst);
        bridge.handle_bus_command(json!({ "message": "CQ CQ" })).await;

        let t0 = Instant::now();
        bridge.release_due(t0).await;
        assert!(radio.sent().is_empty());
        assert_eq!(bridge.pending_commands(), 1);

        radio.connected.store(true, Ordering::SeqCst);
        bridge.release_due(t0 + Duration::from_secs(30)).await;
        let sent = radio.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].1["type"], "TX.SEND_MESSAGE");
        assert_eq!(sent[0].1["value"], "CQ CQ");
    }

    #[tokio::test]
    async fn failed_send_keeps_command_at_head() {
        let (mut bridge, radio, _tx, _bus, _watcher) = make_bridge(config());
        radio.failures_left.store(1, Ordering::SeqCst);
        bridge.handle_bus_command(json!({ "type": "A" })).await;
        bridge.handle_bus_command(json!({ "type": "B" })).await;

        let t0 = Instant::now();
        bridge.release_due(t0).await;
        assert!(radio.sent().is_empty());
        assert_eq!(bridge.pending_commands(), 2);

        // The failed attempt did not consume the delay.
        bridge.release_due(t0 + Duration::from_millis(100)).await;
        let sent = radio.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].1["type"], "A");
        assert_eq!(bridge.stats().snapshot().send_failures, 1);
    }

    #[tokio::test]
    async fn malformed_command_is_discarded() {
        let (mut bridge, _radio, _tx, _bus, _watcher) = make_bridge(config());
        bridge.handle_bus_command(json!("just a string")).await;
        bridge.handle_bus_command(json!({ "nothing": "useful" })).await;
        assert_eq!(bridge.pending_commands(), 0);
        assert_eq!(bridge.stats().snapshot().malformed_inputs, 2);
    }

    // ── Full loop ────────────────────────────────────────────────────────────

    async fn wait_for_subscribers(bus: &EventBus, count: usize) {
        while bus.receiver_count() < count {
            tokio::task::yield_now().await;
        }
    }

    #[tokio::test(start_paused = true)]
    async fn burst_of_commands_is_paced_in_order() {
        let (bridge, radio, _events_tx, bus, _watcher) = make_bridge(config());
        let (stop_tx, stop_rx) = watch::channel(false);
        let handle = tokio::spawn(bridge.run(stop_rx));
        // The watcher plus the bridge's command subscription.
        wait_for_subscribers(&bus, 2).await;

        let t0 = Instant::now();
        for n in 1..=3 {
            bus.publish_to("js8/tx/command", json!({ "type": "TX.SEND_MESSAGE", "value": format!("M{n}") }));
        }

        tokio::time::sleep(Duration::from_secs(5)).await;
        let sent = radio.sent();
        assert_eq!(sent.len(), 3);

        let values: Vec<&str> = sent.iter().map(|(_, v)| v["value"].as_str().unwrap()).collect();
        assert_eq!(values, ["M1", "M2", "M3"]);

        let offsets: Vec<Duration> = sent.iter().map(|(at, _)| *at - t0).collect();
        assert!(offsets[0] < Duration::from_millis(100), "first release at {:?}", offsets[0]);
        for pair in offsets.windows(2) {
            assert!(pair[1] - pair[0] >= Duration::from_secs(2), "gap {:?}", pair[1] - pair[0]);
        }
        assert!(offsets[2] < Duration::from_millis(4200), "third release at {:?}", offsets[2]);

        stop_tx.send(true).unwrap();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn command_flood_is_enqueued_without_loss() {
        let (bridge, radio, _events_tx, bus, _watcher) = make_bridge(config());
        radio.connected.store(false, Ordering::SeqCst);
        let stats = bridge.stats();
        let (stop_tx, stop_rx) = watch::channel(false);
        let handle = tokio::spawn(bridge.run(stop_rx));
        wait_for_subscribers(&bus, 2).await;

        // More than the bus capacity, published before the bridge gets a turn.
        for n in 0..300 {
            bus.publish_to("js8/tx/command", json!({ "message": format!("M{n}") }));
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(stats.snapshot().commands_enqueued, 300);

        radio.connected.store(true, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(5)).await;
        let sent = radio.sent();
        assert_eq!(sent[0].1["value"], "M0");
        assert_eq!(sent[1].1["value"], "M1");

        stop_tx.send(true).unwrap();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn run_loop_sweeps_idle_conversations() {
        let (bridge, _radio, events_tx, bus, mut watcher) = make_bridge(config());
        let (stop_tx, stop_rx) = watch::channel(false);
        let handle = tokio::spawn(bridge.run(stop_rx));
        wait_for_subscribers(&bus, 2).await;

        let online = watcher.recv().await.unwrap();
        assert_eq!(online.topic, "js8/bridge/status");
        assert_eq!(online.payload["state"], "online");

        events_tx.send(activity(1500, "HELLO ", false)).await.unwrap();
        tokio::time::sleep(Duration::from_secs(12)).await;

        let message = watcher.recv().await.unwrap();
        assert_eq!(message.topic, "js8/rx/incomplete");
        assert_eq!(message.payload["text"], "HELLO ");
        assert_eq!(message.payload["snr"], -8);

        stop_tx.send(true).unwrap();
        handle.await.unwrap().unwrap();

        let offline = watcher.recv().await.unwrap();
        assert_eq!(offline.topic, "js8/bridge/status");
        assert_eq!(offline.payload["state"], "offline");
        assert_eq!(offline.payload["stats"]["incomplete_published"], 1);
    }

    #[tokio::test]
    async fn run_stops_when_radio_stream_ends() {
        let (bridge, _radio, events_tx, _bus, _watcher) = make_bridge(config());
        let (_stop_tx, stop_rx) = watch::channel(false);
        drop(events_tx);
        bridge.run(stop_rx).await.unwrap();
    }
}
