//! Cyclic engine and live signal dispatch
//!
//! While the driver is cycling, one background task keeps every server
//! session alive, drives the protocols' `cycle()` and hands received CAN
//! frames to the registered signal subscribers.
//!
//! ```text
//!            ┌──────────────── every iteration ────────────────┐
//!            │ tester present (> interval since last)          │
//!            │ try_lock + cycle() per protocol  → DataPoolEvent│
//!            │ drain bus frames → SubscriberRegistry::dispatch │
//!            │ yield (or stop)                                 │
//!            └─────────────────────────────────────────────────┘
//! ```
//!
//! The engine only ever `try_lock`s a protocol. A protocol held by the
//! polling engine is skipped for that iteration.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use syde_core::{CanMessage, CanSignal, Content, ElementId, MuxType, SharedNode};
use tokio::sync::{broadcast, mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::{DriverError, DriverResult};
use crate::protocol::{DataPoolEvent, DiagProtocol};
use crate::transport::CanFrame;

/// What a subscriber receives for its signal
#[derive(Debug, Clone, PartialEq)]
pub enum SignalEvent {
    Value {
        element: ElementId,
        content: Content,
        /// Device receive time of the frame
        timestamp_us: u64,
    },
    /// The frame is too short for the signal or its multiplexer
    InvalidDlc { element: ElementId, dlc: u8 },
}

/// One subscriber of one CAN signal
#[derive(Debug, Clone)]
pub struct SignalRegistration {
    pub element: ElementId,
    pub signal: CanSignal,
    pub multiplexer: Option<CanSignal>,
    /// Decoded values take the type of this template
    pub template: Content,
    pub handler_id: Uuid,
    pub sink: mpsc::UnboundedSender<SignalEvent>,
}

/// Subscribers keyed by (CAN id, extended)
#[derive(Debug, Default)]
pub struct SubscriberRegistry {
    subscribers: HashMap<(u32, bool), Vec<SignalRegistration>>,
}

impl SubscriberRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `sink` for signal `signal_name` of `message`
    pub fn register(
        &mut self,
        element: ElementId,
        message: &CanMessage,
        signal_name: &str,
        template: Content,
        sink: mpsc::UnboundedSender<SignalEvent>,
    ) -> DriverResult<Uuid> {
        let signal = message.signal(signal_name).ok_or_else(|| {
            DriverError::Config(format!(
                "signal \"{}\" not in message \"{}\"",
                signal_name, message.name
            ))
        })?;

        let multiplexer = match signal.mux {
            MuxType::Multiplexed { .. } => match message.multiplexer() {
                Some(mux) => Some(mux.clone()),
                None => {
                    debug_assert!(false, "multiplexed signal without multiplexer");
                    error!(
                        message = %message.name,
                        signal = signal_name,
                        "Multiplexed signal without multiplexer in message"
                    );
                    return Err(DriverError::Config(format!(
                        "message \"{}\" has no multiplexer",
                        message.name
                    )));
                }
            },
            _ => None,
        };

        let handler_id = Uuid::new_v4();
        self.subscribers
            .entry((message.id, message.extended))
            .or_default()
            .push(SignalRegistration {
                element,
                signal: signal.clone(),
                multiplexer,
                template,
                handler_id,
                sink,
            });
        debug!(%element, message = %message.name, signal = signal_name, "Signal subscriber registered");
        Ok(handler_id)
    }

    /// Remove a subscriber; returns whether it existed
    pub fn unregister(&mut self, handler_id: Uuid) -> bool {
        let mut removed = false;
        for registrations in self.subscribers.values_mut() {
            let before = registrations.len();
            registrations.retain(|r| r.handler_id != handler_id);
            removed |= registrations.len() != before;
        }
        self.subscribers.retain(|_, r| !r.is_empty());
        removed
    }

    pub fn len(&self) -> usize {
        self.subscribers.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.subscribers.is_empty()
    }

    pub fn clear(&mut self) {
        self.subscribers.clear();
    }

    /// Deliver `frame` to every matching subscriber; returns the number of
    /// events sent
    pub fn dispatch(&self, frame: &CanFrame) -> usize {
        let Some(registrations) = self.subscribers.get(&(frame.id, frame.extended)) else {
            return 0;
        };

        let mut delivered = 0;
        for registration in registrations {
            let Some(event) = decode_registration(registration, frame) else {
                continue;
            };
            if registration.sink.send(event).is_ok() {
                delivered += 1;
            }
        }
        delivered
    }
}

fn decode_registration(registration: &SignalRegistration, frame: &CanFrame) -> Option<SignalEvent> {
    let invalid = SignalEvent::InvalidDlc {
        element: registration.element,
        dlc: frame.dlc,
    };

    if let (Some(mux), MuxType::Multiplexed { selector }) =
        (&registration.multiplexer, registration.signal.mux)
    {
        let Some(value) = extract_bits(&frame.data, frame.dlc, mux) else {
            return Some(invalid);
        };
        if value != u64::from(selector) {
            return None;
        }
    }

    match extract_bits(&frame.data, frame.dlc, &registration.signal) {
        Some(raw) => Some(SignalEvent::Value {
            element: registration.element,
            content: registration
                .template
                .from_raw(raw, registration.signal.bit_length),
            timestamp_us: frame.timestamp_us,
        }),
        None => Some(invalid),
    }
}

/// Raw value of `signal`, or `None` if it does not fit into `dlc` bytes
///
/// Intel signals count bits upwards from `start_bit`. Motorola signals start
/// at their least significant bit and continue in the preceding byte after
/// bit 7.
pub fn extract_bits(data: &[u8; 8], dlc: u8, signal: &CanSignal) -> Option<u64> {
    let length = usize::from(signal.bit_length);
    if length == 0 || length > 64 {
        return None;
    }
    let dlc = usize::from(dlc).min(data.len());
    let mut position = usize::from(signal.start_bit);
    let mut raw = 0u64;

    for i in 0..length {
        let (byte, bit) = (position / 8, position % 8);
        if byte >= dlc {
            return None;
        }
        raw |= u64::from((data[byte] >> bit) & 1) << i;

        if i + 1 == length {
            break;
        }
        position = match signal.byte_order {
            syde_core::ByteOrder::Little => position + 1,
            syde_core::ByteOrder::Big if bit == 7 => byte.checked_sub(1)? * 8,
            syde_core::ByteOrder::Big => position + 1,
        };
    }
    Some(raw)
}

/// Protocol driven by the engine
#[derive(Clone)]
pub struct CycledNode {
    pub node_index: usize,
    pub node: SharedNode,
    pub protocol: Arc<Mutex<DiagProtocol>>,
}

/// Inputs of the background task
pub struct EngineContext {
    pub nodes: Vec<CycledNode>,
    pub frames: broadcast::Receiver<CanFrame>,
    pub registry: Arc<RwLock<SubscriberRegistry>>,
    pub events: broadcast::Sender<DataPoolEvent>,
    pub tester_present_interval: Duration,
    pub cycle_yield: Duration,
}

/// Handle of the running cyclic task
pub struct CyclicEngine {
    stop_tx: watch::Sender<bool>,
    handle: Option<JoinHandle<()>>,
}

impl CyclicEngine {
    pub fn start(context: EngineContext) -> Self {
        let (stop_tx, stop_rx) = watch::channel(false);
        let handle = tokio::spawn(run(context, stop_rx));
        info!("Cyclic engine started");
        Self {
            stop_tx,
            handle: Some(handle),
        }
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Request a stop and wait up to `timeout`; the task is aborted if it
    /// does not finish in time
    pub async fn stop(&mut self, timeout: Duration) {
        let Some(mut handle) = self.handle.take() else {
            return;
        };
        let _ = self.stop_tx.send(true);
        match tokio::time::timeout(timeout, &mut handle).await {
            Ok(_) => info!("Cyclic engine stopped"),
            Err(_) => {
                warn!(timeout_ms = timeout.as_millis() as u64, "Cyclic engine did not stop in time");
                handle.abort();
            }
        }
    }
}

impl Drop for CyclicEngine {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            let _ = self.stop_tx.send(true);
            handle.abort();
        }
    }
}

async fn run(mut context: EngineContext, mut stop_rx: watch::Receiver<bool>) {
    // Per node, so a node skipped while locked is retried next iteration
    let mut last_tester_present = vec![Instant::now(); context.nodes.len()];

    loop {
        if *stop_rx.borrow() {
            break;
        }

        for (cycled, last_sent) in context.nodes.iter().zip(&mut last_tester_present) {
            if last_sent.elapsed() <= context.tester_present_interval {
                continue;
            }
            let Ok(protocol) = cycled.protocol.try_lock() else {
                continue;
            };
            if let Err(e) = protocol.tester_present().await {
                warn!(node = cycled.node_index, error = %e, "Tester present failed");
            }
            *last_sent = Instant::now();
        }

        for cycled in &context.nodes {
            let Ok(mut protocol) = cycled.protocol.try_lock() else {
                continue;
            };
            let order = protocol.endianness();
            let events = protocol.cycle();
            drop(protocol);

            for event in events {
                apply_event(cycled, &event, order);
                let _ = context.events.send(event);
            }
        }

        loop {
            match context.frames.try_recv() {
                Ok(frame) => {
                    context.registry.read().dispatch(&frame);
                }
                Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
                    warn!(skipped, "Bus frames dropped");
                }
                Err(_) => break,
            }
        }

        tokio::select! {
            changed = stop_rx.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            _ = tokio::time::sleep(context.cycle_yield) => {}
        }
    }
    debug!("Cyclic engine loop left");
}

fn apply_event(cycled: &CycledNode, event: &DataPoolEvent, order: syde_core::ByteOrder) {
    let id = event.element;
    let mut node = cycled.node.write();
    let Some(element) = node.element_mut(id.data_pool, id.list, id.element) else {
        debug!(element = %id, "Event for unknown element");
        return;
    };
    match element.value.decode(&event.data, order) {
        Ok(value) => {
            element.value = value;
            element.valid = true;
        }
        Err(e) => warn!(element = %id, error = %e, "Event payload does not match element"),
    }
}
