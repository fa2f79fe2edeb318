use geotrace_model::{EventEnvelope, TraceEvent};
use std::collections::BTreeSet;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::{debug, warn};

/// Ordered outward event stream of one session.
///
/// `traceroute-started` comes first, a hop's location update only follows
/// its discovery, and nothing follows the terminal event. Events that would
/// break that order are dropped.
#[derive(Debug)]
pub struct SessionEmitter {
    tx: Option<UnboundedSender<EventEnvelope>>,
    seq: u64,
    started: bool,
    closed: bool,
    announced: BTreeSet<u32>,
}

impl SessionEmitter {
    pub fn new(tx: UnboundedSender<EventEnvelope>) -> Self {
        Self::with_sender(Some(tx))
    }

    pub fn channel() -> (Self, UnboundedReceiver<EventEnvelope>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self::new(tx), rx)
    }

    /// An emitter nobody listens to; one-shot traces only want the result.
    pub fn detached() -> Self {
        Self::with_sender(None)
    }

    fn with_sender(tx: Option<UnboundedSender<EventEnvelope>>) -> Self {
        Self {
            tx,
            seq: 0,
            started: false,
            closed: false,
            announced: BTreeSet::new(),
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Sequence number of the last event emitted.
    pub fn last_seq(&self) -> u64 {
        self.seq
    }

    /// Returns whether the event was accepted into the stream.
    pub fn emit(&mut self, event: TraceEvent) -> bool {
        if self.closed {
            debug!(event = event.name(), "event after terminal dropped");
            return false;
        }

        let in_order = match &event {
            TraceEvent::Started { .. } => !self.started,
            TraceEvent::HopDiscovered(hop) => {
                self.started && {
                    self.announced.insert(hop.hop_number);
                    true
                }
            }
            TraceEvent::HopLocationUpdated(hop) => {
                self.started && self.announced.contains(&hop.hop_number)
            }
            TraceEvent::Diagnostic { .. } => self.started,
            TraceEvent::Completed { .. } | TraceEvent::Error { .. } => true,
        };
        if !in_order {
            warn!(event = event.name(), "out of order event dropped");
            return false;
        }

        match event {
            TraceEvent::Started { .. } => self.started = true,
            ref terminal if terminal.is_terminal() => self.closed = true,
            _ => {}
        }

        self.seq += 1;
        if let Some(tx) = &self.tx {
            let envelope = EventEnvelope {
                seq: self.seq,
                event,
            };
            if tx.send(envelope).is_err() {
                debug!(seq = self.seq, "event receiver gone");
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use geotrace_model::Hop;

    fn hop(number: u32) -> Hop {
        Hop {
            hop_number: number,
            ip: "8.8.8.8".to_string(),
            hostname: "8.8.8.8".to_string(),
            latency_ms: 1,
            location: None,
        }
    }

    #[test]
    fn sequence_numbers_increase_from_one() {
        let (mut emitter, mut rx) = SessionEmitter::channel();
        emitter.emit(TraceEvent::Started {
            target: "8.8.8.8".to_string(),
        });
        emitter.emit(TraceEvent::HopDiscovered(hop(1)));
        emitter.emit(TraceEvent::Completed { hop_count: 1 });

        let seqs: Vec<u64> = std::iter::from_fn(|| rx.try_recv().ok())
            .map(|envelope| envelope.seq)
            .collect();
        assert_eq!(seqs, vec![1, 2, 3]);
        assert_eq!(emitter.last_seq(), 3);
    }

    #[test]
    fn location_before_discovery_is_dropped() {
        let (mut emitter, _rx) = SessionEmitter::channel();
        emitter.emit(TraceEvent::Started {
            target: "x".to_string(),
        });
        assert!(!emitter.emit(TraceEvent::HopLocationUpdated(hop(4))));
        assert!(emitter.emit(TraceEvent::HopDiscovered(hop(4))));
        assert!(emitter.emit(TraceEvent::HopLocationUpdated(hop(4))));
    }

    #[test]
    fn nothing_follows_terminal() {
        let (mut emitter, _rx) = SessionEmitter::channel();
        assert!(emitter.emit(TraceEvent::Error {
            error: "target required".to_string(),
        }));
        assert!(emitter.is_closed());
        assert!(!emitter.emit(TraceEvent::Started {
            target: "x".to_string(),
        }));
    }

    #[test]
    fn hops_need_a_started_stream() {
        let mut emitter = SessionEmitter::detached();
        assert!(!emitter.emit(TraceEvent::HopDiscovered(hop(1))));
        assert_eq!(emitter.last_seq(), 0);
    }
}
