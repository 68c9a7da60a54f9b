// AutoFollow — Link Node
//
// Protocol engine for one wireless peer relationship. Stop-and-wait flow
// control: at most one unacknowledged outgoing packet, enforced by the
// `awaiting_response` gate. The transmitter drives the header sequence,
// the receiver acknowledges; WAVE is the only teardown signal and is
// terminal for whichever side observes it.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::{bail, Result};

use crate::events::{AckMessage, Header, Role};
use crate::link::packet::Packet;
use crate::link::transport::{LinkHandler, Transport};

/// Outcome of one step of the exchange sequence, evaluated against the
/// header just received.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NextExchange {
    pub header: Header,
    pub ack: AckMessage,
    /// Set when the received header was a WAVE: the session is over.
    pub ends_session: bool,
}

/// The transition table. On the very first exchange (`just_started`) both
/// sides emit the defaults without consulting the received header.
pub fn advance(received: Header, just_started: bool) -> NextExchange {
    let defaults = NextExchange {
        header: Header::Handshake,
        ack: AckMessage::ReceivedHandshake,
        ends_session: false,
    };
    if just_started {
        return defaults;
    }
    match received {
        Header::Handshake => NextExchange {
            header: Header::TriggerPing,
            ack: AckMessage::ReceivedHandshake,
            ends_session: false,
        },
        Header::TriggerPing => NextExchange {
            header: Header::TriggerPing,
            ack: AckMessage::ReceivedPing,
            ends_session: false,
        },
        Header::Wave => NextExchange {
            header: Header::Handshake,
            ack: AckMessage::ReceivedWave,
            ends_session: true,
        },
        other => {
            log::warn!("unable to determine next exchange (received {:?})", other);
            defaults
        }
    }
}

pub struct LinkNode<T: Transport> {
    role: Role,
    peer: [u8; 6],
    ack_required: bool,
    transport: T,

    handler: Mutex<Option<Arc<dyn LinkHandler>>>,
    started: AtomicBool,

    /// Flow-control gate: true blocks further sends until the peer's
    /// response (or the staleness timeout) releases it.
    awaiting_response: AtomicBool,
    awaiting_since: Mutex<Option<Instant>>,
    just_started: AtomicBool,
    paused: AtomicBool,

    outgoing: Mutex<Packet>,
    incoming: Mutex<Packet>,
    staged_payload: Mutex<Option<String>>,
    booted_at: Instant,
}

impl<T: Transport> LinkNode<T> {
    pub fn new(transport: T, role: Role, peer: [u8; 6], ack_required: bool) -> Self {
        Self {
            role,
            peer,
            ack_required,
            transport,
            handler: Mutex::new(None),
            started: AtomicBool::new(false),
            // The transmitter opens the conversation; the receiver waits.
            awaiting_response: AtomicBool::new(role == Role::Receiver),
            awaiting_since: Mutex::new(None),
            just_started: AtomicBool::new(true),
            paused: AtomicBool::new(false),
            outgoing: Mutex::new(Packet::default()),
            incoming: Mutex::new(Packet::default()),
            staged_payload: Mutex::new(None),
            booted_at: Instant::now(),
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn is_transmitter(&self) -> bool {
        self.role == Role::Transmitter
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    /// Bind the protocol event consumer. Must happen before `start()`.
    pub fn bind_handler(&self, handler: Arc<dyn LinkHandler>) {
        *self.handler.lock().unwrap() = Some(handler);
    }

    /// Mark the node ready for its communication loop. Fails if no event
    /// handler is bound; that is a build-time wiring mistake, not a
    /// condition worth retrying.
    pub fn start(&self) -> Result<()> {
        if self.handler.lock().unwrap().is_none() {
            bail!("link node not started: no event handler bound");
        }
        self.started.store(true, Ordering::SeqCst);
        log::info!(
            "link node up: role {:?}, peer {}",
            self.role,
            format_mac(&self.peer)
        );
        Ok(())
    }

    // -- flow control ------------------------------------------------------

    pub fn ready_to_transmit(&self) -> bool {
        !self.awaiting_response.load(Ordering::SeqCst)
    }

    fn close_flow_gate(&self) {
        self.awaiting_response.store(true, Ordering::SeqCst);
        *self.awaiting_since.lock().unwrap() = Some(Instant::now());
    }

    fn open_flow_gate(&self) {
        self.awaiting_response.store(false, Ordering::SeqCst);
        *self.awaiting_since.lock().unwrap() = None;
    }

    /// Release a flow-control gate that has been closed longer than
    /// `timeout` (a lost ack must not deadlock the session). Returns true
    /// if the gate was released.
    pub fn release_stale_gate(&self, timeout: Duration) -> bool {
        if self.ready_to_transmit() {
            return false;
        }
        let mut since = self.awaiting_since.lock().unwrap();
        match *since {
            Some(closed_at) if closed_at.elapsed() >= timeout => {
                *since = None;
                self.awaiting_response.store(false, Ordering::SeqCst);
                true
            }
            _ => false,
        }
    }

    // -- cooperative cancellation -----------------------------------------

    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
    }

    pub fn unpause(&self) {
        self.paused.store(false, Ordering::SeqCst);
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    // -- transmission ------------------------------------------------------

    /// Queue text to ride in the next outgoing packet instead of the
    /// default uptime stamp.
    pub fn stage_payload(&self, text: &str) {
        *self.staged_payload.lock().unwrap() = Some(text.to_owned());
    }

    fn next_payload(&self) -> String {
        self.staged_payload
            .lock()
            .unwrap()
            .take()
            .unwrap_or_else(|| self.booted_at.elapsed().as_millis().to_string())
    }

    /// Rebuild the outgoing packet from the transition table and the
    /// header just received. Clears `just_started` exactly once, after
    /// both the header and the ack were chosen under suppression.
    fn build_outgoing(&self) -> Packet {
        let received = self.incoming.lock().unwrap().header;
        let just_started = self.just_started.swap(false, Ordering::SeqCst);
        let next = advance(received, just_started);
        if next.ends_session {
            self.pause();
        }
        let pkt = Packet::new(next.header, next.ack, &self.next_payload());
        *self.outgoing.lock().unwrap() = pkt;
        pkt
    }

    pub fn outgoing_header(&self) -> Header {
        self.outgoing.lock().unwrap().header
    }

    /// Build and send the next packet. A successful hand-off to the
    /// transport closes the flow gate when explicit acks are required.
    pub fn transmit(&self) -> Result<()> {
        let pkt = self.build_outgoing();
        log::info!(
            "tx: header {:?}, ack {:?}, payload '{}'",
            pkt.header,
            pkt.ack,
            pkt.payload_text()
        );
        self.transport.send(&pkt.encode())?;
        if self.ack_required {
            self.close_flow_gate();
        }
        Ok(())
    }

    /// One iteration of the send side: transmit, and on a transport error
    /// re-register the peer so the next cycle can retry. Never aborts the
    /// node; per-message failure is transient by policy.
    pub fn transmit_cycle(&self) {
        if let Err(e) = self.transmit() {
            log::warn!("transmission failed: {e}");
            if let Err(e) = self.transport.reregister_peer() {
                log::warn!("peer re-registration failed: {e}");
            }
        }
    }

    // -- reception ---------------------------------------------------------

    /// Store a freshly received frame. Runs in transport-callback context:
    /// decode, overwrite the incoming slot, nothing else. Returns whether
    /// the processing task should be woken.
    pub fn on_receive(&self, frame: &[u8]) -> bool {
        match Packet::decode(frame) {
            Ok(pkt) => {
                *self.incoming.lock().unwrap() = pkt;
                true
            }
            Err(e) => {
                log::warn!("dropping undecodable frame: {e}");
                false
            }
        }
    }

    /// Transport confirmation of the previous send. Fire-and-wait: when
    /// explicit acks are required the gate closes regardless of success;
    /// only the peer's response (or staleness) reopens it.
    pub fn on_sent(&self, success: bool) {
        if !success {
            log::debug!("transport reported unacknowledged delivery");
        }
        if self.ack_required {
            self.close_flow_gate();
        }
    }

    /// Dispatch the incoming packet to the bound handler, then release the
    /// flow gate so this node becomes eligible to send again.
    pub fn process_incoming(&self) {
        let pkt = *self.incoming.lock().unwrap();
        log::info!(
            "rx: header {:?}, ack {:?}, payload '{}'",
            pkt.header,
            pkt.ack,
            pkt.payload_text()
        );
        let handler = self.handler.lock().unwrap().clone();
        match handler {
            Some(handler) => {
                let payload = pkt.payload_text();
                match pkt.header {
                    Header::Handshake => handler.on_handshake(&payload),
                    Header::Wave => handler.on_wave(&payload),
                    Header::TriggerPing => handler.on_ping(&payload),
                    Header::Ack => {
                        log::warn!("no consumer for bare ack header, ignoring")
                    }
                }
            }
            None => log::error!("cannot process packet: no event handler bound"),
        }
        self.open_flow_gate();
    }

    /// Session teardown: deregister the peer. Called by the supervising
    /// owner once the worker tasks have observed `paused` and exited.
    pub fn shutdown(&self) {
        if let Err(e) = self.transport.close() {
            log::warn!("peer deregistration failed: {e}");
        }
        log::info!("link node shut down, peer {}", format_mac(&self.peer));
    }
}

pub fn format_mac(mac: &[u8; 6]) -> String {
    format!(
        "{:02X}:{:02X}:{:02X}:{:02X}:{:02X}:{:02X}",
        mac[0], mac[1], mac[2], mac[3], mac[4], mac[5]
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct MockState {
        // Pre-loaded error messages; empty string means the send succeeds.
        send_script: Mutex<VecDeque<Option<String>>>,
        sent_frames: Mutex<Vec<Vec<u8>>>,
        reregisters: AtomicUsize,
        closed: AtomicBool,
    }

    #[derive(Clone, Default)]
    struct MockTransport(Arc<MockState>);

    impl MockTransport {
        fn fail_next(&self, n: usize) {
            let mut script = self.0.send_script.lock().unwrap();
            for _ in 0..n {
                script.push_back(Some("radio offline".into()));
            }
        }
    }

    impl Transport for MockTransport {
        fn send(&self, frame: &[u8]) -> Result<()> {
            match self.0.send_script.lock().unwrap().pop_front().flatten() {
                Some(msg) => bail!(msg),
                None => {
                    self.0.sent_frames.lock().unwrap().push(frame.to_vec());
                    Ok(())
                }
            }
        }

        fn reregister_peer(&self) -> Result<()> {
            self.0.reregisters.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn close(&self) -> Result<()> {
            self.0.closed.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    #[derive(Default)]
    struct RecordingHandler {
        calls: Mutex<Vec<&'static str>>,
    }

    impl LinkHandler for RecordingHandler {
        fn on_handshake(&self, _: &str) {
            self.calls.lock().unwrap().push("handshake");
        }
        fn on_wave(&self, _: &str) {
            self.calls.lock().unwrap().push("wave");
        }
        fn on_ping(&self, _: &str) {
            self.calls.lock().unwrap().push("ping");
        }
    }

    fn node(role: Role, ack_required: bool) -> (LinkNode<MockTransport>, MockTransport) {
        let transport = MockTransport::default();
        let node = LinkNode::new(transport.clone(), role, [0xAA; 6], ack_required);
        (node, transport)
    }

    fn feed(node: &LinkNode<MockTransport>, header: Header, ack: AckMessage) {
        assert!(node.on_receive(&Packet::new(header, ack, "t").encode()));
    }

    #[test]
    fn transition_table_matches_exchange_rules() {
        use AckMessage::*;
        use Header::*;
        let cases = [
            (Handshake, TriggerPing, ReceivedHandshake, false),
            (TriggerPing, TriggerPing, ReceivedPing, false),
            (Wave, Handshake, ReceivedWave, true),
            (Ack, Handshake, ReceivedHandshake, false),
        ];
        for (received, header, ack, ends) in cases {
            let next = advance(received, false);
            assert_eq!(next.header, header, "received {:?}", received);
            assert_eq!(next.ack, ack, "received {:?}", received);
            assert_eq!(next.ends_session, ends, "received {:?}", received);
        }
    }

    #[test]
    fn first_exchange_is_suppressed_once() {
        for received in [Header::Handshake, Header::TriggerPing, Header::Wave] {
            let next = advance(received, true);
            assert_eq!(next.header, Header::Handshake);
            assert_eq!(next.ack, AckMessage::ReceivedHandshake);
            assert!(!next.ends_session);
        }

        // Through the node: the first transmit ignores the incoming header,
        // the second consults it.
        let (node, _) = node(Role::Transmitter, false);
        feed(&node, Header::TriggerPing, AckMessage::ReceivedPing);
        node.transmit().unwrap();
        assert_eq!(node.outgoing_header(), Header::Handshake);
        node.transmit().unwrap();
        assert_eq!(node.outgoing_header(), Header::TriggerPing);
    }

    #[test]
    fn wave_pauses_both_sides_monotonically() {
        let (node, _) = node(Role::Transmitter, false);
        node.bind_handler(Arc::new(RecordingHandler::default()));
        node.transmit().unwrap(); // clear just_started
        feed(&node, Header::Wave, AckMessage::ReceivedPing);
        assert!(!node.is_paused());
        node.transmit().unwrap();
        assert!(node.is_paused());
        // Further activity never resets the terminal state.
        node.process_incoming();
        assert!(node.is_paused());
    }

    #[test]
    fn stop_and_wait_allows_one_outstanding_packet() {
        let (node, _) = node(Role::Transmitter, true);
        node.bind_handler(Arc::new(RecordingHandler::default()));
        assert!(node.ready_to_transmit());
        node.transmit().unwrap();
        assert!(!node.ready_to_transmit());
        // The transport's send confirmation does not reopen the gate.
        node.on_sent(true);
        assert!(!node.ready_to_transmit());
        // Only processing the peer's response does.
        feed(&node, Header::Handshake, AckMessage::ReceivedHandshake);
        node.process_incoming();
        assert!(node.ready_to_transmit());
    }

    #[test]
    fn receiver_starts_gated_transmitter_starts_open() {
        let (rx, _) = node(Role::Receiver, true);
        assert!(!rx.ready_to_transmit());
        let (tx, _) = node(Role::Transmitter, true);
        assert!(tx.ready_to_transmit());
    }

    #[test]
    fn send_failures_reregister_each_cycle_then_recover() {
        let (node, transport) = node(Role::Transmitter, false);
        transport.fail_next(3);
        for _ in 0..3 {
            node.transmit_cycle();
        }
        assert_eq!(transport.0.reregisters.load(Ordering::SeqCst), 3);
        assert!(transport.0.sent_frames.lock().unwrap().is_empty());

        // Transport recovered: the next cycle goes through unimpeded.
        node.transmit_cycle();
        assert_eq!(transport.0.reregisters.load(Ordering::SeqCst), 3);
        assert_eq!(transport.0.sent_frames.lock().unwrap().len(), 1);
        assert!(!node.is_paused());
    }

    #[test]
    fn stale_flow_gate_is_released_after_timeout() {
        let (node, _) = node(Role::Transmitter, true);
        node.transmit().unwrap();
        assert!(!node.ready_to_transmit());
        assert!(!node.release_stale_gate(Duration::from_secs(3600)));
        assert!(node.release_stale_gate(Duration::ZERO));
        assert!(node.ready_to_transmit());
    }

    #[test]
    fn dispatch_routes_headers_to_the_bound_handler() {
        let (node, _) = node(Role::Receiver, true);
        let handler = Arc::new(RecordingHandler::default());
        node.bind_handler(handler.clone());

        for (header, ack) in [
            (Header::Handshake, AckMessage::ReceivedHandshake),
            (Header::TriggerPing, AckMessage::ReceivedPing),
            (Header::Wave, AckMessage::ReceivedWave),
            (Header::Ack, AckMessage::ReceivedHandshake),
        ] {
            feed(&node, header, ack);
            node.process_incoming();
        }
        assert_eq!(
            *handler.calls.lock().unwrap(),
            vec!["handshake", "ping", "wave"]
        );
        // Processing always reopens the gate, even for the ignored header.
        assert!(node.ready_to_transmit());
    }

    #[test]
    fn start_requires_a_bound_handler() {
        let (node, _) = node(Role::Transmitter, false);
        assert!(node.start().is_err());
        node.bind_handler(Arc::new(RecordingHandler::default()));
        assert!(node.start().is_ok());
    }

    #[test]
    fn staged_payload_rides_the_next_packet_only() {
        let (node, transport) = node(Role::Transmitter, false);
        node.stage_payload("L 12.4in avg 12.1");
        node.transmit().unwrap();
        node.transmit().unwrap();
        let frames = transport.0.sent_frames.lock().unwrap();
        let first = Packet::decode(&frames[0]).unwrap();
        let second = Packet::decode(&frames[1]).unwrap();
        assert_eq!(first.payload_text(), "L 12.4in avg 12.1");
        assert_ne!(second.payload_text(), "L 12.4in avg 12.1");
    }

    #[test]
    fn undecodable_frames_do_not_wake_the_processor() {
        let (node, _) = node(Role::Receiver, true);
        assert!(!node.on_receive(&[0xFF, 0xFF, 0, 0]));
    }
}
