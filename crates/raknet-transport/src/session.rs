//! # Session
//!
//! One peer's connection once the offline exchange is done. The session
//! state machine is:
//!
//! ```text
//!   OfflineHandshake1 ──Reply1──▶ OfflineHandshake2 ──Reply2──▶ Handshaking
//!        (Connector)                  (Connector)                   │
//!                                                 Request / Accepted / NewIncoming
//!                                                                   ▼
//!                       Disconnected ◀──Notification / timeout── Connected
//! ```
//!
//! The session is sans-IO: inbound bytes go in through [`Session::receive`]
//! (or the typed `handle_*` methods), outbound datagrams come out of
//! [`Session::drain_output`], and everything the application must see comes
//! out of [`Session::drain_events`]. Every call takes the current time.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::time::Duration;

use bytes::Bytes;
use quanta::Instant;

use crate::arq::{ReceiptId, ReceiveTracker, Recovery, ResendBuffer};
use crate::codec::triad_add;
use crate::config::SessionConfig;
use crate::datagram::{Datagram, DATAGRAM_HEADER_LEN};
use crate::error::{DisconnectReason, SessionError};
use crate::frame::{Frame, SplitInfo};
use crate::ordering::{Admission, OrderingEngine};
use crate::record::RecordSet;
use crate::reliability::Reliability;
use crate::rtt::{LatencyStats, RttTracker};
use crate::split::{split_payload, Fragment, ReassemblyBuffer, SplitIdGenerator};
use crate::stats::{RateCounter, SessionStats};
use crate::wire::{id, ConnectedMessage, Packet, UDP_HEADER_LEN};

/// Copies of the final disconnection notification.
pub const DISCONNECT_COPIES: usize = 3;

// ─── Session State ──────────────────────────────────────────────────────────

/// Connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// MTU probe sent, waiting for reply 1.
    OfflineHandshake1,
    /// Request 2 sent, waiting for reply 2.
    OfflineHandshake2,
    /// Connection request / accept in flight.
    Handshaking,
    Connected,
    /// Terminal.
    Disconnected,
}

/// Which side opened the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

/// Everything the application needs to hear about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Connected,
    Message { channel: u8, payload: Bytes },
    /// Every datagram carrying the message was acknowledged.
    Acknowledged(ReceiptId),
    /// The message will never be acknowledged.
    Lost(ReceiptId),
    /// Reported exactly once; nothing follows it.
    Disconnected(DisconnectReason),
}

#[derive(Debug)]
struct Outgoing {
    frame: Frame,
    receipt: Option<ReceiptId>,
}

// ─── Session ────────────────────────────────────────────────────────────────

/// Reliability engine and handshake state for one remote peer.
#[derive(Debug)]
pub struct Session {
    config: SessionConfig,
    role: Role,
    state: SessionState,
    local_guid: u64,
    remote_guid: u64,
    remote_address: SocketAddr,
    mtu: u16,
    created_at: Instant,
    last_receive_at: Instant,
    last_send_at: Instant,
    last_ping_at: Instant,
    send_sequence: u32,
    ordering: OrderingEngine,
    split_ids: SplitIdGenerator,
    reassembly: ReassemblyBuffer,
    resend: ResendBuffer,
    received: ReceiveTracker,
    rtt: RttTracker,
    queue: VecDeque<Outgoing>,
    output: VecDeque<Bytes>,
    events: VecDeque<SessionEvent>,
    /// Application messages that raced ahead of the final handshake frame.
    early: Vec<(u8, Bytes)>,
    next_receipt: ReceiptId,
    /// Receipt → frames still unacknowledged.
    receipts: HashMap<ReceiptId, u32>,
    stats: SessionStats,
    outbound_rate: RateCounter,
}

impl Session {
    fn new(
        config: SessionConfig,
        role: Role,
        local_guid: u64,
        remote_guid: u64,
        remote_address: SocketAddr,
        mtu: u16,
        now: Instant,
    ) -> Self {
        let channels = config.channels.max(1);
        Session {
            ordering: OrderingEngine::new(channels, config.max_ordering_queue, config.dedup_window),
            reassembly: ReassemblyBuffer::new(
                config.max_split_entries,
                config.max_split_count,
                config.split_timeout,
            ),
            resend: ResendBuffer::new(config.max_resend_buffer, config.max_retransmits),
            received: ReceiveTracker::new(config.dedup_window),
            rtt: RttTracker::new(config.initial_rto, config.rto_floor, config.rto_ceiling),
            role,
            state: SessionState::Handshaking,
            local_guid,
            remote_guid,
            remote_address,
            mtu,
            created_at: now,
            last_receive_at: now,
            last_send_at: now,
            last_ping_at: now,
            send_sequence: 0,
            split_ids: SplitIdGenerator::default(),
            queue: VecDeque::new(),
            output: VecDeque::new(),
            events: VecDeque::new(),
            early: Vec::new(),
            next_receipt: 0,
            receipts: HashMap::new(),
            stats: SessionStats::new(),
            outbound_rate: RateCounter::new(Duration::from_secs(1)),
            config,
        }
    }

    /// Initiator side after reply 2. The connection request is queued and
    /// flushed immediately.
    pub(crate) fn client(
        config: SessionConfig,
        local_guid: u64,
        remote_guid: u64,
        remote_address: SocketAddr,
        mtu: u16,
        now: Instant,
    ) -> Self {
        let mut session = Session::new(
            config,
            Role::Client,
            local_guid,
            remote_guid,
            remote_address,
            mtu,
            now,
        );
        let request = ConnectedMessage::ConnectionRequest {
            client_guid: local_guid,
            timestamp: session.timestamp(now),
            use_security: false,
        };
        match session.queue_control(&request, Reliability::ReliableOrdered) {
            Ok(()) => session.flush(now),
            Err(e) => session.fail(e),
        }
        session
    }

    /// Responder side, allocated when request 2 is accepted.
    pub(crate) fn server(
        config: SessionConfig,
        local_guid: u64,
        remote_guid: u64,
        remote_address: SocketAddr,
        mtu: u16,
        now: Instant,
    ) -> Self {
        Session::new(
            config,
            Role::Server,
            local_guid,
            remote_guid,
            remote_address,
            mtu,
            now,
        )
    }

    // ── Accessors ───────────────────────────────────────────────────────

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn is_connected(&self) -> bool {
        self.state == SessionState::Connected
    }

    pub fn is_closed(&self) -> bool {
        self.state == SessionState::Disconnected
    }

    pub fn local_guid(&self) -> u64 {
        self.local_guid
    }

    pub fn remote_guid(&self) -> u64 {
        self.remote_guid
    }

    pub fn remote_address(&self) -> SocketAddr {
        self.remote_address
    }

    pub fn mtu(&self) -> u16 {
        self.mtu
    }

    pub fn rto(&self) -> Duration {
        self.rtt.rto()
    }

    pub fn latency(&self) -> LatencyStats {
        self.rtt.latency()
    }

    pub fn stats(&self) -> SessionStats {
        let mut stats = self.stats.clone();
        stats.latency = self.rtt.latency();
        stats
    }

    /// Outbound bytes per second over the last second.
    pub fn send_rate(&self, now: Instant) -> f64 {
        self.outbound_rate.rate(now)
    }

    /// Datagrams awaiting acknowledgement.
    pub fn in_flight(&self) -> usize {
        self.resend.len()
    }

    /// Frames waiting to be packed into datagrams.
    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    pub fn drain_output(&mut self) -> impl Iterator<Item = Bytes> + '_ {
        self.output.drain(..)
    }

    pub fn drain_events(&mut self) -> impl Iterator<Item = SessionEvent> + '_ {
        self.events.drain(..)
    }

    /// Largest UDP payload the negotiated MTU leaves room for.
    fn datagram_limit(&self) -> usize {
        (self.mtu as usize).saturating_sub(UDP_HEADER_LEN)
    }

    /// Milliseconds since the session was created, as carried in pings and
    /// handshake timestamps.
    fn timestamp(&self, now: Instant) -> i64 {
        now.saturating_duration_since(self.created_at).as_millis() as i64
    }

    // ── Sending ─────────────────────────────────────────────────────────

    /// Queue an application message. Returns the receipt id for the
    /// ack-receipt kinds.
    pub fn send(
        &mut self,
        reliability: Reliability,
        channel: u8,
        payload: Bytes,
    ) -> Result<Option<ReceiptId>, SessionError> {
        self.ordering.check_channel(channel)?;
        if self.state != SessionState::Connected {
            return Err(SessionError::NotConnected);
        }
        if let Some(&first) = payload.first() {
            if id::is_connected_control(first) {
                return Err(SessionError::ReservedMessageId(first));
            }
        }
        let receipt = self.enqueue(reliability, channel, payload)?;
        self.stats.messages_sent += 1;
        Ok(receipt)
    }

    fn queue_control(
        &mut self,
        message: &ConnectedMessage,
        reliability: Reliability,
    ) -> Result<(), SessionError> {
        self.enqueue(reliability, 0, message.encode()).map(|_| ())
    }

    /// `None` when the payload fits in one frame, otherwise the fragment size.
    fn fragment_size(&self, reliability: Reliability, len: usize) -> Result<Option<usize>, SessionError> {
        let body = self.datagram_limit().saturating_sub(DATAGRAM_HEADER_LEN);
        if len + Frame::header_len(reliability, false) <= body {
            return Ok(None);
        }
        let fragment = body.saturating_sub(Frame::header_len(reliability, true)).max(1);
        let max = fragment * self.config.max_split_count as usize;
        if len > max {
            return Err(SessionError::MessageTooLarge { len, max });
        }
        Ok(Some(fragment))
    }

    fn enqueue(
        &mut self,
        reliability: Reliability,
        channel: u8,
        payload: Bytes,
    ) -> Result<Option<ReceiptId>, SessionError> {
        let fragment = self.fragment_size(reliability, payload.len())?;
        let order_index = self.ordering.assign(reliability, channel)?;
        let channel = if reliability.has_order_index() { channel } else { 0 };
        let receipt = reliability.requires_ack_receipt().then(|| {
            let id = self.next_receipt;
            self.next_receipt = self.next_receipt.wrapping_add(1);
            id
        });

        let parts = match fragment {
            None => vec![(payload, None)],
            Some(size) => {
                let pieces = split_payload(&payload, size);
                let count = pieces.len() as u32;
                let id = self.split_ids.next_id();
                pieces
                    .into_iter()
                    .enumerate()
                    .map(|(index, piece)| {
                        let split = SplitInfo {
                            count,
                            id,
                            index: index as u32,
                        };
                        (piece, Some(split))
                    })
                    .collect()
            }
        };

        if let Some(receipt) = receipt {
            self.receipts.insert(receipt, parts.len() as u32);
        }
        for (piece, split) in parts {
            let message_index = reliability
                .is_reliable()
                .then(|| self.ordering.next_message_index());
            self.queue.push_back(Outgoing {
                frame: Frame {
                    reliability,
                    channel,
                    message_index,
                    order_index,
                    split,
                    payload: piece,
                },
                receipt,
            });
        }
        Ok(receipt)
    }

    /// Emit pending ACKs/NACKs and pack queued frames into datagrams.
    pub fn flush(&mut self, now: Instant) {
        if self.state == SessionState::Disconnected {
            return;
        }
        self.flush_acknowledgements(now);
        self.pack(now);
    }

    fn flush_acknowledgements(&mut self, now: Instant) {
        if !self.received.has_pending() {
            return;
        }
        let mtu = self.datagram_limit();
        let acks = self.received.take_acks();
        for packet in acks.encode_chunks(id::ACK, mtu) {
            self.stats.acks_sent += 1;
            self.push_output(packet, now);
        }
        let nacks = self.received.take_nacks();
        for packet in nacks.encode_chunks(id::NACK, mtu) {
            self.stats.nacks_sent += 1;
            self.push_output(packet, now);
        }
    }

    fn pack(&mut self, now: Instant) {
        let limit = self.datagram_limit();
        while !self.queue.is_empty() {
            if self.resend.is_full() {
                tracing::trace!(
                    in_flight = self.resend.len(),
                    queued = self.queue.len(),
                    "resend buffer full, holding frames"
                );
                break;
            }
            let mut datagram = Datagram::new(self.send_sequence);
            let mut receipts = Vec::new();
            let mut len = DATAGRAM_HEADER_LEN;
            while let Some(next) = self.queue.front() {
                let frame_len = next.frame.encoded_len();
                if !datagram.frames.is_empty() && len + frame_len > limit {
                    break;
                }
                let Some(next) = self.queue.pop_front() else {
                    break;
                };
                len += frame_len;
                receipts.extend(next.receipt);
                datagram.frames.push(next.frame);
            }
            self.emit(datagram, receipts, now);
        }
    }

    fn emit(&mut self, datagram: Datagram, receipts: Vec<ReceiptId>, now: Instant) {
        let bytes = datagram.encode();
        if datagram.needs_recovery() {
            let resendable = datagram.frames.iter().any(|f| f.reliability.is_reliable());
            self.resend
                .insert(datagram.sequence, bytes.clone(), resendable, receipts, now);
        }
        tracing::trace!(
            seq = datagram.sequence,
            frames = datagram.frames.len(),
            len = bytes.len(),
            "datagram out"
        );
        self.send_sequence = triad_add(self.send_sequence, 1);
        self.push_output(bytes, now);
    }

    fn push_output(&mut self, bytes: Bytes, now: Instant) {
        self.stats.datagrams_sent += 1;
        self.stats.bytes_out += bytes.len() as u64;
        self.outbound_rate.record(now, bytes.len() as u64);
        self.last_send_at = now;
        self.output.push_back(bytes);
    }

    // ── Receiving ───────────────────────────────────────────────────────

    /// Decode and process raw bytes from the remote address. Undecodable
    /// input is dropped and counted.
    pub fn receive(&mut self, raw: Bytes, now: Instant) {
        match Packet::decode(raw) {
            Ok(packet) => self.handle_packet(packet, now),
            Err(e) => {
                self.stats.decode_errors += 1;
                tracing::debug!(addr = %self.remote_address, error = %e, "dropping undecodable datagram");
            }
        }
    }

    pub fn handle_packet(&mut self, packet: Packet, now: Instant) {
        match packet {
            Packet::Datagram(datagram) => self.handle_datagram(datagram, now),
            Packet::Ack(records) => self.handle_ack(&records, now),
            Packet::Nack(records) => self.handle_nack(&records, now),
            Packet::Offline(_) => self.violation("offline packet inside a session"),
        }
    }

    pub fn handle_datagram(&mut self, datagram: Datagram, now: Instant) {
        if self.state == SessionState::Disconnected {
            return;
        }
        self.last_receive_at = now;
        self.stats.datagrams_received += 1;
        self.stats.bytes_in += datagram.encoded_len() as u64;
        if !self.received.record(datagram.sequence) {
            self.stats.duplicates_dropped += 1;
            tracing::trace!(seq = datagram.sequence, "duplicate datagram");
            return;
        }
        for frame in datagram.frames {
            if let Err(e) = self.handle_frame(frame, now) {
                self.fail(e);
            }
            if self.state == SessionState::Disconnected {
                return;
            }
        }
    }

    fn handle_frame(&mut self, frame: Frame, now: Instant) -> Result<(), SessionError> {
        let reliable = frame.reliability.is_reliable();
        if reliable && !self.ordering.accept_message_index(frame.message_index.unwrap_or(0)) {
            self.stats.duplicates_dropped += 1;
            return Ok(());
        }

        let payload = match frame.split {
            None => frame.payload,
            Some(split) => match self.reassembly.insert(split, frame.payload, reliable, now)? {
                Fragment::Complete(payload) => payload,
                Fragment::Pending => return Ok(()),
                Fragment::Dropped => {
                    self.stats.stale_dropped += 1;
                    return Ok(());
                }
            },
        };

        let mut ready = Vec::new();
        match self.ordering.admit(
            frame.reliability,
            frame.channel,
            frame.order_index,
            payload,
            &mut ready,
        ) {
            Ok(Admission::Stale) => self.stats.stale_dropped += 1,
            Ok(_) => {}
            Err(SessionError::InvalidChannel { channel, .. }) => {
                tracing::debug!(channel, "frame on unknown channel");
                self.violation("frame on unknown channel");
            }
            Err(e) => return Err(e),
        }
        for (channel, payload) in ready {
            self.dispatch(channel, payload, now)?;
            if self.state == SessionState::Disconnected {
                break;
            }
        }
        Ok(())
    }

    fn dispatch(&mut self, channel: u8, payload: Bytes, now: Instant) -> Result<(), SessionError> {
        match ConnectedMessage::decode(&payload) {
            Ok(Some(message)) => self.handle_control(message, now),
            Ok(None) => self.deliver(channel, payload),
            Err(e) => {
                self.stats.decode_errors += 1;
                tracing::debug!(error = %e, "malformed control message");
                Ok(())
            }
        }
    }

    fn deliver(&mut self, channel: u8, payload: Bytes) -> Result<(), SessionError> {
        match self.state {
            SessionState::Connected => {
                self.stats.messages_delivered += 1;
                self.events.push_back(SessionEvent::Message { channel, payload });
            }
            SessionState::Handshaking => {
                if self.early.len() >= self.config.max_ordering_queue {
                    return Err(SessionError::OrderingQueueOverload);
                }
                self.early.push((channel, payload));
            }
            _ => {}
        }
        Ok(())
    }

    fn handle_control(&mut self, message: ConnectedMessage, now: Instant) -> Result<(), SessionError> {
        use ConnectedMessage as M;
        use SessionState as S;

        match (self.state, self.role, message) {
            (_, _, M::ConnectedPing { timestamp }) => {
                let pong = M::ConnectedPong {
                    ping_timestamp: timestamp,
                    pong_timestamp: self.timestamp(now),
                };
                self.queue_control(&pong, Reliability::Unreliable)?;
            }
            (_, _, M::ConnectedPong { ping_timestamp, .. }) => {
                self.sample_timestamp(ping_timestamp, now);
            }
            (_, _, M::DetectLostConnections) => {}
            (
                S::Handshaking,
                Role::Server,
                M::ConnectionRequest {
                    client_guid,
                    timestamp,
                    use_security,
                },
            ) => {
                if use_security {
                    return Err(SessionError::SecurityUnsupported);
                }
                if client_guid != self.remote_guid {
                    tracing::debug!(
                        expected = self.remote_guid,
                        got = client_guid,
                        "connection request guid differs from request 2"
                    );
                }
                let accepted = M::ConnectionRequestAccepted {
                    client_address: self.remote_address,
                    system_index: 0,
                    request_timestamp: timestamp,
                    accept_timestamp: self.timestamp(now),
                };
                self.queue_control(&accepted, Reliability::ReliableOrdered)?;
            }
            (
                S::Handshaking,
                Role::Client,
                M::ConnectionRequestAccepted {
                    request_timestamp,
                    accept_timestamp,
                    ..
                },
            ) => {
                self.sample_timestamp(request_timestamp, now);
                let incoming = M::NewIncomingConnection {
                    server_address: self.remote_address,
                    accept_timestamp,
                    timestamp: self.timestamp(now),
                };
                self.queue_control(&incoming, Reliability::ReliableOrdered)?;
                self.establish(now)?;
            }
            (S::Handshaking, Role::Server, M::NewIncomingConnection { .. }) => {
                self.establish(now)?;
            }
            (S::Handshaking | S::Connected, _, M::DisconnectionNotification) => {
                self.close(DisconnectReason::PeerClosed);
            }
            (state, _, message) => {
                tracing::debug!(?state, id = message.id(), "control message invalid for state");
                self.violation("control message invalid for state");
            }
        }
        Ok(())
    }

    fn establish(&mut self, now: Instant) -> Result<(), SessionError> {
        self.state = SessionState::Connected;
        self.last_ping_at = now;
        tracing::info!(
            addr = %self.remote_address,
            guid = self.remote_guid,
            mtu = self.mtu,
            role = ?self.role,
            "session connected"
        );
        self.events.push_back(SessionEvent::Connected);
        for (channel, payload) in std::mem::take(&mut self.early) {
            self.deliver(channel, payload)?;
        }
        Ok(())
    }

    /// Feed an echoed local timestamp into the RTT estimator.
    fn sample_timestamp(&mut self, echoed: i64, now: Instant) {
        let elapsed = self.timestamp(now) - echoed;
        if elapsed >= 0 {
            self.rtt.sample(Duration::from_millis(elapsed as u64));
        }
    }

    pub fn handle_ack(&mut self, records: &RecordSet, now: Instant) {
        if self.state == SessionState::Disconnected {
            return;
        }
        self.last_receive_at = now;
        self.stats.acks_received += 1;
        let acked = self.resend.acknowledge(records, now);
        for sample in acked.rtt_samples {
            self.rtt.sample(sample);
        }
        self.resolve_receipts(acked.receipts, true);
    }

    pub fn handle_nack(&mut self, records: &RecordSet, now: Instant) {
        if self.state == SessionState::Disconnected {
            return;
        }
        self.last_receive_at = now;
        self.stats.nacks_received += 1;
        match self.resend.negative_acknowledge(records, now) {
            Ok(recovery) => self.apply_recovery(recovery, now),
            Err(e) => self.fail(e),
        }
    }

    fn apply_recovery(&mut self, recovery: Recovery, now: Instant) {
        for bytes in recovery.resend {
            self.stats.retransmits += 1;
            self.push_output(bytes, now);
        }
        self.resolve_receipts(recovery.lost, false);
    }

    fn resolve_receipts(&mut self, receipts: Vec<ReceiptId>, delivered: bool) {
        for receipt in receipts {
            if !delivered {
                if self.receipts.remove(&receipt).is_some() {
                    self.events.push_back(SessionEvent::Lost(receipt));
                }
                continue;
            }
            let Some(remaining) = self.receipts.get_mut(&receipt) else {
                continue;
            };
            *remaining = remaining.saturating_sub(1);
            if *remaining == 0 {
                self.receipts.remove(&receipt);
                self.events.push_back(SessionEvent::Acknowledged(receipt));
            }
        }
    }

    // ── Timers & Teardown ───────────────────────────────────────────────

    /// Drive timers, retransmissions and keep-alives, then flush.
    pub fn tick(&mut self, now: Instant) {
        if self.state == SessionState::Disconnected {
            return;
        }
        if let Err(e) = self.check_timers(now) {
            self.fail(e);
            return;
        }
        self.flush(now);
    }

    fn check_timers(&mut self, now: Instant) -> Result<(), SessionError> {
        if self.state == SessionState::Handshaking
            && now.saturating_duration_since(self.created_at) > self.config.handshake_timeout
        {
            tracing::debug!(addr = %self.remote_address, "handshake timed out");
            return Err(SessionError::SessionTimeout);
        }
        if now.saturating_duration_since(self.last_receive_at) > self.config.liveness_timeout {
            tracing::debug!(addr = %self.remote_address, "peer went silent");
            return Err(SessionError::SessionTimeout);
        }
        self.reassembly.sweep(now)?;
        let recovery = self.resend.sweep(now, self.rtt.rto())?;
        self.apply_recovery(recovery, now);

        if self.state == SessionState::Connected {
            if now.saturating_duration_since(self.last_ping_at) >= self.config.ping_interval {
                let ping = ConnectedMessage::ConnectedPing {
                    timestamp: self.timestamp(now),
                };
                self.queue_control(&ping, Reliability::Unreliable)?;
                self.last_ping_at = now;
            } else if now.saturating_duration_since(self.last_send_at)
                >= self.config.keepalive_interval
                && self.queue.is_empty()
            {
                self.queue_control(&ConnectedMessage::DetectLostConnections, Reliability::Unreliable)?;
            }
        }
        Ok(())
    }

    /// Send a disconnection notification and release the session at once.
    ///
    /// Nothing is left to retransmit it, so the datagram goes out
    /// [`DISCONNECT_COPIES`] times under one sequence number; the peer's
    /// duplicate filter keeps all but the first copy that arrives.
    pub fn disconnect(&mut self, now: Instant) {
        if self.state == SessionState::Disconnected {
            return;
        }
        self.flush(now);
        let mut notification = Frame::new(
            Reliability::Reliable,
            ConnectedMessage::DisconnectionNotification.encode(),
        );
        notification.message_index = Some(self.ordering.next_message_index());
        let mut datagram = Datagram::new(self.send_sequence);
        datagram.frames.push(notification);
        self.send_sequence = triad_add(self.send_sequence, 1);
        let bytes = datagram.encode();
        for _ in 0..DISCONNECT_COPIES {
            self.push_output(bytes.clone(), now);
        }
        self.close(DisconnectReason::Closed);
    }

    fn violation(&mut self, what: &'static str) {
        self.stats.handshake_violations += 1;
        tracing::debug!(
            addr = %self.remote_address,
            state = ?self.state,
            error = %SessionError::HandshakeViolation(what),
            "discarding frame"
        );
    }

    fn fail(&mut self, error: SessionError) {
        self.close(DisconnectReason::Failed(error));
    }

    fn close(&mut self, reason: DisconnectReason) {
        if self.state == SessionState::Disconnected {
            return;
        }
        self.state = SessionState::Disconnected;
        self.queue.clear();
        self.resend.clear();
        self.reassembly.clear();
        self.ordering.clear();
        self.early.clear();

        let mut lost: Vec<ReceiptId> = self.receipts.drain().map(|(receipt, _)| receipt).collect();
        lost.sort_unstable();
        self.events.extend(lost.into_iter().map(SessionEvent::Lost));

        tracing::info!(addr = %self.remote_address, guid = self.remote_guid, %reason, "session closed");
        self.events.push_back(SessionEvent::Disconnected(reason));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quanta::Clock;

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    fn pair(config: SessionConfig, now: Instant) -> (Session, Session) {
        let client = Session::client(config.clone(), 1, 2, addr("10.0.0.2:19132"), 1400, now);
        let server = Session::server(config, 2, 1, addr("10.0.0.1:50000"), 1400, now);
        (client, server)
    }

    /// Deliver everything `from` has queued to `to`.
    fn pump(from: &mut Session, to: &mut Session, now: Instant) -> usize {
        let out: Vec<Bytes> = from.drain_output().collect();
        let n = out.len();
        for raw in out {
            to.receive(raw, now);
        }
        to.flush(now);
        n
    }

    fn settle(a: &mut Session, b: &mut Session, now: Instant) {
        for _ in 0..8 {
            let moved = pump(a, b, now) + pump(b, a, now);
            if moved == 0 {
                break;
            }
        }
    }

    fn connected_pair(config: SessionConfig, now: Instant) -> (Session, Session) {
        let (mut client, mut server) = pair(config, now);
        settle(&mut client, &mut server, now);
        assert!(client.is_connected());
        assert!(server.is_connected());
        client.drain_events().for_each(drop);
        server.drain_events().for_each(drop);
        (client, server)
    }

    fn messages(session: &mut Session) -> Vec<(u8, Bytes)> {
        session
            .drain_events()
            .filter_map(|e| match e {
                SessionEvent::Message { channel, payload } => Some((channel, payload)),
                _ => None,
            })
            .collect()
    }

    // ─── Handshake Tests ────────────────────────────────────────────────

    #[test]
    fn online_handshake_connects_both_sides() {
        let (clock, _mock) = Clock::mock();
        let (mut client, mut server) = pair(SessionConfig::default(), clock.now());
        assert_eq!(client.state(), SessionState::Handshaking);
        settle(&mut client, &mut server, clock.now());
        assert!(client.is_connected());
        assert!(server.is_connected());
        assert_eq!(client.drain_events().collect::<Vec<_>>(), vec![SessionEvent::Connected]);
        assert_eq!(server.drain_events().collect::<Vec<_>>(), vec![SessionEvent::Connected]);
    }

    #[test]
    fn send_before_connected_rejected() {
        let (clock, _mock) = Clock::mock();
        let (_, mut server) = pair(SessionConfig::default(), clock.now());
        assert_eq!(
            server.send(Reliability::Reliable, 0, Bytes::from_static(b"x")),
            Err(SessionError::NotConnected)
        );
    }

    #[test]
    fn replayed_handshake_frame_is_a_violation() {
        let (clock, _mock) = Clock::mock();
        let now = clock.now();
        let (mut client, mut server) = connected_pair(SessionConfig::default(), now);
        client
            .queue_control(
                &ConnectedMessage::ConnectionRequest {
                    client_guid: 1,
                    timestamp: 0,
                    use_security: false,
                },
                Reliability::ReliableOrdered,
            )
            .unwrap();
        client.flush(now);
        pump(&mut client, &mut server, now);
        assert!(server.is_connected());
        assert_eq!(server.stats().handshake_violations, 1);
        assert!(messages(&mut server).is_empty());
    }

    #[test]
    fn security_request_fails_server() {
        let (clock, _mock) = Clock::mock();
        let now = clock.now();
        let config = SessionConfig::default();
        let mut server = Session::server(config.clone(), 2, 1, addr("10.0.0.1:5"), 1400, now);
        let mut client = Session::new(config, Role::Client, 1, 2, addr("10.0.0.2:6"), 1400, now);
        client
            .queue_control(
                &ConnectedMessage::ConnectionRequest {
                    client_guid: 1,
                    timestamp: 0,
                    use_security: true,
                },
                Reliability::ReliableOrdered,
            )
            .unwrap();
        client.flush(now);
        pump(&mut client, &mut server, now);
        assert!(server.is_closed());
        assert_eq!(
            server.drain_events().last(),
            Some(SessionEvent::Disconnected(DisconnectReason::Failed(
                SessionError::SecurityUnsupported
            )))
        );
    }

    #[test]
    fn handshake_times_out() {
        let (clock, mock) = Clock::mock();
        let (mut client, _server) = pair(SessionConfig::default(), clock.now());
        mock.increment(Duration::from_secs(11));
        client.tick(clock.now());
        assert!(client.is_closed());
    }

    // ─── Data Path Tests ────────────────────────────────────────────────

    #[test]
    fn ordered_messages_delivered() {
        let (clock, _mock) = Clock::mock();
        let now = clock.now();
        let (mut client, mut server) = connected_pair(SessionConfig::default(), now);
        for i in 0..10u8 {
            client
                .send(Reliability::ReliableOrdered, 3, Bytes::from(vec![0x90, i]))
                .unwrap();
        }
        client.flush(now);
        pump(&mut client, &mut server, now);
        let got = messages(&mut server);
        assert_eq!(got.len(), 10);
        for (i, (channel, payload)) in got.iter().enumerate() {
            assert_eq!(*channel, 3);
            assert_eq!(payload[1], i as u8);
        }
    }

    #[test]
    fn large_message_is_split_and_reassembled() {
        let (clock, _mock) = Clock::mock();
        let now = clock.now();
        let (mut client, mut server) = connected_pair(SessionConfig::default(), now);
        let mut big = vec![0xa0u8; 5000];
        big[4999] = 0x01;
        client
            .send(Reliability::ReliableOrdered, 0, Bytes::from(big.clone()))
            .unwrap();
        client.flush(now);
        assert!(client.in_flight() > 1);
        pump(&mut client, &mut server, now);
        assert_eq!(messages(&mut server), vec![(0, Bytes::from(big))]);
    }

    #[test]
    fn oversized_message_rejected() {
        let (clock, _mock) = Clock::mock();
        let mut config = SessionConfig::default();
        config.max_split_count = 2;
        let (mut client, _server) = connected_pair(config, clock.now());
        let err = client
            .send(Reliability::Reliable, 0, Bytes::from(vec![0xa0; 4000]))
            .unwrap_err();
        assert!(matches!(err, SessionError::MessageTooLarge { len: 4000, .. }));
    }

    #[test]
    fn control_ids_rejected_as_payload() {
        let (clock, _mock) = Clock::mock();
        let now = clock.now();
        let (mut client, mut server) = connected_pair(SessionConfig::default(), now);
        for first in [0x00, 0x03, 0x04, 0x09, 0x10, 0x13, 0x15] {
            assert_eq!(
                client.send(Reliability::Reliable, 0, Bytes::from(vec![first, 0, 0, 0, 0, 0, 0, 0, 0])),
                Err(SessionError::ReservedMessageId(first))
            );
        }
        assert_eq!(client.queued(), 0);

        // Offline ids never reach the control path, so they stay usable.
        client
            .send(Reliability::Reliable, 0, Bytes::from_static(&[0x01, 0x02]))
            .unwrap();
        client.flush(now);
        pump(&mut client, &mut server, now);
        assert_eq!(messages(&mut server), vec![(0, Bytes::from_static(&[0x01, 0x02]))]);
    }

    #[test]
    fn invalid_channel_rejected() {
        let (clock, _mock) = Clock::mock();
        let (mut client, _server) = connected_pair(SessionConfig::default(), clock.now());
        assert_eq!(
            client.send(Reliability::ReliableOrdered, 32, Bytes::new()),
            Err(SessionError::InvalidChannel {
                channel: 32,
                channels: 32
            })
        );
    }

    #[test]
    fn ack_receipt_reported() {
        let (clock, _mock) = Clock::mock();
        let now = clock.now();
        let (mut client, mut server) = connected_pair(SessionConfig::default(), now);
        let receipt = client
            .send(Reliability::ReliableWithAckReceipt, 0, Bytes::from_static(b"\xa0hi"))
            .unwrap()
            .unwrap();
        client.flush(now);
        pump(&mut client, &mut server, now);
        pump(&mut server, &mut client, now);
        assert!(client
            .drain_events()
            .any(|e| e == SessionEvent::Acknowledged(receipt)));
        assert_eq!(client.in_flight(), 0);
    }

    #[test]
    fn lost_datagram_recovered_by_nack() {
        let (clock, _mock) = Clock::mock();
        let now = clock.now();
        let (mut client, mut server) = connected_pair(SessionConfig::default(), now);
        for i in 0..3u8 {
            client
                .send(Reliability::ReliableOrdered, 0, Bytes::from(vec![0xa0, i]))
                .unwrap();
            client.flush(now);
        }
        let mut out: Vec<Bytes> = client.drain_output().collect();
        assert_eq!(out.len(), 3);
        out.remove(1);
        for raw in out {
            server.receive(raw, now);
        }
        assert_eq!(messages(&mut server).len(), 1);
        server.flush(now);
        pump(&mut server, &mut client, now);
        assert_eq!(client.stats().retransmits, 1);
        pump(&mut client, &mut server, now);
        let got = messages(&mut server);
        assert_eq!(got.len(), 2);
        assert_eq!(got[0].1[1], 1);
        assert_eq!(got[1].1[1], 2);
    }

    #[test]
    fn duplicate_datagram_not_redelivered() {
        let (clock, _mock) = Clock::mock();
        let now = clock.now();
        let (mut client, mut server) = connected_pair(SessionConfig::default(), now);
        client
            .send(Reliability::Reliable, 0, Bytes::from_static(b"\xa0once"))
            .unwrap();
        client.flush(now);
        let out: Vec<Bytes> = client.drain_output().collect();
        server.receive(out[0].clone(), now);
        server.receive(out[0].clone(), now);
        assert_eq!(messages(&mut server).len(), 1);
        assert_eq!(server.stats().duplicates_dropped, 1);
    }

    // ─── Timer & Teardown Tests ─────────────────────────────────────────

    #[test]
    fn ping_sent_on_interval() {
        let (clock, mock) = Clock::mock();
        let (mut client, mut server) = connected_pair(SessionConfig::default(), clock.now());
        let before = client.latency().samples;
        mock.increment(Duration::from_millis(2600));
        client.tick(clock.now());
        pump(&mut client, &mut server, clock.now());
        mock.increment(Duration::from_millis(20));
        pump(&mut server, &mut client, clock.now());
        assert_eq!(client.latency().samples, before + 1);
        assert_eq!(client.latency().last_us, 20_000);
    }

    fn fragment(sequence: u32, message_index: u32, split: SplitInfo) -> Datagram {
        let mut frame = Frame::new(Reliability::Reliable, Bytes::from_static(b"\xa0part"));
        frame.message_index = Some(message_index);
        frame.split = Some(split);
        Datagram {
            sequence,
            frames: vec![frame],
        }
    }

    #[test]
    fn oversized_split_count_fails_session() {
        let (clock, _mock) = Clock::mock();
        let now = clock.now();
        let config = SessionConfig::default();
        let limit = config.max_split_count;
        let (_client, mut server) = connected_pair(config, now);
        let split = SplitInfo {
            count: limit + 1,
            id: 7,
            index: 0,
        };
        server.handle_datagram(fragment(100, 100, split), now);
        assert!(server.is_closed());
        assert_eq!(
            server.drain_events().last(),
            Some(SessionEvent::Disconnected(DisconnectReason::Failed(
                SessionError::SplitQueueOverload
            )))
        );
    }

    #[test]
    fn stale_reassembly_fails_session() {
        let (clock, mock) = Clock::mock();
        let mut config = SessionConfig::default();
        config.split_timeout = Duration::from_secs(2);
        let (mut client, mut server) = connected_pair(config, clock.now());
        let split = SplitInfo {
            count: 3,
            id: 7,
            index: 0,
        };
        server.handle_datagram(fragment(100, 100, split), clock.now());
        assert!(server.is_connected());

        // Keep the session alive so only the reassembly age can end it.
        for _ in 0..3 {
            mock.increment(Duration::from_secs(1));
            client.tick(clock.now());
            pump(&mut client, &mut server, clock.now());
            server.tick(clock.now());
        }
        assert!(server.is_closed());
        assert!(server.drain_events().any(|e| e
            == SessionEvent::Disconnected(DisconnectReason::Failed(
                SessionError::SplitQueueOverload
            ))));
    }

    #[test]
    fn liveness_timeout() {
        let (clock, mock) = Clock::mock();
        let (mut client, _server) = connected_pair(SessionConfig::default(), clock.now());
        mock.increment(Duration::from_secs(26));
        client.tick(clock.now());
        assert!(client.is_closed());
        let events: Vec<_> = client.drain_events().collect();
        assert!(events.contains(&SessionEvent::Disconnected(DisconnectReason::Failed(
            SessionError::SessionTimeout
        ))));
    }

    #[test]
    fn disconnect_notifies_peer_once() {
        let (clock, _mock) = Clock::mock();
        let now = clock.now();
        let (mut client, mut server) = connected_pair(SessionConfig::default(), now);
        client.disconnect(now);
        client.disconnect(now);
        assert!(client.is_closed());
        let closed: Vec<_> = client
            .drain_events()
            .filter(|e| matches!(e, SessionEvent::Disconnected(_)))
            .collect();
        assert_eq!(closed, vec![SessionEvent::Disconnected(DisconnectReason::Closed)]);

        pump(&mut client, &mut server, now);
        assert!(server.is_closed());
        assert_eq!(
            server.drain_events().last(),
            Some(SessionEvent::Disconnected(DisconnectReason::PeerClosed))
        );
    }

    #[test]
    fn disconnect_survives_losing_a_copy() {
        let (clock, _mock) = Clock::mock();
        let now = clock.now();
        let (mut client, mut server) = connected_pair(SessionConfig::default(), now);
        client.disconnect(now);
        let copies: Vec<Bytes> = client.drain_output().collect();
        assert_eq!(copies.len(), DISCONNECT_COPIES);
        assert!(copies.windows(2).all(|w| w[0] == w[1]));

        for raw in copies.into_iter().skip(1) {
            server.receive(raw, now);
        }
        assert!(server.is_closed());
        let closed = server
            .drain_events()
            .filter(|e| matches!(e, SessionEvent::Disconnected(_)))
            .count();
        assert_eq!(closed, 1);
    }

    #[test]
    fn nothing_delivered_after_disconnect() {
        let (clock, _mock) = Clock::mock();
        let now = clock.now();
        let (mut client, mut server) = connected_pair(SessionConfig::default(), now);
        client
            .send(Reliability::Reliable, 0, Bytes::from_static(b"\xa0late"))
            .unwrap();
        client.flush(now);
        server.disconnect(now);
        server.drain_events().for_each(drop);
        pump(&mut client, &mut server, now);
        assert_eq!(server.drain_events().count(), 0);
    }

    #[test]
    fn close_reports_pending_receipts_lost() {
        let (clock, _mock) = Clock::mock();
        let now = clock.now();
        let (mut client, _server) = connected_pair(SessionConfig::default(), now);
        let receipt = client
            .send(Reliability::ReliableWithAckReceipt, 0, Bytes::from_static(b"\xa0"))
            .unwrap()
            .unwrap();
        client.disconnect(now);
        let events: Vec<_> = client.drain_events().collect();
        assert_eq!(
            events,
            vec![
                SessionEvent::Lost(receipt),
                SessionEvent::Disconnected(DisconnectReason::Closed)
            ]
        );
    }
}
