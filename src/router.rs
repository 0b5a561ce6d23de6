//! # Router
//!
//! Ties the socket, the session table, both pipelines and the bus together.
//!
//! ## Receive Path
//! ```text
//! recv ──▶ LoginRequest::parse ──┬─ login ──▶ session lookup/create ──▶ process_login ─┐
//!                                └─ encrypted ─▶ session lock ──▶ InboundPipeline ─────┴─▶ bus
//! ```
//! Each datagram is handled on its own task. Datagrams for one client serialise
//! on that client's session lock; different clients proceed in parallel.
//!
//! ## Send Path
//! Workers queue [`SubPacket`]s per client. Every flush interval the queues are
//! drained through the [`OutboundPipeline`], one datagram at a time, and the
//! datagram is written only after the session lock is released.
//!
//! ## Failure Handling
//! Per-datagram errors are counted and logged, never propagated to other
//! sessions. Only socket setup and configuration errors escape [`Router::run`].

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::BytesMut;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinSet;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info, instrument, trace, warn};

use crate::bus::{PacketBus, ReplyReceiver, RoutedPacket};
use crate::config::{RouterConfig, HEADER_SIZE};
use crate::core::codec::BitCodec;
use crate::core::packet::{SubPacket, MAX_SUBPACKET_SIZE};
use crate::error::{ErrorCategory, ProtocolError, Result};
use crate::protocol::inbound::{InboundKind, InboundPipeline, InboundResult};
use crate::protocol::login::LoginRequest;
use crate::protocol::outbound::OutboundPipeline;
use crate::protocol::session::{
    session_cipher_key, ByteOffsetAdjustment, DecryptOutcome, KeyAdjustment, NoAdjustment, Session,
    SessionKeyProvider,
};
use crate::transport::session_table::{SessionTable, SharedSession};
use crate::transport::udp::UdpEndpoint;
use crate::utils::metrics::{Metrics, Timer};

/// Per-client outbound backlog
type OutboundQueues = HashMap<SocketAddr, VecDeque<SubPacket>>;

pub struct Router {
    config: RouterConfig,
    endpoint: UdpEndpoint,
    sessions: SessionTable,
    queues: Mutex<OutboundQueues>,
    inbound: InboundPipeline,
    outbound: OutboundPipeline,
    keys: Arc<dyn SessionKeyProvider>,
    adjustment: Arc<dyn KeyAdjustment>,
    bus: Arc<dyn PacketBus>,
    metrics: Arc<Metrics>,
}

impl Router {
    /// Bind the configured address and build a router around it.
    pub async fn bind(
        config: RouterConfig,
        codec: BitCodec,
        keys: Arc<dyn SessionKeyProvider>,
        bus: Arc<dyn PacketBus>,
        metrics: Arc<Metrics>,
    ) -> Result<Self> {
        config.validate_strict()?;
        let endpoint = UdpEndpoint::bind(
            &config.server.bind_address,
            config.server.recv_buffer_size,
            metrics.clone(),
        )
        .await?;
        Ok(Self::new(config, endpoint, codec, keys, bus, metrics))
    }

    pub fn new(
        config: RouterConfig,
        endpoint: UdpEndpoint,
        codec: BitCodec,
        keys: Arc<dyn SessionKeyProvider>,
        bus: Arc<dyn PacketBus>,
        metrics: Arc<Metrics>,
    ) -> Self {
        let adjustment: Arc<dyn KeyAdjustment> = match config.session.first_login_key_adjustment {
            Some(adjust) => Arc::new(ByteOffsetAdjustment::from(adjust)),
            None => Arc::new(NoAdjustment),
        };

        Self {
            sessions: SessionTable::new(config.server.max_sessions),
            queues: Mutex::new(HashMap::new()),
            inbound: InboundPipeline::new(codec.clone()),
            outbound: OutboundPipeline::with_limit(
                codec,
                config.outbound.max_subpackets_per_datagram,
            ),
            config,
            endpoint,
            keys,
            adjustment,
            bus,
            metrics,
        }
    }

    /// Replace the key adjustment chosen from the config.
    pub fn with_key_adjustment(mut self, adjustment: Arc<dyn KeyAdjustment>) -> Self {
        self.adjustment = adjustment;
        self
    }

    pub fn config(&self) -> &RouterConfig {
        &self.config
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.endpoint.local_addr()
    }

    pub fn sessions(&self) -> &SessionTable {
        &self.sessions
    }

    pub fn metrics(&self) -> &Arc<Metrics> {
        &self.metrics
    }

    /// Number of sub-packets waiting for `addr`.
    pub async fn queued(&self, addr: &SocketAddr) -> usize {
        self.queues.lock().await.get(addr).map_or(0, VecDeque::len)
    }

    /// Route one received datagram. Returns how many sub-packets were forwarded.
    pub async fn handle_datagram(&self, addr: SocketAddr, mut datagram: BytesMut) -> Result<usize> {
        if datagram.len() < HEADER_SIZE {
            return Err(ProtocolError::InputTruncated {
                needed: HEADER_SIZE,
                available: datagram.len(),
            });
        }

        match LoginRequest::parse(&datagram)? {
            Some(login) => self.handle_login(addr, &datagram, &login).await,
            None => self.handle_encrypted(addr, &mut datagram).await,
        }
    }

    #[instrument(level = "debug", skip_all, fields(client = %addr, character = login.character_id))]
    async fn handle_login(
        &self,
        addr: SocketAddr,
        datagram: &[u8],
        login: &LoginRequest,
    ) -> Result<usize> {
        // Resolved before the table lock so a slow provider stalls only this login
        let material = self.keys.session_key(login.character_id)?;
        let key = session_cipher_key(&material, self.adjustment.as_ref());
        let (shared, created, evicted) = self
            .sessions
            .get_or_insert_with(addr, || {
                Ok::<_, ProtocolError>(Session::new(addr, login.character_id, key))
            })
            .await?;

        self.metrics.login();
        if created {
            self.metrics.session_created();
            info!(character = login.character_id, "Session created");
        }
        if let Some(old) = evicted {
            self.metrics.sessions_evicted(1);
            self.queues.lock().await.remove(&old);
            warn!(evicted = %old, "Session table full, oldest session evicted");
        }

        let result = {
            let mut session = shared.lock().await;
            session.restart_login();
            if login.wants_resync() {
                session.resync(login.sync);
                debug!(sync = login.sync, "Login resync");
            }
            self.inbound.process_login(&mut session, datagram, login)
        };

        if login.wants_resync() {
            if let Some(dropped) = self.queues.lock().await.remove(&addr) {
                if !dropped.is_empty() {
                    debug!(dropped = dropped.len(), "Discarded queued packets on resync");
                }
            }
        }

        Ok(self.forward(addr, login.character_id, &result))
    }

    async fn handle_encrypted(&self, addr: SocketAddr, datagram: &mut [u8]) -> Result<usize> {
        let shared = self
            .sessions
            .get(&addr)
            .await
            .ok_or(ProtocolError::SessionNotFound(addr))?;

        let (character_id, result) = {
            let mut session = shared.lock().await;
            let result = self.inbound.process(&mut session, datagram)?;
            (session.character_id(), result)
        };

        if let Some(bytes) = &result.resend {
            self.metrics.resend();
            debug!(client = %addr, ack = result.header.ack, "Resending last datagram");
            self.endpoint.send_to(bytes, addr).await?;
        }

        Ok(self.forward(addr, character_id, &result))
    }

    fn forward(&self, addr: SocketAddr, character_id: u32, result: &InboundResult) -> usize {
        if result.kind == InboundKind::Decrypted(DecryptOutcome::AcceptedUnderPreviousKey) {
            self.metrics.previous_key_decrypt();
            debug!(client = %addr, "Datagram accepted under previous key");
        }
        let mut forwarded = 0;
        for packet in &result.packets {
            let routed = RoutedPacket::from_subpacket(addr, character_id, packet);
            match self.bus.publish(&routed) {
                Ok(()) => forwarded += 1,
                Err(e) => {
                    self.metrics.bus_error();
                    warn!(client = %addr, packet_type = packet.packet_type, error = %e, "Bus publish failed");
                }
            }
        }
        self.metrics.subpackets(forwarded as u64, result.skipped as u64);
        trace!(client = %addr, forwarded, "Sub-packets forwarded");
        forwarded
    }

    /// Queue sub-packets for a client. Oversized packets are refused; past the
    /// backlog limit the oldest queued packets are dropped.
    pub async fn queue_outbound<I>(&self, addr: SocketAddr, packets: I) -> Result<usize>
    where
        I: IntoIterator<Item = SubPacket>,
    {
        if self.sessions.get(&addr).await.is_none() {
            return Err(ProtocolError::SessionNotFound(addr));
        }

        let limit = self.config.outbound.backlog_limit;
        let mut queues = self.queues.lock().await;
        let queue = queues.entry(addr).or_default();

        let mut queued = 0;
        for packet in packets {
            if packet.frame_len() > MAX_SUBPACKET_SIZE {
                warn!(
                    client = %addr,
                    packet_type = packet.packet_type,
                    len = packet.payload.len(),
                    "Refusing oversized outbound packet"
                );
                continue;
            }
            queue.push_back(packet);
            queued += 1;
        }

        let overflow = queue.len().saturating_sub(limit);
        if overflow > 0 {
            queue.drain(..overflow);
            warn!(client = %addr, dropped = overflow, limit, "Outbound backlog full, oldest packets dropped");
        }
        Ok(queued)
    }

    /// Queue a packet received from a worker.
    pub async fn queue_routed(&self, packet: RoutedPacket) -> Result<usize> {
        let addr = packet.client_addr;
        self.queue_outbound(addr, [packet.into_subpacket()]).await
    }

    /// Drain every queue into datagrams. Returns the number of datagrams sent.
    pub async fn flush(&self) -> usize {
        let pending: Vec<(SocketAddr, Vec<SubPacket>)> = {
            let mut queues = self.queues.lock().await;
            queues
                .iter_mut()
                .filter(|(_, queue)| !queue.is_empty())
                .map(|(addr, queue)| (*addr, queue.drain(..).collect()))
                .collect()
        };
        if pending.is_empty() {
            return 0;
        }

        let _timer = Timer::start("flush");
        let mut sent = 0;
        for (addr, packets) in pending {
            match self.sessions.get(&addr).await {
                Some(session) => sent += self.flush_client(addr, &session, packets).await,
                None => {
                    self.queues.lock().await.remove(&addr);
                    debug!(client = %addr, dropped = packets.len(), "Dropping packets for closed session");
                }
            }
        }
        sent
    }

    async fn flush_client(
        &self,
        addr: SocketAddr,
        shared: &SharedSession,
        mut packets: Vec<SubPacket>,
    ) -> usize {
        let mut offset = 0;
        let mut sent = 0;

        while offset < packets.len() {
            let assembled = {
                let mut session = shared.lock().await;
                self.outbound.assemble(&mut session, &packets[offset..])
            };

            let datagram = match assembled {
                Ok(datagram) if datagram.consumed > 0 => datagram,
                Ok(_) => break,
                Err(e) => {
                    error!(
                        client = %addr,
                        dropped = packets.len() - offset,
                        error = %e,
                        "Outbound assembly failed, batch dropped"
                    );
                    break;
                }
            };

            if datagram.rotated {
                self.metrics.key_rotation();
                info!(client = %addr, seq = datagram.sequence, "Zone packet sent, session key rotated");
            }

            if let Err(e) = self.endpoint.send_to(&datagram.bytes, addr).await {
                warn!(client = %addr, error = %e, "Send failed, requeueing unsent packets");
                self.requeue(addr, packets.split_off(offset + datagram.consumed))
                    .await;
                return sent;
            }
            offset += datagram.consumed;
            sent += 1;
        }
        sent
    }

    /// Put packets back ahead of anything queued since the flush started.
    async fn requeue(&self, addr: SocketAddr, packets: Vec<SubPacket>) {
        if packets.is_empty() {
            return;
        }
        let limit = self.config.outbound.backlog_limit;
        let mut queues = self.queues.lock().await;
        let queue = queues.entry(addr).or_default();
        for packet in packets.into_iter().rev() {
            queue.push_front(packet);
        }
        queue.truncate(limit);
    }

    /// Send an empty datagram so the client sees a fresh ack.
    pub async fn send_keepalive(&self, addr: SocketAddr) -> Result<()> {
        let shared = self
            .sessions
            .get(&addr)
            .await
            .ok_or(ProtocolError::SessionNotFound(addr))?;
        let datagram = {
            let mut session = shared.lock().await;
            self.outbound.assemble(&mut session, &[])?
        };
        self.endpoint.send_to(&datagram.bytes, addr).await
    }

    /// Remove idle sessions and their queues.
    pub async fn sweep_idle(&self) -> usize {
        let evicted = self
            .sessions
            .evict_idle(self.config.session.idle_timeout)
            .await;
        if evicted.is_empty() {
            return 0;
        }

        let mut queues = self.queues.lock().await;
        for addr in &evicted {
            queues.remove(addr);
        }
        self.metrics.sessions_evicted(evicted.len() as u64);
        info!(count = evicted.len(), "Idle sessions evicted");
        evicted.len()
    }

    /// Drop a client immediately.
    pub async fn disconnect(&self, addr: &SocketAddr) -> bool {
        self.queues.lock().await.remove(addr);
        let Some(shared) = self.sessions.remove(addr).await else {
            return false;
        };
        let session = shared.lock().await;
        info!(
            client = %addr,
            character = session.character_id(),
            age_secs = session.age().as_secs(),
            "Session closed"
        );
        true
    }

    fn log_failure(&self, addr: SocketAddr, err: &ProtocolError) {
        match err {
            ProtocolError::DecryptionFailure => {
                self.metrics.decrypt_failure();
                warn!(client = %addr, "Datagram failed to decrypt under every key, dropped");
            }
            ProtocolError::ChecksumMismatch => {
                self.metrics.checksum_failure();
                warn!(client = %addr, "Login checksum mismatch, dropped");
            }
            ProtocolError::SessionNotFound(_) => {
                warn!(client = %addr, "Datagram from unknown client, dropped");
            }
            e if e.category() == ErrorCategory::Decode => {
                self.metrics.decode_error();
                debug!(client = %addr, error = %e, "Undecodable datagram dropped");
            }
            e => {
                warn!(client = %addr, error = %e, "Datagram dropped");
            }
        }
    }

    /// Serve until the shutdown channel fires.
    ///
    /// The receive loop only reads the socket and spawns a task per datagram.
    /// Flushing, the idle sweep, metrics output and worker replies each run on
    /// their own task, so a busy session never holds up receiving. Worker
    /// replies are read from `replies` when given. On shutdown the loop stops
    /// receiving, waits up to `shutdown_timeout` for in-flight datagrams, stops
    /// the background tasks and flushes whatever is still queued.
    pub async fn run(
        self: Arc<Self>,
        replies: Option<ReplyReceiver>,
        mut shutdown_rx: mpsc::Receiver<()>,
    ) -> Result<()> {
        let in_flight = Arc::new(AtomicUsize::new(0));
        let (stop_tx, stop_rx) = watch::channel(false);

        let mut background = JoinSet::new();
        background.spawn(Arc::clone(&self).flush_loop(stop_rx.clone()));
        background.spawn(Arc::clone(&self).maintenance_loop(stop_rx.clone()));
        if let Some(replies) = replies {
            background.spawn(Arc::clone(&self).reply_loop(replies, stop_rx));
        }

        info!(address = %self.local_addr()?, "Map router running");

        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => {
                    info!("Shutdown signal received");
                    break;
                }
                received = self.endpoint.recv() => {
                    let (datagram, addr) = match received {
                        Ok(received) => received,
                        Err(e) => {
                            // ICMP port-unreachable from a vanished client surfaces here
                            debug!(error = %e, "Receive failed");
                            continue;
                        }
                    };

                    let router = Arc::clone(&self);
                    let in_flight = Arc::clone(&in_flight);
                    in_flight.fetch_add(1, Ordering::SeqCst);
                    tokio::spawn(async move {
                        if let Err(e) = router.handle_datagram(addr, datagram).await {
                            router.log_failure(addr, &e);
                        }
                        in_flight.fetch_sub(1, Ordering::SeqCst);
                    });
                }
            }
        }

        self.wait_in_flight(&in_flight).await;
        let _ = stop_tx.send(true);
        while let Some(done) = background.join_next().await {
            if let Err(e) = done {
                error!(error = %e, "Background task failed");
            }
        }
        self.final_flush().await;
        Ok(())
    }

    async fn flush_loop(self: Arc<Self>, mut stop: watch::Receiver<bool>) {
        let mut tick = interval(self.config.outbound.flush_interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = stop.changed() => break,
                _ = tick.tick() => {
                    self.flush().await;
                }
            }
        }
        trace!("Flush task stopped");
    }

    /// Idle sweep plus the periodic metrics line.
    async fn maintenance_loop(self: Arc<Self>, mut stop: watch::Receiver<bool>) {
        let mut sweep_tick = interval(self.config.session.sweep_interval);
        sweep_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut metrics_tick = if self.config.logging.metrics_interval.is_zero() {
            None
        } else {
            Some(interval(self.config.logging.metrics_interval))
        };

        loop {
            tokio::select! {
                _ = stop.changed() => break,
                _ = sweep_tick.tick() => {
                    self.sweep_idle().await;
                }
                _ = async {
                    match metrics_tick.as_mut() {
                        Some(tick) => { tick.tick().await; }
                        None => std::future::pending::<()>().await,
                    }
                } => {
                    self.metrics.log_metrics();
                }
            }
        }
        trace!("Maintenance task stopped");
    }

    async fn reply_loop(self: Arc<Self>, mut replies: ReplyReceiver, mut stop: watch::Receiver<bool>) {
        loop {
            let reply = tokio::select! {
                _ = stop.changed() => break,
                reply = replies.recv() => reply,
            };
            match reply {
                Some(Ok(packet)) => {
                    let addr = packet.client_addr;
                    if let Err(e) = self.queue_routed(packet).await {
                        debug!(client = %addr, error = %e, "Worker reply not queued");
                    }
                }
                Some(Err(e)) => {
                    self.metrics.bus_error();
                    warn!(error = %e, "Undecodable worker reply");
                }
                None => {
                    info!("Worker channel closed, replies disabled");
                    break;
                }
            }
        }
    }

    async fn wait_in_flight(&self, in_flight: &AtomicUsize) {
        let timeout = self.config.server.shutdown_timeout;
        let start = Instant::now();

        while in_flight.load(Ordering::SeqCst) > 0 {
            if start.elapsed() > timeout {
                warn!(
                    remaining = in_flight.load(Ordering::SeqCst),
                    "Shutdown timeout reached, abandoning in-flight datagrams"
                );
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    async fn final_flush(&self) {
        let sent = self.flush().await;
        info!(final_datagrams = sent, "Router stopped");
        self.metrics.log_metrics();
    }
}
