use std::{
    collections::HashMap,
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use parking_lot::Mutex;
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
    time::{timeout, Instant, MissedTickBehavior},
};
use tracing::{debug, info, instrument, warn, Instrument};

use super::{
    messages::{decode_packet, encode_packet, read_message, write_message, GossipPacket, StreamMessage},
    pick_targets, Delegate, Member, NodeSelectionDelegate, NodeState,
};
use crate::{
    broadcast::retransmit_limit,
    config::KvConfig,
    error::{KvError, KvResult},
    transport::{IncomingStream, Packet, Transport, TransportChannels},
    zone::MAX_META_LEN,
};

/// Per-message cost of a user broadcast inside a packet.
const USER_MSG_OVERHEAD: usize = 8;

#[derive(Debug, Clone)]
pub struct MemberlistConfig {
    pub name: String,
    pub advertise_addr: SocketAddr,
    pub gossip_interval: Duration,
    pub gossip_nodes: usize,
    pub push_pull_interval: Duration,
    pub probe_interval: Duration,
    pub probe_timeout: Duration,
    pub probe_failures_before_dead: u32,
    pub retransmit_mult: usize,
    pub stream_timeout: Duration,
    pub dead_node_reclaim_time: Duration,
    pub gossip_packet_limit: usize,
}

impl MemberlistConfig {
    pub fn from_kv_config(cfg: &KvConfig, name: String, advertise_addr: SocketAddr) -> Self {
        Self {
            name,
            advertise_addr,
            gossip_interval: cfg.gossip_interval,
            gossip_nodes: cfg.gossip_nodes,
            push_pull_interval: cfg.push_pull_interval,
            probe_interval: cfg.probe_interval,
            probe_timeout: cfg.probe_timeout,
            probe_failures_before_dead: cfg.probe_failures_before_dead.max(1),
            retransmit_mult: cfg.retransmit_mult,
            stream_timeout: cfg.stream_timeout,
            dead_node_reclaim_time: cfg.dead_node_reclaim_time,
            gossip_packet_limit: cfg.gossip_packet_limit,
        }
    }
}

#[derive(Debug)]
struct MemberRecord {
    member: Member,
    state_change: Instant,
    probe_failures: u32,
}

#[derive(Debug)]
struct PendingUpdate {
    member: Member,
    transmits: usize,
}

#[derive(Debug)]
struct MemberState {
    local: Member,
    members: HashMap<String, MemberRecord>,
    /// Member records still being gossiped.
    updates: Vec<PendingUpdate>,
}

impl MemberState {
    fn queue_update(&mut self, member: Member) {
        self.updates.retain(|u| u.member.name != member.name);
        self.updates.push(PendingUpdate {
            member,
            transmits: 0,
        });
    }

    fn live_peers(&self) -> Vec<Member> {
        self.members
            .values()
            .filter(|r| r.member.state.is_live())
            .map(|r| r.member.clone())
            .collect()
    }

    fn num_live(&self) -> usize {
        1 + self
            .members
            .values()
            .filter(|r| r.member.state.is_live())
            .count()
    }

    fn snapshot(&self) -> Vec<Member> {
        std::iter::once(self.local.clone())
            .chain(self.members.values().map(|r| r.member.clone()))
            .collect()
    }
}

/// Minimal gossip membership engine.
pub struct Memberlist {
    cfg: MemberlistConfig,
    transport: Arc<dyn Transport>,
    delegate: Arc<dyn Delegate>,
    selector: Arc<dyn NodeSelectionDelegate>,
    state: Mutex<MemberState>,
    left: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for Memberlist {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Memberlist")
            .field("name", &self.cfg.name)
            .field("addr", &self.cfg.advertise_addr)
            .finish_non_exhaustive()
    }
}

impl Memberlist {
    /// Starts the engine over an already bound transport.
    pub fn create(
        cfg: MemberlistConfig,
        transport: Arc<dyn Transport>,
        channels: TransportChannels,
        delegate: Arc<dyn Delegate>,
        selector: Arc<dyn NodeSelectionDelegate>,
    ) -> Arc<Self> {
        let local = Member {
            name: cfg.name.clone(),
            addr: cfg.advertise_addr,
            meta: delegate.node_meta(MAX_META_LEN),
            state: NodeState::Alive,
            incarnation: 0,
        };
        let (shutdown_tx, _) = watch::channel(false);
        let list = Arc::new(Self {
            cfg,
            transport,
            delegate,
            selector,
            state: Mutex::new(MemberState {
                local,
                members: HashMap::new(),
                updates: Vec::new(),
            }),
            left: AtomicBool::new(false),
            shutdown_tx,
            tasks: Mutex::new(Vec::new()),
        });

        let TransportChannels { packets, streams } = channels;
        let tasks = vec![
            tokio::spawn(list.clone().packet_listener(packets)),
            tokio::spawn(list.clone().stream_listener(streams)),
            tokio::spawn(list.clone().gossip_loop()),
            tokio::spawn(list.clone().push_pull_loop()),
            tokio::spawn(list.clone().probe_loop()),
        ];
        *list.tasks.lock() = tasks;
        list.delegate.notify_cluster_size(1);
        info!(name = %list.cfg.name, addr = %list.cfg.advertise_addr, "Memberlist started");
        list
    }

    pub fn local_member(&self) -> Member {
        self.state.lock().local.clone()
    }

    /// All known members, the local node first.
    pub fn members(&self) -> Vec<Member> {
        self.state.lock().snapshot()
    }

    /// Number of alive or suspect members, the local node included.
    pub fn num_members(&self) -> usize {
        self.state.lock().num_live()
    }

    /// Push/pulls with every address. Returns how many were reached.
    pub async fn join(&self, addrs: &[String]) -> usize {
        let mut reached = 0;
        for addr in addrs {
            match self.push_pull(addr, true).await {
                Ok(()) => {
                    debug!(addr = %addr, "Joined node");
                    reached += 1;
                }
                Err(e) => warn!(addr = %addr, error = %e, "Failed to join node"),
            }
        }
        reached
    }

    /// Announces that this node is leaving and stops gossiping about it.
    pub async fn leave(&self, leave_timeout: Duration) -> KvResult<()> {
        if self.left.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let (announcement, peers) = {
            let mut state = self.state.lock();
            state.local.incarnation += 1;
            state.local.state = NodeState::Left;
            (state.local.clone(), state.live_peers())
        };
        if peers.is_empty() {
            return Ok(());
        }

        let payload = encode_packet(&GossipPacket::Members(vec![announcement]))?;
        let sends = peers.iter().map(|peer| {
            let addr = peer.addr.to_string();
            let payload = &payload;
            async move {
                if let Err(e) = self.transport.write_to(payload, &addr).await {
                    debug!(addr = %addr, error = %e, "Failed to send leave announcement");
                }
            }
        });
        match timeout(leave_timeout, futures::future::join_all(sends)).await {
            Ok(_) => {
                info!(name = %self.cfg.name, peers = peers.len(), "Left cluster");
                Ok(())
            }
            Err(_) => Err(KvError::Join(format!(
                "leave announcement not sent within {leave_timeout:?}"
            ))),
        }
    }

    pub async fn shutdown(&self) -> KvResult<()> {
        self.shutdown_tx.send_replace(true);
        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            let _ = task.await;
        }
        self.transport.shutdown().await?;
        info!(name = %self.cfg.name, "Memberlist stopped");
        Ok(())
    }

    /// Merges a member record. Returns true if it changed our view.
    fn merge_member(&self, incoming: Member) -> bool {
        let mut guard = self.state.lock();
        let state = &mut *guard;

        if incoming.name == state.local.name {
            if incoming.state != NodeState::Alive
                && incoming.incarnation >= state.local.incarnation
                && !self.left.load(Ordering::Acquire)
            {
                state.local.incarnation = incoming.incarnation + 1;
                let local = state.local.clone();
                warn!(
                    name = %local.name,
                    incarnation = local.incarnation,
                    reported = ?incoming.state,
                    "Refuting member state reported by peer"
                );
                state.queue_update(local);
            }
            return false;
        }

        let changed = match state.members.get_mut(&incoming.name) {
            None => {
                if !incoming.state.is_live() {
                    return false;
                }
                info!(name = %incoming.name, addr = %incoming.addr, "Member joined");
                state.members.insert(
                    incoming.name.clone(),
                    MemberRecord {
                        member: incoming.clone(),
                        state_change: Instant::now(),
                        probe_failures: 0,
                    },
                );
                true
            }
            Some(record) if record.member.is_superseded_by(&incoming) => {
                if record.member.state != incoming.state {
                    info!(
                        name = %incoming.name,
                        from = ?record.member.state,
                        to = ?incoming.state,
                        "Member state changed"
                    );
                    record.state_change = Instant::now();
                }
                if incoming.state == NodeState::Alive {
                    record.probe_failures = 0;
                }
                record.member = incoming.clone();
                true
            }
            Some(_) => false,
        };

        if changed {
            state.queue_update(incoming);
            let live = state.num_live();
            drop(guard);
            self.delegate.notify_cluster_size(live);
        }
        changed
    }

    fn handle_packet(&self, packet: Packet) {
        let decoded = match decode_packet(&packet.buf) {
            Ok(decoded) => decoded,
            Err(e) => {
                warn!(from = %packet.from, error = %e, "Failed to decode gossip packet");
                return;
            }
        };
        match decoded {
            GossipPacket::User(msgs) => {
                for msg in msgs {
                    self.delegate.notify_msg(&msg);
                }
            }
            GossipPacket::Members(members) => {
                for member in members {
                    self.merge_member(member);
                }
            }
        }
    }

    fn local_push_pull(&self, join: bool) -> StreamMessage {
        StreamMessage::PushPull {
            join,
            members: self.members(),
            user_state: self.delegate.local_state(join),
        }
    }

    fn merge_push_pull(&self, members: Vec<Member>, user_state: &[u8], join: bool) {
        for member in members {
            self.merge_member(member);
        }
        self.delegate.merge_remote_state(user_state, join);
    }

    async fn push_pull(&self, addr: &str, join: bool) -> KvResult<()> {
        let stream_timeout = self.cfg.stream_timeout;
        let mut conn = self.transport.dial_timeout(addr, stream_timeout).await?;
        let request = self.local_push_pull(join);

        let reply = timeout(stream_timeout, async {
            write_message(&mut conn, &request).await?;
            read_message(&mut conn).await
        })
        .await
        .map_err(|_| KvError::Join(format!("push/pull with {addr} timed out")))??;

        match reply {
            StreamMessage::PushPull {
                members,
                user_state,
                ..
            } => {
                self.merge_push_pull(members, &user_state, join);
                Ok(())
            }
            other => Err(KvError::Join(format!(
                "unexpected push/pull reply from {addr}: {other:?}"
            ))),
        }
    }

    async fn handle_stream(self: Arc<Self>, incoming: IncomingStream) {
        let IncomingStream { mut conn, remote } = incoming;
        let stream_timeout = self.cfg.stream_timeout;

        let result = timeout(stream_timeout, async {
            match read_message(&mut conn).await? {
                StreamMessage::Ping { from } => {
                    debug!(%remote, from = %from, "Ping received");
                    write_message(&mut conn, &StreamMessage::Ack).await
                }
                StreamMessage::PushPull {
                    join,
                    members,
                    user_state,
                } => {
                    write_message(&mut conn, &self.local_push_pull(join)).await?;
                    self.merge_push_pull(members, &user_state, join);
                    Ok(())
                }
                StreamMessage::Ack => Err(KvError::Join("unexpected ack".to_string())),
            }
        })
        .await;

        match result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => debug!(%remote, error = %e, "Stream exchange failed"),
            Err(_) => debug!(%remote, "Stream exchange timed out"),
        }
    }

    async fn probe(&self, target: &Member) -> bool {
        let addr = target.addr.to_string();
        let result = timeout(self.cfg.probe_timeout, async {
            let mut conn = self.transport.dial_timeout(&addr, self.cfg.probe_timeout).await?;
            write_message(
                &mut conn,
                &StreamMessage::Ping {
                    from: self.cfg.name.clone(),
                },
            )
            .await?;
            read_message(&mut conn).await
        })
        .await;
        matches!(result, Ok(Ok(StreamMessage::Ack)))
    }

    fn record_probe(&self, name: &str, ok: bool) {
        let mut state = self.state.lock();
        let limit = self.cfg.probe_failures_before_dead;
        let Some(record) = state.members.get_mut(name) else {
            return;
        };
        if ok {
            record.probe_failures = 0;
            return;
        }

        record.probe_failures += 1;
        let next = if record.probe_failures >= limit {
            NodeState::Dead
        } else {
            NodeState::Suspect
        };
        if record.member.state >= next {
            return;
        }
        warn!(name, failures = record.probe_failures, state = ?next, "Probe failed");
        record.member.state = next;
        record.state_change = Instant::now();
        let member = record.member.clone();
        state.queue_update(member);
        let live = state.num_live();
        drop(state);
        self.delegate.notify_cluster_size(live);
    }

    /// Forgets dead and left members after the reclaim time.
    fn reap(&self) {
        let reclaim = self.cfg.dead_node_reclaim_time;
        let mut state = self.state.lock();
        let before = state.members.len();
        state.members.retain(|name, record| {
            let keep = record.member.state.is_live() || record.state_change.elapsed() < reclaim;
            if !keep {
                debug!(name = %name, "Reclaiming member");
            }
            keep
        });
        if state.members.len() != before {
            let live = state.num_live();
            drop(state);
            self.delegate.notify_cluster_size(live);
        }
    }

    /// Takes member updates for one gossip round, retiring those sent
    /// often enough.
    fn take_member_updates(&self) -> Vec<Member> {
        let mut state = self.state.lock();
        let limit = retransmit_limit(self.cfg.retransmit_mult, state.num_live());
        let out: Vec<Member> = state.updates.iter().map(|u| u.member.clone()).collect();
        for update in state.updates.iter_mut() {
            update.transmits += 1;
        }
        state.updates.retain(|u| u.transmits < limit);
        out
    }

    async fn gossip_round(&self) {
        let peers = self.state.lock().live_peers();
        if peers.is_empty() {
            return;
        }
        let targets = pick_targets(self.selector.select_nodes(&peers), self.cfg.gossip_nodes);
        let member_updates = self.take_member_updates();

        for target in targets {
            let addr = target.addr.to_string();
            if !member_updates.is_empty() {
                self.send_packet(&GossipPacket::Members(member_updates.clone()), &addr)
                    .await;
            }
            let msgs = self
                .delegate
                .get_broadcasts(USER_MSG_OVERHEAD, self.cfg.gossip_packet_limit);
            if !msgs.is_empty() {
                self.send_packet(&GossipPacket::User(msgs), &addr).await;
            }
        }
    }

    async fn send_packet(&self, packet: &GossipPacket, addr: &str) {
        let payload = match encode_packet(packet) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(error = %e, "Failed to encode gossip packet");
                return;
            }
        };
        if let Err(e) = self.transport.write_to(&payload, addr).await {
            debug!(addr, error = %e, "Failed to send gossip packet");
        }
    }

    #[instrument(skip_all, fields(name = %self.cfg.name))]
    async fn packet_listener(self: Arc<Self>, mut packets: mpsc::Receiver<Packet>) {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        loop {
            tokio::select! {
                _ = async { let _ = shutdown_rx.wait_for(|s| *s).await; } => break,
                packet = packets.recv() => match packet {
                    Some(packet) => self.handle_packet(packet),
                    None => break,
                },
            }
        }
    }

    #[instrument(skip_all, fields(name = %self.cfg.name))]
    async fn stream_listener(self: Arc<Self>, mut streams: mpsc::Receiver<IncomingStream>) {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        loop {
            tokio::select! {
                _ = async { let _ = shutdown_rx.wait_for(|s| *s).await; } => break,
                incoming = streams.recv() => match incoming {
                    Some(incoming) => {
                        tokio::spawn(self.clone().handle_stream(incoming).in_current_span());
                    }
                    None => break,
                },
            }
        }
    }

    #[instrument(skip_all, fields(name = %self.cfg.name))]
    async fn gossip_loop(self: Arc<Self>) {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let mut ticker = tokio::time::interval(self.cfg.gossip_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = async { let _ = shutdown_rx.wait_for(|s| *s).await; } => break,
                _ = ticker.tick() => self.gossip_round().await,
            }
        }
    }

    #[instrument(skip_all, fields(name = %self.cfg.name))]
    async fn push_pull_loop(self: Arc<Self>) {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let mut ticker = tokio::time::interval(self.cfg.push_pull_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = async { let _ = shutdown_rx.wait_for(|s| *s).await; } => break,
                _ = ticker.tick() => {
                    let peers = self.state.lock().live_peers();
                    let targets = self.selector.push_pull_targets(&peers);
                    for target in targets {
                        if let Err(e) = self.push_pull(&target.addr.to_string(), false).await {
                            debug!(peer = %target.name, error = %e, "Push/pull failed");
                        }
                    }
                }
            }
        }
    }

    #[instrument(skip_all, fields(name = %self.cfg.name))]
    async fn probe_loop(self: Arc<Self>) {
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let mut ticker = tokio::time::interval(self.cfg.probe_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = async { let _ = shutdown_rx.wait_for(|s| *s).await; } => break,
                _ = ticker.tick() => {
                    self.reap();
                    let peers = self.state.lock().live_peers();
                    let target = pick_targets(self.selector.select_nodes(&peers), 1).pop();
                    if let Some(target) = target {
                        let ok = self.probe(&target).await;
                        self.record_probe(&target.name, ok);
                    }
                }
            }
        }
    }
}
