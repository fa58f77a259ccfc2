//! SWIM backend: infection-style membership with active failure
//! detection.
//!
//! Once per protocol period one member is probed directly; on silence the
//! probe is retried indirectly through random relays; on continued
//! silence the member is suspected, and a suspect that never refutes is
//! confirmed dead and removed. Every probe and announcement piggybacks
//! pending gossip, so rumors reach the whole group in O(log n) periods.
//!
//! Incarnation counters break ties between rumors: a member learns it is
//! suspected by seeing its own identity in gossip, bumps its incarnation,
//! and publishes a fresh ALIVE that supersedes the suspicion everywhere.

use super::{BackendInitArgs, GroupBackend, GroupFactoryFuture, UpdateCallbacks};
use crate::gossip::{GossipBuffer, GossipEvent, GossipKind};
use crate::transport::{RpcRequest, RpcResponse, Transport};
use crate::types::{FlockError, MemberId, UpdateKind, MAX_PIGGYBACK};
use crate::view::GroupView;
use async_trait::async_trait;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha20Rng;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

// =============================================================================
// CONFIGURATION
// =============================================================================

const DEFAULT_PROTOCOL_PERIOD_MS: u64 = 1000;
const DEFAULT_PING_TIMEOUT_MS: u64 = 200;
const DEFAULT_PING_REQ_TIMEOUT_MS: u64 = 500;
const DEFAULT_PING_REQ_MEMBERS: u64 = 3;
const DEFAULT_SUSPICION_TIMEOUT_MS: u64 = 5000;

#[derive(Debug, Clone)]
pub struct SwimConfig {
    /// One probe per period.
    pub protocol_period: Duration,
    /// Direct-ping deadline.
    pub ping_timeout: Duration,
    /// Indirect-probe deadline, also used for announcements.
    pub ping_req_timeout: Duration,
    /// Fan-out for indirect probes.
    pub ping_req_members: usize,
    /// How long a suspect may stay silent before it is confirmed dead.
    pub suspicion_timeout: Duration,
    /// Crash-mode override: skip the LEAVE announcement on destroy.
    pub leave_on_destroy: bool,
}

fn config_u64(
    obj: &serde_json::Map<String, serde_json::Value>,
    key: &str,
    default: u64,
) -> Result<u64, FlockError> {
    match obj.get(key) {
        Some(v) => v
            .as_u64()
            .ok_or_else(|| FlockError::InvalidConfig(format!("{key:?} must be an integer"))),
        None => Ok(default),
    }
}

impl SwimConfig {
    /// Parse the recognized options, filling defaults. Returns the
    /// effective configuration alongside its JSON form, which is what
    /// `get_config` publishes back.
    pub fn from_json(value: &serde_json::Value) -> Result<(Self, serde_json::Value), FlockError> {
        let obj = value
            .as_object()
            .ok_or_else(|| FlockError::InvalidConfig("swim config must be an object".into()))?;

        let protocol_period_ms = config_u64(obj, "protocol_period_ms", DEFAULT_PROTOCOL_PERIOD_MS)?;
        let ping_timeout_ms = config_u64(obj, "ping_timeout_ms", DEFAULT_PING_TIMEOUT_MS)?;
        let ping_req_timeout_ms =
            config_u64(obj, "ping_req_timeout_ms", DEFAULT_PING_REQ_TIMEOUT_MS)?;
        let ping_req_members = config_u64(obj, "ping_req_members", DEFAULT_PING_REQ_MEMBERS)?;
        let suspicion_timeout_ms =
            config_u64(obj, "suspicion_timeout_ms", DEFAULT_SUSPICION_TIMEOUT_MS)?;
        let leave_on_destroy = match obj.get("leave_on_destroy") {
            Some(v) => v.as_bool().ok_or_else(|| {
                FlockError::InvalidConfig("\"leave_on_destroy\" must be a boolean".into())
            })?,
            None => true,
        };

        let effective = serde_json::json!({
            "protocol_period_ms": protocol_period_ms,
            "ping_timeout_ms": ping_timeout_ms,
            "ping_req_timeout_ms": ping_req_timeout_ms,
            "ping_req_members": ping_req_members,
            "suspicion_timeout_ms": suspicion_timeout_ms,
            "leave_on_destroy": leave_on_destroy,
        });

        Ok((
            Self {
                protocol_period: Duration::from_millis(protocol_period_ms),
                ping_timeout: Duration::from_millis(ping_timeout_ms),
                ping_req_timeout: Duration::from_millis(ping_req_timeout_ms),
                ping_req_members: ping_req_members as usize,
                suspicion_timeout: Duration::from_millis(suspicion_timeout_ms),
                leave_on_destroy,
            },
            effective,
        ))
    }
}

// =============================================================================
// PER-MEMBER STATE
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MemberStatus {
    Alive,
    Suspected,
}

/// Failure-detector state the backend keeps alongside each view member.
/// Confirmed-dead members are dropped from the view and from this map in
/// the same critical section, so no third status is needed.
#[derive(Debug, Clone)]
struct SwimMemberState {
    status: MemberStatus,
    incarnation: u64,
    suspected_at: Option<Instant>,
}

impl SwimMemberState {
    fn alive(incarnation: u64) -> Self {
        Self { status: MemberStatus::Alive, incarnation, suspected_at: None }
    }
}

/// View and detector state guarded by one lock; the pair must never
/// disagree about who is a member.
struct Membership {
    view: GroupView,
    states: HashMap<MemberId, SwimMemberState>,
}

/// Shuffled probe rotation. Regenerated on any membership change and
/// whenever the cursor completes an epoch.
#[derive(Default)]
struct ProbeOrder {
    order: Vec<MemberId>,
    cursor: usize,
    stale: bool,
}

pub struct SwimBackend {
    transport: Arc<dyn Transport>,
    self_id: MemberId,
    config: SwimConfig,
    config_json: Mutex<serde_json::Value>,
    // lock order: membership before probe, never the reverse
    membership: Mutex<Membership>,
    probe_order: Mutex<ProbeOrder>,
    gossip: GossipBuffer,
    self_incarnation: AtomicU64,
    shutting_down: AtomicBool,
    shutdown: Notify,
    callbacks: UpdateCallbacks,
}

impl SwimBackend {
    pub fn factory(args: BackendInitArgs) -> GroupFactoryFuture {
        Box::pin(async move {
            Self::init(args).await.map(|backend| backend as Arc<dyn GroupBackend>)
        })
    }

    async fn init(args: BackendInitArgs) -> Result<Arc<SwimBackend>, FlockError> {
        let (config, effective) = SwimConfig::from_json(&args.config)?;
        let self_id = MemberId::new(args.transport.self_address(), args.provider_id);

        let mut view = args.initial_view;
        view.add_metadata("__type__", "swim");
        view.add_metadata("__config__", effective.to_string());

        let mut states = HashMap::new();
        for member in view.members() {
            let id = member.id();
            if id != self_id {
                states.insert(id, SwimMemberState::alive(0));
            }
        }

        let backend = Arc::new(SwimBackend {
            transport: args.transport,
            self_id,
            gossip: GossipBuffer::new(view.live_count()),
            membership: Mutex::new(Membership { view, states }),
            probe_order: Mutex::new(ProbeOrder { stale: true, ..Default::default() }),
            config,
            config_json: Mutex::new(effective),
            self_incarnation: AtomicU64::new(0),
            shutting_down: AtomicBool::new(false),
            shutdown: Notify::new(),
            callbacks: args.callbacks,
        });

        if args.join {
            backend.join_group().await;
        }

        let driver = Arc::clone(&backend);
        tokio::spawn(async move { driver.run().await });

        Ok(backend)
    }

    // =========================================================================
    // PROTOCOL PERIOD
    // =========================================================================

    async fn run(self: Arc<Self>) {
        debug!("swim driver started for {}", self.self_id);
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.config.protocol_period) => {}
                _ = self.shutdown.notified() => break,
            }
            if self.shutting_down.load(Ordering::SeqCst) {
                break;
            }
            self.tick().await;
        }
        debug!("swim driver stopped for {}", self.self_id);
    }

    async fn tick(&self) {
        self.sweep_suspects();
        self.gossip.cleanup();
        if let Some(target) = self.next_probe_target() {
            self.probe(target).await;
        }
    }

    /// Confirm every suspect whose timeout expired: remove it, announce
    /// CONFIRM, and deliver `Died` to the host.
    fn sweep_suspects(&self) {
        let mut confirmed = Vec::new();
        {
            let mut membership = self.membership.lock().unwrap();
            let now = Instant::now();
            let expired: Vec<MemberId> = membership
                .states
                .iter()
                .filter(|(_, s)| {
                    s.status == MemberStatus::Suspected
                        && s.suspected_at
                            .is_some_and(|t| now.duration_since(t) >= self.config.suspicion_timeout)
                })
                .map(|(id, _)| id.clone())
                .collect();

            for id in expired {
                if let Some(state) = membership.states.remove(&id) {
                    membership.view.remove_member(&id.address, id.provider_id);
                    self.gossip
                        .push(GossipEvent::new(GossipKind::Confirm, &id, state.incarnation));
                    confirmed.push(id);
                }
            }

            if !confirmed.is_empty() {
                self.gossip.set_group_size(membership.view.live_count());
                self.probe_order.lock().unwrap().stale = true;
            }
        }

        for id in confirmed {
            warn!("member {id} confirmed dead after suspicion timeout");
            (self.callbacks.member)(UpdateKind::Died, &id.address, id.provider_id);
        }
    }

    /// Next candidate from the shuffled rotation, skipping self and
    /// members no longer in the view.
    fn next_probe_target(&self) -> Option<MemberId> {
        let membership = self.membership.lock().unwrap();
        let mut probe = self.probe_order.lock().unwrap();

        if probe.stale || probe.cursor >= probe.order.len() {
            let mut order: Vec<MemberId> = membership
                .view
                .members()
                .iter()
                .map(|m| m.id())
                .filter(|id| *id != self.self_id)
                .collect();
            order.shuffle(&mut ChaCha20Rng::from_entropy());
            probe.order = order;
            probe.cursor = 0;
            probe.stale = false;
        }

        while probe.cursor < probe.order.len() {
            let candidate = probe.order[probe.cursor].clone();
            probe.cursor += 1;
            if membership.view.contains(&candidate) {
                return Some(candidate);
            }
        }
        None
    }

    async fn probe(&self, target: MemberId) {
        let request = RpcRequest::Ping {
            sender: self.self_id.clone(),
            incarnation: self.self_incarnation.load(Ordering::SeqCst),
            gossip: self.gossip.gather(MAX_PIGGYBACK),
        };

        let result = self
            .transport
            .call(&target.address, target.provider_id, request, self.config.ping_timeout)
            .await;

        match result {
            Ok(RpcResponse::Pong { incarnation, gossip }) => {
                self.apply_gossip(&gossip);
                self.clear_suspicion(&target, incarnation);
            }
            Ok(_) | Err(_) => {
                debug!("direct ping to {target} failed, probing indirectly");
                self.indirect_probe(target).await;
            }
        }
    }

    async fn indirect_probe(&self, target: MemberId) {
        let relays = self.pick_relays(&target);
        if relays.is_empty() {
            self.suspect(&target);
            return;
        }

        let mut probes = JoinSet::new();
        for relay in relays {
            let transport = Arc::clone(&self.transport);
            let request = RpcRequest::PingReq {
                target: target.clone(),
                incarnation: self.self_incarnation.load(Ordering::SeqCst),
                gossip: self.gossip.gather(MAX_PIGGYBACK),
            };
            let timeout = self.config.ping_req_timeout;
            probes.spawn(async move {
                transport.call(&relay.address, relay.provider_id, request, timeout).await
            });
        }

        let mut responded = false;
        let mut reported_incarnation = 0;
        while let Some(joined) = probes.join_next().await {
            let Ok(Ok(RpcResponse::PingReqAck { target_responded, incarnation, gossip })) = joined
            else {
                continue;
            };
            self.apply_gossip(&gossip);
            if target_responded {
                responded = true;
                reported_incarnation = reported_incarnation.max(incarnation);
            }
        }

        if responded {
            self.clear_suspicion(&target, reported_incarnation);
        } else {
            self.suspect(&target);
        }
    }

    /// Random relays for an indirect probe, excluding self and the target.
    fn pick_relays(&self, target: &MemberId) -> Vec<MemberId> {
        let membership = self.membership.lock().unwrap();
        let mut relays: Vec<MemberId> = membership
            .view
            .members()
            .iter()
            .map(|m| m.id())
            .filter(|id| id != &self.self_id && id != target)
            .collect();
        relays.shuffle(&mut ChaCha20Rng::from_entropy());
        relays.truncate(self.config.ping_req_members);
        relays
    }

    fn suspect(&self, target: &MemberId) {
        let mut incarnation = None;
        {
            let mut membership = self.membership.lock().unwrap();
            if let Some(state) = membership.states.get_mut(target)
                && state.status == MemberStatus::Alive
            {
                state.status = MemberStatus::Suspected;
                state.suspected_at = Some(Instant::now());
                incarnation = Some(state.incarnation);
            }
        }
        if let Some(incarnation) = incarnation {
            info!("suspecting {target} at incarnation {incarnation}");
            self.gossip.push(GossipEvent::new(GossipKind::Suspect, target, incarnation));
        }
    }

    /// A suspected member answered (directly or via a relay) with a newer
    /// incarnation: transition it back to alive and spread the word.
    fn clear_suspicion(&self, target: &MemberId, incarnation: u64) {
        let mut cleared = false;
        {
            let mut membership = self.membership.lock().unwrap();
            if let Some(state) = membership.states.get_mut(target)
                && state.status == MemberStatus::Suspected
                && incarnation > state.incarnation
            {
                state.status = MemberStatus::Alive;
                state.suspected_at = None;
                state.incarnation = incarnation;
                cleared = true;
            }
        }
        if cleared {
            debug!("suspicion of {target} cleared at incarnation {incarnation}");
            self.gossip.push(GossipEvent::new(GossipKind::Alive, target, incarnation));
        }
    }

    // =========================================================================
    // GOSSIP PROCESSING
    // =========================================================================

    /// Fold incoming rumors into local state. Every rumor that taught us
    /// something is re-inserted into the buffer for onward dissemination.
    /// Callbacks fire after the view lock is released.
    fn apply_gossip(&self, events: &[GossipEvent]) {
        let mut notifications: Vec<(UpdateKind, MemberId)> = Vec::new();
        {
            let mut membership = self.membership.lock().unwrap();
            let mut membership_changed = false;

            for event in events {
                let id = event.member_id();

                if id == self.self_id {
                    if event.kind == GossipKind::Suspect {
                        let refuted = self.self_incarnation.fetch_add(1, Ordering::SeqCst) + 1;
                        info!("refuting suspicion of self with incarnation {refuted}");
                        self.gossip
                            .push(GossipEvent::new(GossipKind::Alive, &self.self_id, refuted));
                    }
                    continue;
                }

                match event.kind {
                    GossipKind::Alive | GossipKind::Join => {
                        let known = membership.states.contains_key(&id);
                        if known {
                            if let Some(state) = membership.states.get_mut(&id) {
                                // ALIVE beats SUSPECT at equal incarnation
                                let supersedes = event.incarnation > state.incarnation
                                    || (event.incarnation == state.incarnation
                                        && state.status == MemberStatus::Suspected);
                                if supersedes {
                                    state.status = MemberStatus::Alive;
                                    state.suspected_at = None;
                                    state.incarnation = event.incarnation;
                                    self.gossip.push(event.clone());
                                }
                            }
                        } else {
                            let rank = membership.view.next_rank();
                            if membership
                                .view
                                .add_member(rank, id.provider_id, id.address.clone())
                                .is_ok()
                            {
                                membership
                                    .states
                                    .insert(id.clone(), SwimMemberState::alive(event.incarnation));
                                notifications.push((UpdateKind::Joined, id.clone()));
                                membership_changed = true;
                                self.gossip.push(event.clone());
                            }
                        }
                    }
                    GossipKind::Suspect => {
                        if let Some(state) = membership.states.get_mut(&id)
                            && state.status == MemberStatus::Alive
                            && event.incarnation >= state.incarnation
                        {
                            state.status = MemberStatus::Suspected;
                            state.suspected_at = Some(Instant::now());
                            state.incarnation = event.incarnation;
                            self.gossip.push(event.clone());
                        }
                    }
                    GossipKind::Confirm | GossipKind::Leave => {
                        if membership.states.remove(&id).is_some() {
                            membership.view.remove_member(&id.address, id.provider_id);
                            let kind = if event.kind == GossipKind::Confirm {
                                UpdateKind::Died
                            } else {
                                UpdateKind::Left
                            };
                            notifications.push((kind, id.clone()));
                            membership_changed = true;
                            self.gossip.push(event.clone());
                        }
                    }
                }
            }

            if membership_changed {
                self.gossip.set_group_size(membership.view.live_count());
                self.probe_order.lock().unwrap().stale = true;
            }
        }

        for (kind, id) in notifications {
            (self.callbacks.member)(kind, &id.address, id.provider_id);
        }
    }

    // =========================================================================
    // JOIN / LEAVE
    // =========================================================================

    async fn join_group(&self) {
        let incarnation = self.self_incarnation.load(Ordering::SeqCst);
        let event = GossipEvent::new(GossipKind::Join, &self.self_id, incarnation);
        let targets;
        {
            let mut membership = self.membership.lock().unwrap();
            if !membership.view.contains(&self.self_id) {
                let rank = membership.view.next_rank();
                let _ = membership.view.add_member(
                    rank,
                    self.self_id.provider_id,
                    self.self_id.address.clone(),
                );
            }
            self.gossip.set_group_size(membership.view.live_count());
            self.probe_order.lock().unwrap().stale = true;
            self.gossip.push(event.clone());
            targets = self.announce_targets(&membership);
        }
        info!("joining group as {} via {} members", self.self_id, targets.len());
        self.announce(event, targets).await;
    }

    /// Up to `ceil(3 * log2(n))` random members, excluding self.
    fn announce_targets(&self, membership: &Membership) -> Vec<MemberId> {
        let mut targets: Vec<MemberId> = membership
            .view
            .members()
            .iter()
            .map(|m| m.id())
            .filter(|id| *id != self.self_id)
            .collect();
        targets.shuffle(&mut ChaCha20Rng::from_entropy());
        targets.truncate(self.gossip.max_transmissions() as usize);
        targets
    }

    async fn announce(&self, event: GossipEvent, targets: Vec<MemberId>) {
        let mut calls = JoinSet::new();
        for target in targets {
            let transport = Arc::clone(&self.transport);
            let request = RpcRequest::Announce {
                event: event.clone(),
                gossip: self.gossip.gather(MAX_PIGGYBACK),
            };
            let timeout = self.config.ping_req_timeout;
            calls.spawn(async move {
                if let Err(e) = transport
                    .call(&target.address, target.provider_id, request, timeout)
                    .await
                {
                    debug!("announce to {target} failed: {e}");
                }
            });
        }
        while calls.join_next().await.is_some() {}
    }

    #[cfg(test)]
    fn incarnation(&self) -> u64 {
        self.self_incarnation.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl GroupBackend for SwimBackend {
    fn name(&self) -> &'static str {
        "swim"
    }

    fn get_config(&self, visitor: &mut dyn FnMut(&serde_json::Value)) {
        let config = self.config_json.lock().unwrap();
        visitor(&config);
    }

    fn get_view(&self, visitor: &mut dyn FnMut(&GroupView)) {
        let membership = self.membership.lock().unwrap();
        visitor(&membership.view);
    }

    async fn handle_rpc(&self, request: RpcRequest) -> Result<RpcResponse, FlockError> {
        match request {
            RpcRequest::Ping { sender, incarnation, gossip } => {
                self.apply_gossip(&gossip);
                // the probe itself proves the sender alive at its stated
                // incarnation
                self.apply_gossip(&[GossipEvent::new(GossipKind::Alive, &sender, incarnation)]);
                Ok(RpcResponse::Pong {
                    incarnation: self.self_incarnation.load(Ordering::SeqCst),
                    gossip: self.gossip.gather(MAX_PIGGYBACK),
                })
            }
            RpcRequest::PingReq { target, incarnation: _, gossip } => {
                self.apply_gossip(&gossip);
                let ping = RpcRequest::Ping {
                    sender: self.self_id.clone(),
                    incarnation: self.self_incarnation.load(Ordering::SeqCst),
                    gossip: self.gossip.gather(MAX_PIGGYBACK),
                };
                let outcome = self
                    .transport
                    .call(&target.address, target.provider_id, ping, self.config.ping_timeout)
                    .await;
                match outcome {
                    Ok(RpcResponse::Pong { incarnation, gossip }) => {
                        self.apply_gossip(&gossip);
                        self.clear_suspicion(&target, incarnation);
                        Ok(RpcResponse::PingReqAck {
                            target_responded: true,
                            incarnation,
                            gossip: self.gossip.gather(MAX_PIGGYBACK),
                        })
                    }
                    _ => Ok(RpcResponse::PingReqAck {
                        target_responded: false,
                        incarnation: 0,
                        gossip: self.gossip.gather(MAX_PIGGYBACK),
                    }),
                }
            }
            RpcRequest::Announce { event, gossip } => {
                self.apply_gossip(std::slice::from_ref(&event));
                self.apply_gossip(&gossip);
                Ok(RpcResponse::Ack)
            }
            _ => Err(FlockError::Unsupported("rpc")),
        }
    }

    async fn destroy(&self) -> Result<(), FlockError> {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.shutdown.notify_one();

        if self.config.leave_on_destroy {
            let incarnation = self.self_incarnation.load(Ordering::SeqCst);
            let event = GossipEvent::new(GossipKind::Leave, &self.self_id, incarnation);
            self.gossip.push(event.clone());
            let targets = {
                let membership = self.membership.lock().unwrap();
                self.announce_targets(&membership)
            };
            info!("announcing departure of {} to {} members", self.self_id, targets.len());
            self.announce(event, targets).await;
        }
        Ok(())
    }
}
