//! Supervising event loop of a node.
//!
//! A single task owns the peer directory, the reliable-delivery tables, the
//! role state machine and the simulation. The unicast receive loop and the
//! presentation handle feed it through channels, and four timers drive the
//! periodic work:
//!
//! - resend: every `ping_delay`, retransmit outstanding messages and ping
//!   idle peers,
//! - liveness: every `node_timeout`, declare silent peers dead,
//! - tick: every `state_delay`, advance the game and broadcast STATE
//!   (master only),
//! - announce: once a second, advertise the session (master only).
//!
//! Handlers never fail the loop. Send errors are logged and the next cycle
//! retries; protocol outcomes end the session with a [`SessionEnd`].

use crate::directory::PeerDirectory;
use crate::error::{NodeError, SessionEnd};
use crate::game::GameState;
use crate::handle::{NodeCommand, NodeHandle, NodeStatus, Published};
use crate::membership::{pick_deputy, Membership, RoleAction, RoleEvent};
use crate::reliable::{DedupWindow, MessageSequence, OutstandingTable};
use crate::transport::{Datagram, UnicastTransport};
use log::{debug, error, info, warn};
use shared::{
    Direction, GameAnnouncement, GameConfig, GameMessage, GameSnapshot, MessageBody, NodeRole,
    PlayerType, ANNOUNCE_INTERVAL, MULTICAST_GROUP, MULTICAST_PORT,
};
use std::collections::HashSet;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, RwLock};
use tokio::time::{interval, MissedTickBehavior};

/// Local settings of a node that are not part of the shared [`GameConfig`].
#[derive(Debug, Clone)]
pub struct NodeOptions {
    pub bind_addr: SocketAddr,
    pub name: String,
    pub player_type: PlayerType,
    /// Where a master sends announcements; `None` disables them.
    pub announce_group: Option<SocketAddr>,
    /// Seed for the simulation's random source.
    pub seed: Option<u64>,
}

impl Default for NodeOptions {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)),
            name: "player".to_string(),
            player_type: PlayerType::Human,
            announce_group: Some(SocketAddr::from((MULTICAST_GROUP, MULTICAST_PORT))),
            seed: None,
        }
    }
}

/// The master being replaced when a role transition runs.
#[derive(Debug, Clone, Copy)]
struct PreviousMaster {
    addr: SocketAddr,
    id: Option<u32>,
    /// False when it stopped answering, true when it handed over.
    alive: bool,
}

pub struct Node {
    transport: UnicastTransport,
    directory: PeerDirectory,
    outstanding: OutstandingTable,
    dedup: DedupWindow,
    sequence: MessageSequence,
    membership: Membership,
    game: GameState,
    options: NodeOptions,

    my_id: Option<u32>,
    joined: bool,
    /// Sequence of the in-flight request to become a viewer.
    demotion_seq: Option<u64>,
    self_demotion_requested: bool,
    ended: Option<SessionEnd>,
    running: Arc<AtomicBool>,

    inbound_tx: mpsc::UnboundedSender<Datagram>,
    inbound_rx: mpsc::UnboundedReceiver<Datagram>,
    commands: mpsc::UnboundedReceiver<NodeCommand>,
    commands_open: bool,
    published: Arc<RwLock<Published>>,
}

impl Node {
    /// Starts a new session with this node as master.
    pub async fn create(
        config: GameConfig,
        options: NodeOptions,
    ) -> Result<(Self, NodeHandle), NodeError> {
        config.validate()?;
        let transport = UnicastTransport::bind(options.bind_addr).await?;

        let mut game = GameState::new(config, options.seed);
        let id = game.add_player(&options.name, options.player_type, NodeRole::Master, None)?;
        game.set_local_port(id, transport.local_addr().port());
        info!(
            "Created session on {} as player {} ({})",
            transport.local_addr(),
            id,
            options.name
        );

        let membership = Membership::master_node();
        let (mut node, handle) = Self::assemble(transport, game, membership, options, Some(id));
        node.joined = true;
        Ok((node, handle))
    }

    /// Asks the master at `master` to admit this node. `config` is the
    /// session's configuration as announced; it governs timers until the
    /// first snapshot arrives.
    pub async fn join(
        master: SocketAddr,
        config: GameConfig,
        only_view: bool,
        options: NodeOptions,
    ) -> Result<(Self, NodeHandle), NodeError> {
        config.validate()?;
        let transport = UnicastTransport::bind(options.bind_addr).await?;
        let game = GameState::new(config, options.seed);
        let membership = Membership::joining(master, only_view);

        let (mut node, handle) = Self::assemble(transport, game, membership, options, None);
        node.directory.upsert(master, None, NodeRole::Master);
        node.directory.touch(master, Instant::now());

        let join = MessageBody::Join {
            name: node.options.name.clone(),
            only_view,
            player_type: node.options.player_type,
        };
        info!("Joining session at {} from {}", master, node.local_addr());
        node.send_tracked(master, None, join).await;
        Ok((node, handle))
    }

    fn assemble(
        transport: UnicastTransport,
        game: GameState,
        membership: Membership,
        options: NodeOptions,
        my_id: Option<u32>,
    ) -> (Self, NodeHandle) {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let (command_tx, commands) = mpsc::unbounded_channel();

        let published = Arc::new(RwLock::new(Published {
            view: game.view(),
            status: describe(&membership, my_id, transport.local_addr(), None),
        }));
        let handle = NodeHandle::new(command_tx, Arc::clone(&published));

        let node = Self {
            transport,
            directory: PeerDirectory::new(),
            outstanding: OutstandingTable::new(),
            dedup: DedupWindow::new(),
            sequence: MessageSequence::new(),
            membership,
            game,
            options,
            my_id,
            joined: false,
            demotion_seq: None,
            self_demotion_requested: false,
            ended: None,
            running: Arc::new(AtomicBool::new(true)),
            inbound_tx,
            inbound_rx,
            commands,
            commands_open: true,
            published,
        };
        (node, handle)
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.transport.local_addr()
    }

    /// Runs the session until it ends and reports why.
    pub async fn run(mut self) -> SessionEnd {
        let receiver = self
            .transport
            .spawn_receiver(self.inbound_tx.clone(), Arc::clone(&self.running));

        let config = self.game.config().clone();
        let mut resend_interval = interval(config.ping_delay());
        let mut liveness_interval = interval(config.node_timeout());
        let mut tick_interval = interval(config.state_delay());
        let mut announce_interval = interval(ANNOUNCE_INTERVAL);
        for timer in [
            &mut resend_interval,
            &mut liveness_interval,
            &mut tick_interval,
            &mut announce_interval,
        ] {
            timer.set_missed_tick_behavior(MissedTickBehavior::Skip);
        }
        // The first tick of an interval completes immediately.
        liveness_interval.tick().await;
        tick_interval.tick().await;

        info!("Node running on {} as {:?}", self.local_addr(), self.membership.role());
        self.publish().await;

        while self.ended.is_none() {
            tokio::select! {
                datagram = self.inbound_rx.recv() => {
                    if let Some(Datagram { message, from }) = datagram {
                        self.handle_datagram(message, from, Instant::now()).await;
                    }
                },

                command = self.commands.recv(), if self.commands_open => match command {
                    Some(command) => self.handle_command(command).await,
                    None => {
                        debug!("All handles dropped, node keeps running");
                        self.commands_open = false;
                    }
                },

                _ = resend_interval.tick() => self.resend().await,

                _ = liveness_interval.tick() => self.sweep_liveness(Instant::now()).await,

                _ = tick_interval.tick(), if self.membership.is_master() => self.tick().await,

                _ = announce_interval.tick(),
                    if self.membership.is_master() && self.options.announce_group.is_some() =>
                {
                    self.announce().await
                },
            }

            self.publish().await;
        }

        self.running.store(false, Ordering::SeqCst);
        if let Err(e) = receiver.await {
            warn!("Receive loop ended abnormally: {}", e);
        }

        let end = self.ended.clone().unwrap_or(SessionEnd::Exited);
        info!("Node on {} stopped: {}", self.local_addr(), end);
        end
    }

    async fn handle_datagram(&mut self, message: GameMessage, from: SocketAddr, now: Instant) {
        debug!("Received {} #{} from {}", message.kind(), message.msg_seq, from);

        // These are handled before the sender is resolved.
        if message.is_ack() {
            return self.handle_ack(message, from, now).await;
        }
        if matches!(message.body, MessageBody::Join { .. }) {
            return self.handle_join(message, from, now).await;
        }
        if matches!(message.body, MessageBody::Error { .. }) {
            return self.handle_error(message, from).await;
        }
        if matches!(message.body, MessageBody::Announcement(_)) {
            debug!("Ignoring announcement on the game socket from {}", from);
            return;
        }

        let Some(sender_id) = self.resolve_sender(&message, from) else {
            debug!("Dropping {} from unknown endpoint {}", message.kind(), from);
            return;
        };

        self.send_ack(&message, from, sender_id).await;
        if !self.dedup.check_and_record(from, message.msg_seq, now) {
            debug!("Duplicate {} #{} from {}", message.kind(), message.msg_seq, from);
            return;
        }

        match message.body {
            MessageBody::Ping => {}
            MessageBody::Steer { direction } => self.handle_steer(sender_id, direction),
            MessageBody::State { state } => self.handle_state(state, from, now).await,
            MessageBody::RoleChange {
                sender_role,
                receiver_role,
            } => {
                self.handle_role_change(sender_id, from, sender_role, receiver_role, now)
                    .await
            }
            _ => {}
        }
    }

    /// Finds the player id behind `from`. A snapshot from an endpoint we do
    /// not know yet is accepted when its own roster names the sender master.
    fn resolve_sender(&self, message: &GameMessage, from: SocketAddr) -> Option<u32> {
        if let Some(id) = self.directory.id_of(from) {
            return Some(id);
        }
        if self.directory.contains(from) {
            return message.sender_id;
        }

        match (&message.body, message.sender_id) {
            (MessageBody::State { state }, Some(sender_id)) => state
                .players
                .iter()
                .any(|p| p.id == sender_id && p.role == NodeRole::Master)
                .then_some(sender_id),
            _ => None,
        }
    }

    async fn handle_ack(&mut self, message: GameMessage, from: SocketAddr, now: Instant) {
        let known = self
            .directory
            .get(from)
            .map(|peer| (peer.id, peer.role, peer.last_ack.is_some()));
        if let Some((id, role, tracked)) = known {
            if id.is_none() && message.sender_id.is_some() {
                self.directory.upsert(from, message.sender_id, role);
            }
            if tracked {
                self.directory.touch(from, now);
            }
        }

        let Some(acked) = self.outstanding.acknowledge(from, message.msg_seq) else {
            debug!("Unmatched ack #{} from {}", message.msg_seq, from);
            return;
        };

        match acked.body {
            MessageBody::Join { .. } => self.complete_join(from, message.receiver_id, now).await,
            MessageBody::RoleChange { .. } if self.demotion_seq == Some(acked.msg_seq) => {
                self.demotion_seq = None;
                let actions = self.membership.apply(RoleEvent::DemotionConfirmed);
                self.execute(actions, None, now).await;
            }
            _ => {}
        }
    }

    async fn complete_join(&mut self, master: SocketAddr, assigned: Option<u32>, now: Instant) {
        if self.joined {
            return;
        }
        let Some(id) = assigned else {
            warn!("Join acknowledged by {} without a player id", master);
            return;
        };

        self.my_id = Some(id);
        self.joined = true;
        info!("Joined session at {} as player {}", master, id);

        let actions = self.membership.apply(RoleEvent::Joined { master });
        self.execute(actions, None, now).await;
    }

    async fn handle_join(&mut self, message: GameMessage, from: SocketAddr, now: Instant) {
        let MessageBody::Join {
            name,
            only_view,
            player_type,
        } = &message.body
        else {
            return;
        };

        if !self.membership.is_master() {
            debug!("Ignoring join from {}, not the master", from);
            return;
        }
        if let Some(id) = self.directory.id_of(from) {
            self.send_ack(&message, from, id).await;
            return;
        }

        let role = if *only_view {
            NodeRole::Viewer
        } else {
            NodeRole::Normal
        };
        match self.game.add_player(name, *player_type, role, Some(from)) {
            Ok(id) => {
                info!("Admitted {} from {} as player {} ({:?})", name, from, id, role);
                self.directory.upsert(from, Some(id), role);
                self.directory.touch(from, now);
                self.dedup.check_and_record(from, message.msg_seq, now);
                self.send_ack(&message, from, id).await;

                if role == NodeRole::Normal && self.membership.deputy().is_none() {
                    self.promote_deputy(from).await;
                }
            }
            Err(e) => {
                warn!("Rejecting join from {}: {}", from, e);
                let reply = self.message(MessageBody::Error {
                    message: e.to_string(),
                });
                self.send_raw(&reply, from).await;
            }
        }
    }

    async fn handle_error(&mut self, message: GameMessage, from: SocketAddr) {
        let MessageBody::Error { message: reason } = &message.body else {
            return;
        };
        if self.membership.master() != Some(from) {
            debug!("Ignoring error from {}: {}", from, reason);
            return;
        }

        if let Some(id) = self.directory.id_of(from).or(message.sender_id) {
            self.send_ack(&message, from, id).await;
        }
        warn!("Master at {} refused us: {}", from, reason);
        self.finish(SessionEnd::Rejected(reason.clone()));
    }

    fn handle_steer(&mut self, sender_id: u32, direction: Direction) {
        if !self.membership.is_master() {
            debug!("Ignoring steer from player {}, not the master", sender_id);
            return;
        }
        match self.game.steer(sender_id, direction) {
            Ok(true) => debug!("Player {} steers {:?}", sender_id, direction),
            Ok(false) => debug!("Player {} cannot reverse into {:?}", sender_id, direction),
            Err(e) => debug!("Ignoring steer: {}", e),
        }
    }

    async fn handle_state(&mut self, state: GameSnapshot, from: SocketAddr, now: Instant) {
        if self.membership.is_master() {
            debug!("Ignoring state from {} while master", from);
            return;
        }

        match self.game.load_snapshot(state, Some(from.ip())) {
            Ok(true) => {}
            Ok(false) => return,
            Err(e) => {
                warn!("Dropping snapshot from {}: {}", from, e);
                return;
            }
        }

        self.sync_with_roster(from, now).await;
        if self.ended.is_some() {
            return;
        }
        if self.game.is_game_over() {
            self.finish(SessionEnd::GameOver);
            return;
        }
        self.check_own_death(now).await;
    }

    /// Mirrors the freshly loaded roster into the directory and the role
    /// state machine. `from` sent the snapshot, so it is the master.
    async fn sync_with_roster(&mut self, from: SocketAddr, now: Instant) {
        let mut listed = HashSet::from([from]);
        let mut master = None;
        let mut deputy = None;
        let mut own_role = None;

        let roster: Vec<_> = self.game.players().cloned().collect();
        for player in roster {
            if Some(player.id) == self.my_id {
                own_role = Some(player.role);
                continue;
            }
            let endpoint = if player.role == NodeRole::Master {
                from
            } else {
                match player.endpoint() {
                    Some(endpoint) => endpoint,
                    None => continue,
                }
            };

            self.directory.upsert(endpoint, Some(player.id), player.role);
            listed.insert(endpoint);
            match player.role {
                NodeRole::Master => master = Some(endpoint),
                NodeRole::Deputy => deputy = Some(endpoint),
                _ => {}
            }
        }

        if let Some(master) = master {
            let previous = self.membership.master().map(|addr| PreviousMaster {
                addr,
                id: self.directory.id_of(addr),
                alive: true,
            });
            let actions = self.membership.apply(RoleEvent::MasterAnnounced { master });
            self.execute(actions, previous, now).await;
        }
        self.membership.set_deputy(deputy);

        if let Some(role) = own_role.filter(|role| *role != NodeRole::Master) {
            let actions = self.membership.apply(RoleEvent::AssignedRole(role));
            self.execute(actions, None, now).await;
        }

        for gone in self.directory.retain(|peer| listed.contains(&peer.addr)) {
            debug!("Peer at {} left the roster", gone);
            self.outstanding.forget(gone);
            self.dedup.forget(gone);
        }
    }

    /// A player whose snake vanished from the roster asks to watch instead.
    async fn check_own_death(&mut self, now: Instant) {
        let Some(id) = self.my_id else {
            return;
        };
        if !self.joined
            || self.self_demotion_requested
            || self.membership.role() == NodeRole::Viewer
            || self.game.player(id).is_some()
        {
            return;
        }

        info!("Our snake crashed, switching to viewer");
        self.self_demotion_requested = true;
        let actions = self
            .membership
            .apply(RoleEvent::DemotionRequested { exit: false });
        self.execute(actions, None, now).await;
    }

    async fn handle_role_change(
        &mut self,
        sender_id: u32,
        from: SocketAddr,
        sender_role: Option<NodeRole>,
        receiver_role: Option<NodeRole>,
        now: Instant,
    ) {
        debug!(
            "Role change from player {}: sender {:?}, receiver {:?}",
            sender_id, sender_role, receiver_role
        );

        if self.membership.is_master() {
            if sender_role == Some(NodeRole::Viewer) {
                self.handle_player_left(sender_id, from, now).await;
            }
            return;
        }

        let from_master = self.membership.master() == Some(from);
        if from_master
            && sender_role == Some(NodeRole::Viewer)
            && receiver_role == Some(NodeRole::Master)
        {
            info!("Master at {} handed the session over to us", from);
            self.directory.upsert(from, Some(sender_id), NodeRole::Viewer);
            let previous = PreviousMaster {
                addr: from,
                id: Some(sender_id),
                alive: true,
            };
            let actions = self.membership.apply(RoleEvent::AssignedRole(NodeRole::Master));
            self.execute(actions, Some(previous), now).await;
            return;
        }

        let mut from_master = from_master;
        if sender_role == Some(NodeRole::Master) {
            let previous = self.membership.master().map(|addr| PreviousMaster {
                addr,
                id: self.directory.id_of(addr),
                alive: true,
            });
            self.directory.upsert(from, Some(sender_id), NodeRole::Master);
            let actions = self
                .membership
                .apply(RoleEvent::MasterAnnounced { master: from });
            self.execute(actions, previous, now).await;
            from_master = true;
        }

        match receiver_role {
            Some(role) if from_master && role != NodeRole::Master => {
                info!("Assigned role {:?}", role);
                let actions = self.membership.apply(RoleEvent::AssignedRole(role));
                self.execute(actions, None, now).await;
            }
            _ => {}
        }
    }

    /// Master side of a player switching to viewer.
    async fn handle_player_left(&mut self, player_id: u32, from: SocketAddr, now: Instant) {
        info!("Player {} at {} is now a viewer", player_id, from);
        self.game.make_viewer(player_id);
        self.directory.set_role(from, NodeRole::Viewer);

        if self.membership.deputy() == Some(from) {
            let actions = self.membership.apply(RoleEvent::DeputyLost);
            self.execute(actions, None, now).await;
        }
    }

    async fn sweep_liveness(&mut self, now: Instant) {
        let timeout = self.game.config().node_timeout();
        self.dedup.prune(now, timeout);

        for addr in self.directory.timed_out(now, timeout) {
            self.handle_peer_lost(addr, now).await;
            if self.ended.is_some() {
                break;
            }
        }
    }

    async fn handle_peer_lost(&mut self, addr: SocketAddr, now: Instant) {
        let Some(peer) = self.directory.get(addr).cloned() else {
            return;
        };
        warn!("Peer {:?} at {} stopped answering", peer.id, addr);

        if self.membership.is_master() {
            self.drop_peer(addr);
            if let Some(id) = peer.id {
                self.game.zombify_player(id);
            }
            if self.membership.deputy() == Some(addr) {
                let actions = self.membership.apply(RoleEvent::DeputyLost);
                self.execute(actions, None, now).await;
            }
            return;
        }

        if self.membership.master() != Some(addr) {
            self.drop_peer(addr);
            return;
        }
        if !self.joined {
            self.finish(SessionEnd::JoinTimedOut);
            return;
        }

        let known_deputy = self.membership.deputy().filter(|deputy| *deputy != addr);
        let previous = PreviousMaster {
            addr,
            id: peer.id,
            alive: false,
        };
        let actions = self.membership.apply(RoleEvent::MasterLost { known_deputy });
        self.execute(actions, Some(previous), now).await;
    }

    async fn execute(
        &mut self,
        actions: Vec<RoleAction>,
        previous: Option<PreviousMaster>,
        now: Instant,
    ) {
        for action in actions {
            debug!("Role action {:?}", action);
            match action {
                RoleAction::BecomeMaster => self.become_master(previous, now).await,
                RoleAction::FollowMaster(master) => {
                    self.follow_master(previous.map(|p| p.addr), master, now)
                }
                RoleAction::SelectDeputy => self.select_deputy().await,
                RoleAction::RequestDemotion { to } => self.request_demotion(to).await,
                RoleAction::FinalizeDemotion => self.finalize_demotion(),
                RoleAction::ReplaySteersLocally => self.replay_steers(previous.map(|p| p.addr)),
                RoleAction::Terminate(end) => self.finish(end),
            }
        }
    }

    async fn become_master(&mut self, previous: Option<PreviousMaster>, now: Instant) {
        info!("Taking over as master on {}", self.local_addr());
        if let Some(previous) = previous {
            self.replay_steers(Some(previous.addr));
        }

        let stale: Vec<u32> = self
            .game
            .players()
            .filter(|p| p.role == NodeRole::Master && Some(p.id) != self.my_id)
            .map(|p| p.id)
            .collect();
        for id in stale {
            let handed_over = previous.map_or(false, |p| {
                p.alive && (p.id == Some(id) || self.directory.id_of(p.addr) == Some(id))
            });
            let addr = self.directory.addr_of(id);
            if handed_over {
                self.game.make_viewer(id);
                if let Some(addr) = addr {
                    self.directory.set_role(addr, NodeRole::Viewer);
                }
            } else {
                self.game.zombify_player(id);
                if let Some(addr) = addr {
                    self.drop_peer(addr);
                }
            }
        }
        if let Some(previous) = previous.filter(|p| !p.alive) {
            self.drop_peer(previous.addr);
        }

        if let Some(id) = self.my_id {
            self.game.set_role(id, NodeRole::Master);
        }
        self.directory.track_all(now);
        if self.membership.deputy().is_none() {
            self.choose_deputy();
        }

        for (addr, id) in self.directory.tracked() {
            let role = self.roster_role(id);
            self.directory.set_role(addr, role);
            let body = MessageBody::RoleChange {
                sender_role: Some(NodeRole::Master),
                receiver_role: Some(role),
            };
            self.send_tracked(addr, id, body).await;
        }
    }

    fn follow_master(&mut self, previous: Option<SocketAddr>, master: SocketAddr, now: Instant) {
        let receiver_id = self.directory.id_of(master);
        if let Some(old) = previous.filter(|old| *old != master) {
            self.outstanding.retarget(old, master, receiver_id);
        }
        self.directory.upsert(master, receiver_id, NodeRole::Master);
        self.directory.track_only(master, now);
        info!("Following master at {}", master);
    }

    /// Role of player `id` as the roster has it; anyone missing only watches.
    fn roster_role(&self, id: Option<u32>) -> NodeRole {
        id.and_then(|id| self.game.player(id))
            .map(|player| player.role)
            .unwrap_or(NodeRole::Viewer)
    }

    /// Marks the first eligible tracked peer deputy without telling it.
    fn choose_deputy(&mut self) -> Option<SocketAddr> {
        let candidates: Vec<(SocketAddr, NodeRole)> = self
            .directory
            .peers()
            .into_iter()
            .filter(|peer| peer.last_ack.is_some())
            .map(|peer| (peer.addr, self.roster_role(peer.id)))
            .collect();
        let deputy = pick_deputy(candidates)?;

        if let Some(id) = self.directory.id_of(deputy) {
            self.game.set_role(id, NodeRole::Deputy);
        }
        self.directory.set_role(deputy, NodeRole::Deputy);
        self.membership.set_deputy(Some(deputy));
        info!("Selected {} as deputy", deputy);
        Some(deputy)
    }

    async fn select_deputy(&mut self) {
        match self.choose_deputy() {
            Some(deputy) => self.announce_deputy(deputy).await,
            None => debug!("No player left to serve as deputy"),
        }
    }

    async fn promote_deputy(&mut self, addr: SocketAddr) {
        if let Some(id) = self.directory.id_of(addr) {
            self.game.set_role(id, NodeRole::Deputy);
        }
        self.directory.set_role(addr, NodeRole::Deputy);
        self.membership.set_deputy(Some(addr));
        info!("Promoted {} to deputy", addr);
        self.announce_deputy(addr).await;
    }

    async fn announce_deputy(&mut self, deputy: SocketAddr) {
        let receiver_id = self.directory.id_of(deputy);
        let body = MessageBody::RoleChange {
            sender_role: Some(NodeRole::Master),
            receiver_role: Some(NodeRole::Deputy),
        };
        self.send_tracked(deputy, receiver_id, body).await;
    }

    async fn request_demotion(&mut self, to: SocketAddr) {
        info!("Asking {} to take us as a viewer", to);
        let receiver_id = self.directory.id_of(to);
        let body = MessageBody::RoleChange {
            sender_role: Some(NodeRole::Viewer),
            receiver_role: Some(NodeRole::Master),
        };
        let seq = self.send_tracked(to, receiver_id, body).await;
        self.demotion_seq = Some(seq);
    }

    fn finalize_demotion(&mut self) {
        info!("Now watching as a viewer");
        if let Some(id) = self.my_id {
            self.game.make_viewer(id);
        }
    }

    /// Applies steers that never reached the lost master to the local game.
    fn replay_steers(&mut self, previous: Option<SocketAddr>) {
        let (Some(old), Some(id)) = (previous, self.my_id) else {
            return;
        };
        for message in self.outstanding.drain(old) {
            if let MessageBody::Steer { direction } = message.body {
                match self.game.steer(id, direction) {
                    Ok(_) => debug!("Replayed steer {:?} locally", direction),
                    Err(e) => debug!("Could not replay steer: {}", e),
                }
            }
        }
    }

    async fn tick(&mut self) {
        let crashed = self.game.tick();
        if !crashed.is_empty() {
            info!("Crashed this tick: {:?}", crashed);
        }
        self.broadcast_state().await;

        if self.game.is_game_over() {
            self.finish(SessionEnd::GameOver);
            return;
        }

        let own_crash = self.my_id.map_or(false, |id| crashed.contains(&id));
        if own_crash && !self.self_demotion_requested {
            info!("Our snake crashed, handing the session over");
            self.self_demotion_requested = true;
            let actions = self
                .membership
                .apply(RoleEvent::DemotionRequested { exit: false });
            self.execute(actions, None, Instant::now()).await;
        }
    }

    async fn broadcast_state(&mut self) {
        let snapshot = self.game.next_snapshot();
        debug!("Broadcasting state {}", snapshot.state_order);

        for (addr, id) in self.directory.tracked() {
            let body = MessageBody::State {
                state: snapshot.clone(),
            };
            self.send_tracked(addr, id, body).await;
        }
    }

    async fn announce(&mut self) {
        let Some(group) = self.options.announce_group else {
            return;
        };
        let announcement = GameAnnouncement {
            players: self.game.players().cloned().collect(),
            config: self.game.config().clone(),
            can_join: self.game.can_join(),
        };
        let message = self.message(MessageBody::Announcement(announcement));
        self.send_raw(&message, group).await;
    }

    async fn resend(&mut self) {
        let targets = self.directory.tracked();
        let batch = self
            .outstanding
            .resend_batch(&targets, &mut self.sequence, self.my_id);
        for (addr, message) in batch {
            self.send_raw(&message, addr).await;
        }
    }

    async fn handle_command(&mut self, command: NodeCommand) {
        debug!("Command {:?}", command);
        match command {
            NodeCommand::Steer(direction) => self.steer_local(direction).await,
            NodeCommand::BecomeViewer => self.request_viewer(false).await,
            NodeCommand::Exit => self.request_viewer(true).await,
        }
    }

    async fn steer_local(&mut self, direction: Direction) {
        let Some(id) = self.my_id else {
            return;
        };

        if self.membership.is_master() {
            if let Err(e) = self.game.steer(id, direction) {
                debug!("Ignoring local steer: {}", e);
            }
        } else if self.membership.role() != NodeRole::Viewer {
            if let Some(master) = self.membership.master() {
                let receiver_id = self.directory.id_of(master);
                self.send_tracked(master, receiver_id, MessageBody::Steer { direction })
                    .await;
            }
        }
    }

    async fn request_viewer(&mut self, exit: bool) {
        if !self.joined {
            if exit {
                self.finish(SessionEnd::Exited);
            }
            return;
        }
        let actions = self.membership.apply(RoleEvent::DemotionRequested { exit });
        self.execute(actions, None, Instant::now()).await;
    }

    fn finish(&mut self, end: SessionEnd) {
        if self.ended.is_none() {
            info!("Session over: {}", end);
            self.ended = Some(end);
        }
    }

    async fn publish(&self) {
        let mut published = self.published.write().await;
        published.view = self.game.view();
        published.status = describe(
            &self.membership,
            self.my_id,
            self.local_addr(),
            self.ended.clone(),
        );
    }

    fn drop_peer(&mut self, addr: SocketAddr) {
        self.directory.remove(addr);
        self.outstanding.forget(addr);
        self.dedup.forget(addr);
    }

    fn message(&mut self, body: MessageBody) -> GameMessage {
        GameMessage::new(self.sequence.next(), body).with_sender(self.my_id)
    }

    async fn send_ack(&self, message: &GameMessage, to: SocketAddr, receiver_id: u32) {
        let ack = GameMessage::ack_for(message, self.my_id, receiver_id);
        self.send_raw(&ack, to).await;
    }

    /// Sends `body` now and keeps it for retransmission until acknowledged.
    async fn send_tracked(
        &mut self,
        to: SocketAddr,
        receiver_id: Option<u32>,
        body: MessageBody,
    ) -> u64 {
        let message = self.message(body).with_receiver(receiver_id);
        let seq = message.msg_seq;
        self.send_raw(&message, to).await;
        self.outstanding.track(to, message);
        seq
    }

    async fn send_raw(&self, message: &GameMessage, to: SocketAddr) {
        if let Err(e) = self.transport.send(message, to).await {
            error!("Failed to send {} to {}: {}", message.kind(), to, e);
        }
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
    }
}

fn describe(
    membership: &Membership,
    player_id: Option<u32>,
    local_addr: SocketAddr,
    ended: Option<SessionEnd>,
) -> NodeStatus {
    let master = if membership.is_master() {
        Some(local_addr)
    } else {
        membership.master()
    };
    NodeStatus {
        role: membership.role(),
        player_id,
        master,
        deputy: membership.deputy(),
        local_addr,
        ended,
    }
}
