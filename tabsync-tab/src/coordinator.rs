use std::{sync::Arc, time::Duration};

use rand::Rng;
use serde_json::Value;
use tabsync_core::{
    Claim, ElectionRecord, StateSnapshot, TOPIC_ELECTION, TOPIC_PRESENCE, TOPIC_REPLICATION,
    TabId, TabMessage, Term, Version, decode_message, encode_message,
};
use tokio::{
    sync::{broadcast, mpsc, oneshot, watch},
    task::JoinHandle,
    time::{Instant, sleep_until},
};
use tracing::{Instrument, debug, info, info_span, warn};

use crate::{
    clock::Clock,
    config::CoordinatorConfig,
    dispatcher::{LoggingNotice, LoggingSession, Role, RoleDispatcher, SessionOwner, TabNotice},
    election::{ElectionLedger, ElectionState, RefreshOutcome, record_is_followable},
    error::SyncError,
    liveness::{LivenessMonitor, LivenessTick},
    replication::{DeltaDecision, Replica, RetryDecision},
    state::{JsonStateStore, StateStore},
    store::FlagStore,
    transport::{BroadcastTransport, Delivery, Subscription},
};

const EVENT_CAPACITY: usize = 64;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CoordinatorEvent {
    RoleChanged { from: Role, to: Role },
    MasterChanged { master: Option<TabId>, term: Term },
    PeerTimedOut(TabId),
    ActivationChanged { active: bool },
    StateApplied { version: Version },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElectionPhase {
    Standalone,
    Discovering,
    Claiming,
    Master,
    Follower,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TabStatus {
    pub role: Role,
    pub phase: ElectionPhase,
    pub term: Term,
    pub master: Option<TabId>,
    pub window_active: bool,
    pub version: Option<Version>,
    pub peers: Vec<TabId>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitOutcome {
    Applied { version: Version },
    Forwarded,
}

enum Command {
    Commit {
        patch: Value,
        reply: oneshot::Sender<Result<CommitOutcome, SyncError>>,
    },
    SetWindowActive(bool),
    Shutdown {
        reply: oneshot::Sender<()>,
    },
}

pub struct TabCoordinator {
    config: CoordinatorConfig,
    transport: Arc<dyn BroadcastTransport>,
    flags: Arc<dyn FlagStore>,
    state: Box<dyn StateStore>,
    session: Box<dyn SessionOwner>,
    notice: Box<dyn TabNotice>,
    tab_id: Option<TabId>,
    clock: Option<Clock>,
    window_active: bool,
}

impl TabCoordinator {
    pub fn new(
        config: CoordinatorConfig,
        transport: Arc<dyn BroadcastTransport>,
        flags: Arc<dyn FlagStore>,
    ) -> Self {
        Self {
            config,
            transport,
            flags,
            state: Box::new(JsonStateStore::new()),
            session: Box::new(LoggingSession),
            notice: Box::new(LoggingNotice),
            tab_id: None,
            clock: None,
            window_active: true,
        }
    }

    pub fn with_state_store(mut self, state: impl StateStore + 'static) -> Self {
        self.state = Box::new(state);
        self
    }

    pub fn with_session_owner(mut self, session: impl SessionOwner + 'static) -> Self {
        self.session = Box::new(session);
        self
    }

    pub fn with_tab_notice(mut self, notice: impl TabNotice + 'static) -> Self {
        self.notice = Box::new(notice);
        self
    }

    pub fn with_tab_id(mut self, tab_id: TabId) -> Self {
        self.tab_id = Some(tab_id);
        self
    }

    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn window_active(mut self, active: bool) -> Self {
        self.window_active = active;
        self
    }

    pub fn spawn(self) -> Result<CoordinatorHandle, SyncError> {
        self.config
            .validate()
            .map_err(|err| SyncError::Config(err.to_string()))?;

        let tab_id = self.tab_id.unwrap_or_else(TabId::generate);
        let clock = self.clock.unwrap_or_default();
        let standalone = !self.transport.is_available();
        let (events_tx, _) = broadcast::channel(EVENT_CAPACITY);
        let (command_tx, command_rx) = mpsc::unbounded_channel();

        let mut liveness = LivenessMonitor::new(
            tab_id.clone(),
            self.config.heartbeat_timeout(),
            self.window_active,
        );
        let timeout_events = events_tx.clone();
        liveness.on_peer_timeout(move |peer| {
            let _ = timeout_events.send(CoordinatorEvent::PeerTimedOut(peer.clone()));
        });
        let activation_events = events_tx.clone();
        liveness.on_local_activation_change(move |active| {
            let _ = activation_events.send(CoordinatorEvent::ActivationChanged { active });
        });

        let subscriptions = Subscriptions {
            election: self.transport.subscribe(TOPIC_ELECTION),
            presence: self.transport.subscribe(TOPIC_PRESENCE),
            replication: self.transport.subscribe(TOPIC_REPLICATION),
        };

        // Without the policy, or without other tabs, a background window is
        // still the active tab.
        let active = self.window_active || !self.config.single_active_tab || standalone;
        let dispatcher =
            RoleDispatcher::new(self.session, self.notice, events_tx.clone(), active);
        let initial = TabStatus {
            role: dispatcher.role(),
            phase: if standalone {
                ElectionPhase::Standalone
            } else {
                ElectionPhase::Discovering
            },
            term: 0,
            master: None,
            window_active: self.window_active,
            version: None,
            peers: Vec::new(),
        };
        let (status_tx, status_rx) = watch::channel(initial);

        let engine = Engine {
            ledger: ElectionLedger::new(self.flags, &self.config.namespace),
            replica: Replica::new(self.config.snapshot_timeout(), self.config.snapshot_attempts),
            tab_id: tab_id.clone(),
            config: self.config,
            clock,
            transport: self.transport,
            state: self.state,
            dispatcher,
            liveness,
            election: None,
            highest_term: 0,
            standalone,
            request_seq: 0,
            status_tx,
            events: events_tx.clone(),
        };

        let span = info_span!("tab", tab_id = %tab_id);
        let task = tokio::spawn(engine.run(command_rx, subscriptions).instrument(span));

        Ok(CoordinatorHandle {
            tab_id,
            multi_tab: !standalone,
            commands: command_tx,
            status: status_rx,
            events: events_tx,
            task: Some(task),
        })
    }
}

/// Control surface of a running coordinator. Dropping it without
/// [`shutdown`](Self::shutdown) aborts the task, which peers observe as a
/// crash.
pub struct CoordinatorHandle {
    tab_id: TabId,
    multi_tab: bool,
    commands: mpsc::UnboundedSender<Command>,
    status: watch::Receiver<TabStatus>,
    events: broadcast::Sender<CoordinatorEvent>,
    task: Option<JoinHandle<()>>,
}

impl CoordinatorHandle {
    pub fn tab_id(&self) -> &TabId {
        &self.tab_id
    }

    pub fn role(&self) -> Role {
        self.status.borrow().role
    }

    pub fn status(&self) -> TabStatus {
        self.status.borrow().clone()
    }

    pub fn watch_status(&self) -> watch::Receiver<TabStatus> {
        self.status.clone()
    }

    pub fn events(&self) -> broadcast::Receiver<CoordinatorEvent> {
        self.events.subscribe()
    }

    pub fn on_role_change(
        &self,
        mut handler: impl FnMut(Role, Role) + Send + 'static,
    ) -> JoinHandle<()> {
        let mut events = self.events.subscribe();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(CoordinatorEvent::RoleChanged { from, to }) => handler(from, to),
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "role change listener lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    pub fn is_multi_tab_capable(&self) -> bool {
        self.multi_tab
    }

    pub async fn commit(&self, patch: Value) -> Result<CommitOutcome, SyncError> {
        let (reply, response) = oneshot::channel();
        self.commands
            .send(Command::Commit { patch, reply })
            .map_err(|_| SyncError::Closed)?;
        response.await.map_err(|_| SyncError::Closed)?
    }

    pub fn set_window_active(&self, active: bool) -> Result<(), SyncError> {
        self.commands
            .send(Command::SetWindowActive(active))
            .map_err(|_| SyncError::Closed)
    }

    pub async fn shutdown(mut self) {
        let (reply, done) = oneshot::channel();
        if self.commands.send(Command::Shutdown { reply }).is_ok() {
            let _ = done.await;
        }
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }

    pub fn abort(mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

impl Drop for CoordinatorHandle {
    fn drop(&mut self) {
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

struct Subscriptions {
    election: Subscription,
    presence: Subscription,
    replication: Subscription,
}

struct Engine {
    tab_id: TabId,
    config: CoordinatorConfig,
    clock: Clock,
    transport: Arc<dyn BroadcastTransport>,
    ledger: ElectionLedger,
    state: Box<dyn StateStore>,
    dispatcher: RoleDispatcher,
    liveness: LivenessMonitor,
    replica: Replica,
    election: Option<ElectionState>,
    highest_term: Term,
    standalone: bool,
    request_seq: u32,
    status_tx: watch::Sender<TabStatus>,
    events: broadcast::Sender<CoordinatorEvent>,
}

impl Engine {
    async fn run(
        mut self,
        mut commands: mpsc::UnboundedReceiver<Command>,
        mut subscriptions: Subscriptions,
    ) {
        if self.standalone {
            self.run_standalone(commands).await;
            return;
        }

        let mut timers = self
            .liveness
            .start(self.config.heartbeat_interval(), self.config.sweep_interval());
        self.start();
        self.publish_status();

        loop {
            let election_deadline = self.election.as_ref().and_then(ElectionState::deadline);
            let snapshot_deadline = self.replica.deadline();

            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Shutdown { reply }) => {
                        self.shutdown();
                        let _ = reply.send(());
                        break;
                    }
                    Some(command) => self.handle_command(command),
                    None => break,
                },
                Some(delivery) = subscriptions.election.recv() => self.handle_delivery(delivery),
                Some(delivery) = subscriptions.presence.recv() => self.handle_delivery(delivery),
                Some(delivery) = subscriptions.replication.recv() => self.handle_delivery(delivery),
                tick = timers.tick() => match tick {
                    LivenessTick::Beacon => self.on_beacon_tick(),
                    LivenessTick::Sweep => self.on_sweep_tick(),
                },
                _ = sleep_until_some(election_deadline) => self.on_election_deadline(),
                _ = sleep_until_some(snapshot_deadline) => self.on_snapshot_deadline(),
            }

            self.publish_status();
        }
    }

    async fn run_standalone(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        info!("no broadcast medium, running as a single tab");
        let version = self.state.get_snapshot().version;
        self.replica.mark_applied(version);
        self.dispatcher.promote();
        self.publish_status();

        while let Some(command) = commands.recv().await {
            if let Command::Shutdown { reply } = command {
                self.shutdown();
                let _ = reply.send(());
                break;
            }
            self.handle_command(command);
            self.publish_status();
        }
    }

    fn start(&mut self) {
        self.send(&TabMessage::Discover {
            from: self.tab_id.clone(),
        });
        if self.config.single_active_tab && self.liveness.is_local_active() {
            self.claim_active_window();
        }

        if let Some(record) = self.read_record()
            && self.is_followable(&record)
        {
            self.follow_record(&record, "fresh election record");
            return;
        }

        match self.ledger.multi_tab_engaged() {
            Ok(false) => {
                debug!("no other tab has been seen, claiming at once");
                self.claim();
            }
            Ok(true) => self.enter_discovery(),
            Err(err) => {
                warn!(%err, "multi-tab flag unreadable, running discovery");
                self.enter_discovery();
            }
        }
    }

    fn enter_discovery(&mut self) {
        let deadline = Instant::now() + self.config.discovery_window();
        self.election = Some(ElectionState::Discovering { deadline });
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Commit { patch, reply } => {
                let _ = reply.send(self.commit(patch));
            }
            Command::SetWindowActive(active) => self.set_window_active(active),
            // Handled by the run loops.
            Command::Shutdown { reply } => {
                let _ = reply.send(());
            }
        }
    }

    fn commit(&mut self, patch: Value) -> Result<CommitOutcome, SyncError> {
        if self.config.single_active_tab && !self.dispatcher.is_active() {
            return Err(SyncError::TabInactive);
        }
        if self.standalone {
            let version = self.apply_local_mutation(&patch);
            return Ok(CommitOutcome::Applied { version });
        }
        match &self.election {
            Some(ElectionState::Master { .. }) => {
                let version = self.apply_local_mutation(&patch);
                Ok(CommitOutcome::Applied { version })
            }
            Some(ElectionState::Follower { leader }) => {
                debug!(master = %leader.tab_id, "forwarding patch to master");
                self.send(&TabMessage::Propose {
                    from: self.tab_id.clone(),
                    patch,
                });
                Ok(CommitOutcome::Forwarded)
            }
            _ => Err(SyncError::NoMaster),
        }
    }

    fn apply_local_mutation(&mut self, patch: &Value) -> Version {
        let version = self.replica.last_applied().unwrap_or(0) + 1;
        self.state.apply_delta(version, patch);
        self.replica.mark_applied(version);
        self.emit(CoordinatorEvent::StateApplied { version });

        if let Some(ElectionState::Master { claim }) = &self.election {
            self.send(&TabMessage::Delta {
                from: self.tab_id.clone(),
                term: claim.term,
                version,
                patch: patch.clone(),
            });
        }
        version
    }

    fn set_window_active(&mut self, active: bool) {
        self.liveness.set_local_active(active);
        if active && self.config.single_active_tab {
            if !self.standalone {
                self.claim_active_window();
            }
            self.dispatcher.mark_active();
        }
    }

    fn claim_active_window(&self) {
        self.send(&TabMessage::ClaimActive {
            from: self.tab_id.clone(),
            at: self.clock.now_ms(),
        });
    }

    fn handle_delivery(&mut self, delivery: Delivery) {
        let message = match decode_message(&delivery.payload) {
            Ok(message) => message,
            Err(err) => {
                warn!(sender = %delivery.sender, %err, "dropping undecodable message");
                return;
            }
        };
        if *message.sender() != delivery.sender {
            debug!(sender = %delivery.sender, "dropping message with forged sender");
            return;
        }

        match message {
            TabMessage::Discover { from } => self.on_discover(from),
            TabMessage::MasterHere(claim) => self.on_master_here(claim),
            TabMessage::Goodbye { from, master_term } => self.on_goodbye(from, master_term),
            TabMessage::Beacon(beacon) => {
                let is_new = self.liveness.observe_beacon(&beacon, Instant::now());
                if is_new {
                    debug!(peer = %beacon.tab_id, "new peer");
                    if self.is_master() {
                        self.engage_multi_tab();
                    }
                }
            }
            TabMessage::ClaimActive { from, at } => {
                if self.config.single_active_tab {
                    debug!(peer = %from, at, "another tab became the active window");
                    self.liveness.set_local_active(false);
                    self.dispatcher.mark_inactive();
                }
            }
            TabMessage::SnapshotRequest { from, request_id } => {
                self.on_snapshot_request(from, request_id);
            }
            TabMessage::Snapshot {
                from,
                term,
                to,
                snapshot,
            } => self.on_snapshot(from, term, to, snapshot),
            TabMessage::Delta {
                from,
                term,
                version,
                patch,
            } => self.on_delta(from, term, version, patch),
            TabMessage::Propose { from, patch } => {
                if self.is_master() {
                    debug!(peer = %from, "applying proposal");
                    self.apply_local_mutation(&patch);
                }
            }
        }
    }

    fn on_discover(&mut self, from: TabId) {
        if let Some(ElectionState::Master { claim }) = &self.election {
            debug!(peer = %from, "answering discovery");
            self.send(&TabMessage::MasterHere(claim.clone()));
            self.engage_multi_tab();
        }
    }

    fn on_master_here(&mut self, rival: Claim) {
        if rival.tab_id == self.tab_id {
            return;
        }
        // A master re-asserts itself to any claim it outranks, stale ones
        // included, so the claimer backs off.
        if let Some(ElectionState::Master { claim }) = &self.election
            && !rival.outranks(claim)
        {
            let claim = claim.clone();
            debug!(peer = %rival.tab_id, term = rival.term, "re-asserting mastership");
            self.send(&TabMessage::MasterHere(claim));
            return;
        }
        if rival.term < self.highest_term {
            debug!(peer = %rival.tab_id, term = rival.term, highest = self.highest_term, "ignoring stale claim");
            return;
        }

        match self.election.clone() {
            Some(ElectionState::Discovering { .. }) => self.follow(rival, "master answered discovery"),
            Some(ElectionState::Claiming {
                claim,
                settle_at,
                beaten_by,
            }) => {
                if rival.term > claim.term {
                    self.follow(rival, "higher term claimed while settling");
                } else if rival.outranks(&claim) {
                    let winner = match beaten_by {
                        Some(current) if current.outranks(&rival) => current,
                        _ => rival,
                    };
                    self.observe_term(winner.term);
                    self.election = Some(ElectionState::Claiming {
                        claim,
                        settle_at,
                        beaten_by: Some(winner),
                    });
                }
            }
            Some(ElectionState::Master { .. }) => self.follow(rival, "outranked by another master"),
            Some(ElectionState::Follower { leader }) => {
                if rival.tab_id == leader.tab_id {
                    self.liveness.expect_peer(&rival.tab_id, Instant::now());
                    if rival.term > leader.term {
                        self.follow(rival, "master advanced its term");
                    }
                } else if rival.outranks(&leader) {
                    self.follow(rival, "new master announced");
                }
            }
            None => {}
        }
    }

    fn on_goodbye(&mut self, from: TabId, master_term: Option<Term>) {
        self.liveness.forget(&from);
        if let Some(ElectionState::Follower { leader }) = &self.election
            && leader.tab_id == from
            && master_term.is_some_and(|term| term >= leader.term)
        {
            info!(master = %from, "master closed");
            self.on_master_lost(from);
        }
    }

    fn on_snapshot_request(&mut self, from: TabId, request_id: u32) {
        let Some(ElectionState::Master { claim }) = &self.election else {
            return;
        };
        let term = claim.term;
        let snapshot = self.state.get_snapshot();
        debug!(peer = %from, request_id, version = snapshot.version, "serving snapshot");
        self.send(&TabMessage::Snapshot {
            from: self.tab_id.clone(),
            term,
            to: Some(from),
            snapshot,
        });
    }

    fn on_snapshot(&mut self, from: TabId, term: Term, to: Option<TabId>, snapshot: StateSnapshot) {
        if to.as_ref().is_some_and(|to| *to != self.tab_id) {
            return;
        }
        if term < self.highest_term {
            debug!(peer = %from, term, "ignoring snapshot from a stale term");
            return;
        }
        let Some(ElectionState::Follower { leader }) = &self.election else {
            return;
        };
        if leader.tab_id != from || leader.term != term {
            debug!(peer = %from, term, "ignoring snapshot from a tab that is not our master");
            return;
        }
        if let Err(err) = snapshot.verify() {
            warn!(peer = %from, %err, "discarding corrupt snapshot");
            return;
        }

        let version = snapshot.version;
        if !self.replica.accept_snapshot(version) {
            debug!(version, last_applied = ?self.replica.last_applied(), "snapshot not newer than applied state");
            return;
        }
        self.state.apply_snapshot(snapshot);
        self.replica.mark_applied(version);
        info!(version, master = %from, "applied snapshot");
        self.emit(CoordinatorEvent::StateApplied { version });
    }

    fn on_delta(&mut self, from: TabId, term: Term, version: Version, patch: Value) {
        if term < self.highest_term {
            debug!(peer = %from, term, version, "ignoring delta from a stale term");
            return;
        }
        let Some(ElectionState::Follower { leader }) = &self.election else {
            return;
        };
        if leader.tab_id != from || leader.term != term {
            debug!(peer = %from, term, version, "ignoring delta from a tab that is not our master");
            return;
        }

        match self.replica.classify_delta(version) {
            DeltaDecision::Apply => {
                self.state.apply_delta(version, &patch);
                self.replica.mark_applied(version);
                self.emit(CoordinatorEvent::StateApplied { version });
            }
            DeltaDecision::Duplicate => debug!(version, "dropping delta already applied"),
            DeltaDecision::AwaitingSnapshot => self.request_snapshot(),
            DeltaDecision::Gap { expected, got } => {
                let gap = SyncError::StaleDelta { expected, got };
                warn!(error = %gap, "resyncing from snapshot");
                self.request_snapshot();
            }
        }
    }

    fn on_beacon_tick(&mut self) {
        let beacon = self
            .liveness
            .beacon(self.clock.now_ms(), self.replica.last_applied());
        self.send(&TabMessage::Beacon(beacon));

        let Some(ElectionState::Master { claim }) = &self.election else {
            return;
        };
        let claim = claim.clone();
        match self.ledger.refresh(&claim, self.clock.now_ms()) {
            Ok(RefreshOutcome::Refreshed) => {}
            Ok(RefreshOutcome::Superseded(record)) => {
                self.follow_record(&record, "election record superseded");
            }
            Err(err) => warn!(%err, "failed to refresh election record"),
        }
    }

    fn on_sweep_tick(&mut self) {
        let expired = self.liveness.sweep_timeouts(Instant::now());
        for peer in expired {
            if let Some(ElectionState::Follower { leader }) = &self.election
                && leader.tab_id == peer
            {
                info!(master = %peer, term = leader.term, "master timed out");
                self.on_master_lost(peer);
            } else {
                debug!(%peer, "peer timed out");
            }
        }
    }

    fn on_election_deadline(&mut self) {
        match self.election.clone() {
            Some(ElectionState::Discovering { .. }) => {
                if let Some(record) = self.read_record()
                    && self.is_followable(&record)
                {
                    self.follow_record(&record, "election record after discovery");
                } else {
                    self.claim();
                }
            }
            Some(ElectionState::Claiming {
                claim, beaten_by, ..
            }) => self.settle_claim(claim, beaten_by),
            _ => {}
        }
    }

    fn on_snapshot_deadline(&mut self) {
        match self.replica.on_request_timeout(Instant::now()) {
            RetryDecision::Retry { attempt } => {
                debug!(attempt, "snapshot request timed out, retrying");
                self.send_snapshot_request();
            }
            RetryDecision::GaveUp { attempts } => {
                let timeout = SyncError::SnapshotTimeout { attempts };
                warn!(error = %timeout, "giving up on snapshot");
                if self.replica.last_applied().is_none() {
                    info!("cold start with empty state");
                    self.state.apply_snapshot(StateSnapshot::empty());
                    self.replica.mark_applied(0);
                    self.emit(CoordinatorEvent::StateApplied { version: 0 });
                }
            }
        }
    }

    fn claim(&mut self) {
        let record = self.read_record();
        let base = record.as_ref().map_or(0, |record| record.term).max(self.highest_term);
        let now_ms = self.clock.now_ms();
        let claim = Claim {
            tab_id: self.tab_id.clone(),
            term: base + 1,
            claimed_at: now_ms,
        };

        let expected = record.map(|record| record.term);
        match self
            .ledger
            .compare_and_set(expected, &ElectionRecord::from_claim(&claim, now_ms))
        {
            Ok(true) => {}
            Ok(false) => {
                if let Some(record) = self.read_record()
                    && self.is_followable(&record)
                {
                    self.follow_record(&record, "lost the race for the election record");
                    return;
                }
            }
            Err(err) => warn!(%err, "failed to write election record, claiming anyway"),
        }

        self.observe_term(claim.term);
        info!(term = claim.term, "claiming mastership");
        self.send(&TabMessage::MasterHere(claim.clone()));

        let jitter = rand::rng().random_range(0..=self.config.claim_jitter_ms);
        let settle_at = Instant::now() + self.config.claim_settle() + Duration::from_millis(jitter);
        self.election = Some(ElectionState::Claiming {
            claim,
            settle_at,
            beaten_by: None,
        });
    }

    fn settle_claim(&mut self, claim: Claim, beaten_by: Option<Claim>) {
        let record = self.read_record();

        if let Some(winner) = beaten_by {
            let conflict = SyncError::ElectionConflict {
                term: claim.term,
                winner: winner.tab_id.clone(),
            };
            warn!(error = %conflict, "claim lost the tie-break");
            let leader = match record {
                Some(record) if record.master_id != self.tab_id && record.term >= winner.term => {
                    record.claim()
                }
                _ => winner,
            };
            self.follow(leader, "claim lost the tie-break");
            return;
        }

        if let Some(record) = &record
            && record.master_id != self.tab_id
        {
            if record.term > claim.term {
                if record.is_fresh(self.clock.now_ms(), self.config.heartbeat_timeout_ms) {
                    self.follow_record(&record, "higher term recorded while settling");
                } else {
                    self.claim();
                }
                return;
            }
            if record.term == claim.term && record.claim().outranks(&claim) {
                self.follow_record(&record, "outranked in the election record");
                return;
            }
        }

        let expected = record.map(|record| record.term);
        let next = ElectionRecord::from_claim(&claim, self.clock.now_ms());
        match self.ledger.compare_and_set(expected, &next) {
            Ok(true) => {}
            Ok(false) => debug!(term = claim.term, "election record moved while settling"),
            Err(err) => warn!(%err, "failed to write election record"),
        }
        self.become_master(claim);
    }

    fn become_master(&mut self, claim: Claim) {
        self.replica.cancel_request();
        let term = claim.term;
        self.election = Some(ElectionState::Master { claim });

        // Stamp the inherited state with a version above anything a follower
        // may hold, so the announcement is accepted everywhere.
        let current = self.state.get_snapshot();
        let inherited = [
            Some(current.version),
            self.replica.last_applied(),
            Some(self.replica.highest_seen()),
            self.liveness.max_peer_version(),
        ]
        .into_iter()
        .flatten()
        .max()
        .unwrap_or(0);
        let version = inherited + 1;
        let snapshot = StateSnapshot::new(version, current.state);
        self.state.apply_snapshot(snapshot.clone());
        self.replica.mark_applied(version);

        info!(term, version, "became master");
        self.send(&TabMessage::Snapshot {
            from: self.tab_id.clone(),
            term,
            to: None,
            snapshot,
        });
        self.dispatcher.promote();
        if self.liveness.live_peer_count() > 0 {
            self.engage_multi_tab();
        }
        self.emit(CoordinatorEvent::MasterChanged {
            master: Some(self.tab_id.clone()),
            term,
        });
        self.emit(CoordinatorEvent::StateApplied { version });
    }

    fn follow(&mut self, leader: Claim, reason: &'static str) {
        self.follow_since(leader, Instant::now(), reason);
    }

    // The master's silence is counted from its last recorded heartbeat, not
    // from the moment we read the record.
    fn follow_record(&mut self, record: &ElectionRecord, reason: &'static str) {
        let age = self.clock.now_ms().saturating_sub(record.last_heartbeat_at);
        let now = Instant::now();
        let seen_at = now.checked_sub(Duration::from_millis(age)).unwrap_or(now);
        self.follow_since(record.claim(), seen_at, reason);
    }

    fn follow_since(&mut self, leader: Claim, seen_at: Instant, reason: &'static str) {
        if leader.tab_id == self.tab_id {
            return;
        }
        self.observe_term(leader.term);
        let was_master = self.is_master();
        let term = leader.term;
        let master = leader.tab_id.clone();

        self.liveness.expect_peer(&master, seen_at);
        self.election = Some(ElectionState::Follower { leader });
        if was_master {
            self.dispatcher.demote();
        }

        info!(%master, term, reason, "following master");
        self.emit(CoordinatorEvent::MasterChanged {
            master: Some(master),
            term,
        });
        self.engage_multi_tab();
        self.request_snapshot();
    }

    fn on_master_lost(&mut self, lost: TabId) {
        self.emit(CoordinatorEvent::MasterChanged {
            master: None,
            term: self.highest_term,
        });
        self.send(&TabMessage::Discover {
            from: self.tab_id.clone(),
        });

        // The lost master's record is disregarded; another tab may already
        // have replaced it.
        if let Some(record) = self.read_record()
            && record.master_id != lost
            && self.is_followable(&record)
        {
            self.follow_record(&record, "replacement master recorded");
        } else {
            self.claim();
        }
    }

    fn request_snapshot(&mut self) {
        if self.replica.begin_request(Instant::now()).is_some() {
            self.send_snapshot_request();
        }
    }

    fn send_snapshot_request(&mut self) {
        self.request_seq = self.request_seq.wrapping_add(1);
        debug!(request_id = self.request_seq, "requesting snapshot");
        self.send(&TabMessage::SnapshotRequest {
            from: self.tab_id.clone(),
            request_id: self.request_seq,
        });
    }

    fn shutdown(&mut self) {
        if !self.standalone {
            let master_term = match &self.election {
                Some(ElectionState::Master { claim }) => {
                    match self.ledger.release(claim) {
                        Ok(true) => debug!(term = claim.term, "released election record"),
                        Ok(false) => {}
                        Err(err) => warn!(%err, "failed to release election record"),
                    }
                    if self.liveness.live_peer_count() == 0
                        && let Err(err) = self.ledger.set_multi_tab_engaged(false)
                    {
                        warn!(%err, "failed to clear multi-tab flag");
                    }
                    Some(claim.term)
                }
                _ => None,
            };
            self.send(&TabMessage::Goodbye {
                from: self.tab_id.clone(),
                master_term,
            });
        }
        self.dispatcher.demote();
        info!("coordinator stopped");
    }

    fn read_record(&self) -> Option<ElectionRecord> {
        match self.ledger.read() {
            Ok(record) => record,
            Err(err) => {
                warn!(%err, "election record unreadable, treating as absent");
                None
            }
        }
    }

    fn is_followable(&self, record: &ElectionRecord) -> bool {
        record_is_followable(
            record,
            &self.tab_id,
            self.highest_term,
            self.clock.now_ms(),
            self.config.heartbeat_timeout_ms,
        )
    }

    fn is_master(&self) -> bool {
        self.election.as_ref().is_some_and(ElectionState::is_master)
    }

    fn observe_term(&mut self, term: Term) {
        self.highest_term = self.highest_term.max(term);
    }

    fn engage_multi_tab(&self) {
        if let Err(err) = self.ledger.set_multi_tab_engaged(true) {
            warn!(%err, "failed to set multi-tab flag");
        }
    }

    fn send(&self, message: &TabMessage) {
        let payload = match encode_message(message) {
            Ok(payload) => payload,
            Err(err) => {
                warn!(%err, "failed to encode message");
                return;
            }
        };
        if let Err(err) = self.transport.publish(message.topic(), &payload) {
            warn!(%err, topic = message.topic(), "publish failed");
        }
    }

    fn emit(&self, event: CoordinatorEvent) {
        let _ = self.events.send(event);
    }

    fn status(&self) -> TabStatus {
        let (phase, master) = match &self.election {
            None => (ElectionPhase::Standalone, Some(self.tab_id.clone())),
            Some(ElectionState::Discovering { .. }) => (ElectionPhase::Discovering, None),
            Some(ElectionState::Claiming { .. }) => (ElectionPhase::Claiming, None),
            Some(ElectionState::Master { claim }) => {
                (ElectionPhase::Master, Some(claim.tab_id.clone()))
            }
            Some(ElectionState::Follower { leader }) => {
                (ElectionPhase::Follower, Some(leader.tab_id.clone()))
            }
        };
        let mut peers: Vec<TabId> = self.liveness.live_peers().cloned().collect();
        peers.sort();
        TabStatus {
            role: self.dispatcher.role(),
            phase,
            term: self.highest_term,
            master,
            window_active: self.liveness.is_local_active(),
            version: self.replica.last_applied(),
            peers,
        }
    }

    fn publish_status(&self) {
        let next = self.status();
        self.status_tx.send_if_modified(|current| {
            if *current == next {
                return false;
            }
            *current = next;
            true
        });
    }
}

async fn sleep_until_some(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
