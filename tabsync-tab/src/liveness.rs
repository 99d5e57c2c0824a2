use std::{collections::HashMap, time::Duration};

use tabsync_core::{PresenceBeacon, TabId, Version};
use tokio::time::{Instant, Interval, MissedTickBehavior};

type PeerTimeoutHandler = Box<dyn FnMut(&TabId) + Send>;
type ActivationHandler = Box<dyn FnMut(bool) + Send>;

#[derive(Debug, Clone)]
struct PeerPresence {
    last_seen: Instant,
    version: Option<Version>,
}

pub struct LivenessMonitor {
    tab_id: TabId,
    timeout: Duration,
    local_active: bool,
    peers: HashMap<TabId, PeerPresence>,
    peer_timeout_handlers: Vec<PeerTimeoutHandler>,
    activation_handlers: Vec<ActivationHandler>,
}

#[derive(Debug)]
pub struct LivenessTimers {
    beacon: Interval,
    sweep: Interval,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LivenessTick {
    Beacon,
    Sweep,
}

impl LivenessTimers {
    pub async fn tick(&mut self) -> LivenessTick {
        tokio::select! {
            _ = self.beacon.tick() => LivenessTick::Beacon,
            _ = self.sweep.tick() => LivenessTick::Sweep,
        }
    }
}

impl LivenessMonitor {
    pub fn new(tab_id: TabId, timeout: Duration, local_active: bool) -> Self {
        Self {
            tab_id,
            timeout,
            local_active,
            peers: HashMap::new(),
            peer_timeout_handlers: Vec::new(),
            activation_handlers: Vec::new(),
        }
    }

    pub fn start(&self, beacon_interval: Duration, sweep_interval: Duration) -> LivenessTimers {
        let mut beacon = tokio::time::interval(beacon_interval);
        beacon.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut sweep = tokio::time::interval_at(Instant::now() + sweep_interval, sweep_interval);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);
        LivenessTimers { beacon, sweep }
    }

    pub fn on_peer_timeout(&mut self, handler: impl FnMut(&TabId) + Send + 'static) {
        self.peer_timeout_handlers.push(Box::new(handler));
    }

    pub fn on_local_activation_change(&mut self, handler: impl FnMut(bool) + Send + 'static) {
        self.activation_handlers.push(Box::new(handler));
    }

    pub fn observe_beacon(&mut self, beacon: &PresenceBeacon, now: Instant) -> bool {
        if beacon.tab_id == self.tab_id {
            return false;
        }
        self.peers
            .insert(beacon.tab_id.clone(), PeerPresence {
                last_seen: now,
                version: beacon.version,
            })
            .is_none()
    }

    pub fn expect_peer(&mut self, tab_id: &TabId, now: Instant) {
        if *tab_id == self.tab_id {
            return;
        }
        self.peers
            .entry(tab_id.clone())
            .and_modify(|peer| peer.last_seen = peer.last_seen.max(now))
            .or_insert(PeerPresence {
                last_seen: now,
                version: None,
            });
    }

    pub fn forget(&mut self, tab_id: &TabId) {
        self.peers.remove(tab_id);
    }

    pub fn sweep_timeouts(&mut self, now: Instant) -> Vec<TabId> {
        let timeout = self.timeout;
        let mut expired: Vec<TabId> = self
            .peers
            .iter()
            .filter(|(_, peer)| now.saturating_duration_since(peer.last_seen) >= timeout)
            .map(|(tab_id, _)| tab_id.clone())
            .collect();
        expired.sort();

        for tab_id in &expired {
            self.peers.remove(tab_id);
            for handler in &mut self.peer_timeout_handlers {
                handler(tab_id);
            }
        }
        expired
    }

    pub fn set_local_active(&mut self, active: bool) -> bool {
        if self.local_active == active {
            return false;
        }
        self.local_active = active;
        for handler in &mut self.activation_handlers {
            handler(active);
        }
        true
    }

    pub fn is_local_active(&self) -> bool {
        self.local_active
    }

    pub fn beacon(&self, timestamp: u64, version: Option<Version>) -> PresenceBeacon {
        PresenceBeacon {
            tab_id: self.tab_id.clone(),
            timestamp,
            is_active_window: self.local_active,
            version,
        }
    }

    pub fn is_live(&self, tab_id: &TabId) -> bool {
        self.peers.contains_key(tab_id)
    }

    pub fn live_peers(&self) -> impl Iterator<Item = &TabId> {
        self.peers.keys()
    }

    pub fn live_peer_count(&self) -> usize {
        self.peers.len()
    }

    pub fn max_peer_version(&self) -> Option<Version> {
        self.peers.values().filter_map(|peer| peer.version).max()
    }
}
