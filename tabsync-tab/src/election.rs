use std::sync::Arc;

use tabsync_core::{Claim, ElectionRecord, TabId, Term};
use tokio::time::Instant;
use tracing::debug;

use crate::{error::StoreError, store::FlagStore};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ElectionState {
    Discovering { deadline: Instant },
    Claiming {
        claim: Claim,
        settle_at: Instant,
        beaten_by: Option<Claim>,
    },
    Master { claim: Claim },
    Follower { leader: Claim },
}

impl ElectionState {
    pub fn is_master(&self) -> bool {
        matches!(self, ElectionState::Master { .. })
    }

    pub fn leader(&self) -> Option<&Claim> {
        match self {
            ElectionState::Master { claim } => Some(claim),
            ElectionState::Follower { leader } => Some(leader),
            _ => None,
        }
    }

    pub fn deadline(&self) -> Option<Instant> {
        match self {
            ElectionState::Discovering { deadline } => Some(*deadline),
            ElectionState::Claiming { settle_at, .. } => Some(*settle_at),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefreshOutcome {
    Refreshed,
    Superseded(ElectionRecord),
}

#[derive(Clone)]
pub struct ElectionLedger {
    flags: Arc<dyn FlagStore>,
    record_key: String,
    multi_tab_key: String,
}

impl ElectionLedger {
    pub fn new(flags: Arc<dyn FlagStore>, namespace: &str) -> Self {
        Self {
            flags,
            record_key: format!("{namespace}:election"),
            multi_tab_key: format!("{namespace}:multi-tab"),
        }
    }

    pub fn record_key(&self) -> &str {
        &self.record_key
    }

    pub fn read(&self) -> Result<Option<ElectionRecord>, StoreError> {
        let Some(raw) = self.flags.get(&self.record_key)? else {
            return Ok(None);
        };
        serde_json::from_str(&raw)
            .map(Some)
            .map_err(|err| StoreError::Corrupt {
                key: self.record_key.clone(),
                reason: err.to_string(),
            })
    }

    /// Writes `record` only if the stored term still equals `expected_term`
    /// (`None` meaning no record). Returns whether the write happened.
    ///
    /// A corrupt record counts as absent so it can be overwritten.
    pub fn compare_and_set(
        &self,
        expected_term: Option<Term>,
        record: &ElectionRecord,
    ) -> Result<bool, StoreError> {
        let current = match self.read() {
            Ok(current) => current.map(|r| r.term),
            Err(StoreError::Corrupt { .. }) => None,
            Err(err) => return Err(err),
        };
        if current != expected_term {
            debug!(?current, ?expected_term, "election record changed underneath");
            return Ok(false);
        }
        self.write(record)?;
        Ok(true)
    }

    pub fn refresh(&self, claim: &Claim, now_ms: u64) -> Result<RefreshOutcome, StoreError> {
        let current = match self.read() {
            Ok(current) => current,
            Err(StoreError::Corrupt { .. }) => None,
            Err(err) => return Err(err),
        };
        if let Some(record) = &current
            && record.master_id != claim.tab_id
            && record.claim().outranks(claim)
        {
            return Ok(RefreshOutcome::Superseded(record.clone()));
        }

        let next = ElectionRecord::from_claim(claim, now_ms);
        if self.compare_and_set(current.map(|r| r.term), &next)? {
            Ok(RefreshOutcome::Refreshed)
        } else {
            match self.read()? {
                Some(record) if record.claim().outranks(claim) => {
                    Ok(RefreshOutcome::Superseded(record))
                }
                _ => Ok(RefreshOutcome::Refreshed),
            }
        }
    }

    pub fn release(&self, claim: &Claim) -> Result<bool, StoreError> {
        match self.read() {
            Ok(Some(record)) if record.master_id == claim.tab_id && record.term == claim.term => {
                self.flags.remove(&self.record_key)?;
                Ok(true)
            }
            Ok(_) | Err(StoreError::Corrupt { .. }) => Ok(false),
            Err(err) => Err(err),
        }
    }

    pub fn multi_tab_engaged(&self) -> Result<bool, StoreError> {
        Ok(self
            .flags
            .get(&self.multi_tab_key)?
            .is_some_and(|value| value.trim() == "true"))
    }

    pub fn set_multi_tab_engaged(&self, engaged: bool) -> Result<(), StoreError> {
        if engaged {
            self.flags.set(&self.multi_tab_key, "true")
        } else {
            self.flags.remove(&self.multi_tab_key)
        }
    }

    fn write(&self, record: &ElectionRecord) -> Result<(), StoreError> {
        let raw = serde_json::to_string(record).map_err(|err| StoreError::Corrupt {
            key: self.record_key.clone(),
            reason: err.to_string(),
        })?;
        self.flags.set(&self.record_key, &raw)
    }
}

pub fn record_is_followable(
    record: &ElectionRecord,
    own_id: &TabId,
    highest_term: Term,
    now_ms: u64,
    timeout_ms: u64,
) -> bool {
    record.master_id != *own_id
        && record.term >= highest_term
        && record.is_fresh(now_ms, timeout_ms)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryFlagStore;

    fn ledger() -> (ElectionLedger, MemoryFlagStore) {
        let flags = MemoryFlagStore::new();
        (ElectionLedger::new(Arc::new(flags.clone()), "test"), flags)
    }

    fn claim(id: &str, term: Term) -> Claim {
        Claim {
            tab_id: TabId::parse(id).unwrap(),
            term,
            claimed_at: 1_000,
        }
    }

    #[test]
    fn compare_and_set_checks_the_stored_term() {
        let (ledger, _) = ledger();
        let first = ElectionRecord::from_claim(&claim("aa", 1), 1_000);
        assert!(ledger.compare_and_set(None, &first).unwrap());

        let stale = ElectionRecord::from_claim(&claim("bb", 1), 1_000);
        assert!(!ledger.compare_and_set(None, &stale).unwrap());
        assert_eq!(ledger.read().unwrap(), Some(first));

        let next = ElectionRecord::from_claim(&claim("bb", 2), 2_000);
        assert!(ledger.compare_and_set(Some(1), &next).unwrap());
        assert_eq!(ledger.read().unwrap().unwrap().term, 2);
    }

    #[test]
    fn refresh_bumps_own_heartbeat() {
        let (ledger, _) = ledger();
        let mine = claim("aa", 1);
        ledger
            .compare_and_set(None, &ElectionRecord::from_claim(&mine, 1_000))
            .unwrap();

        assert_eq!(ledger.refresh(&mine, 5_000).unwrap(), RefreshOutcome::Refreshed);
        assert_eq!(ledger.read().unwrap().unwrap().last_heartbeat_at, 5_000);
    }

    #[test]
    fn refresh_yields_to_higher_term() {
        let (ledger, _) = ledger();
        let newer = ElectionRecord::from_claim(&claim("ff", 3), 1_000);
        ledger.compare_and_set(None, &newer).unwrap();

        let outcome = ledger.refresh(&claim("aa", 2), 2_000).unwrap();
        assert_eq!(outcome, RefreshOutcome::Superseded(newer));
    }

    #[test]
    fn refresh_overwrites_same_term_loser() {
        let (ledger, _) = ledger();
        let loser = ElectionRecord::from_claim(&claim("ff", 1), 1_000);
        ledger.compare_and_set(None, &loser).unwrap();

        let winner = claim("0a", 1);
        assert_eq!(ledger.refresh(&winner, 2_000).unwrap(), RefreshOutcome::Refreshed);
        assert_eq!(ledger.read().unwrap().unwrap().master_id, winner.tab_id);
    }

    #[test]
    fn release_only_removes_own_record() {
        let (ledger, _) = ledger();
        let mine = claim("aa", 4);
        ledger
            .compare_and_set(None, &ElectionRecord::from_claim(&mine, 1_000))
            .unwrap();

        assert!(!ledger.release(&claim("aa", 3)).unwrap());
        assert!(!ledger.release(&claim("bb", 4)).unwrap());
        assert!(ledger.release(&mine).unwrap());
        assert_eq!(ledger.read().unwrap(), None);
    }

    #[test]
    fn corrupt_record_is_reported_and_overwritable() {
        let (ledger, flags) = ledger();
        flags.set(ledger.record_key(), "not json").unwrap();
        assert!(matches!(ledger.read(), Err(StoreError::Corrupt { .. })));

        let record = ElectionRecord::from_claim(&claim("aa", 1), 1_000);
        assert!(ledger.compare_and_set(None, &record).unwrap());
    }

    #[test]
    fn multi_tab_flag_roundtrip() {
        let (ledger, _) = ledger();
        assert!(!ledger.multi_tab_engaged().unwrap());
        ledger.set_multi_tab_engaged(true).unwrap();
        assert!(ledger.multi_tab_engaged().unwrap());
        ledger.set_multi_tab_engaged(false).unwrap();
        assert!(!ledger.multi_tab_engaged().unwrap());
    }

    #[test]
    fn stale_or_own_records_are_not_followed() {
        let me = TabId::parse("aa").unwrap();
        let record = ElectionRecord::from_claim(&claim("bb", 2), 10_000);
        assert!(record_is_followable(&record, &me, 2, 11_000, 2_000));
        assert!(!record_is_followable(&record, &me, 3, 11_000, 2_000));
        assert!(!record_is_followable(&record, &me, 2, 12_500, 2_000));

        let own = ElectionRecord::from_claim(&claim("aa", 2), 10_000);
        assert!(!record_is_followable(&own, &me, 2, 11_000, 2_000));
    }
}
