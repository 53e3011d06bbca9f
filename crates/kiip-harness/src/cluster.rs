//! Simulated browser tabs sharing one store.
//!
//! Each tab runs a [`LeaderElection`] against its own handle of a shared
//! [`SimStore`]. Tabs can be closed cleanly (the election is destroyed) or
//! crash (the election is dropped without cleaning up the store).

use std::{cell::RefCell, rc::Rc, time::Duration};

use kiip_core::{
    ActivityRank, ElectionConfig, LeaderElection, Subscription,
    election::{ELECT_KEY, REQUEST_KEY},
};

use crate::{ElectionSnapshot, SimEnv, SimStore, SimStoreHandle, TabSnapshot};

/// Election of one simulated tab.
pub type TabElection = LeaderElection<SimEnv, SimStoreHandle>;

struct Tab {
    election: Option<TabElection>,
    transitions: Rc<RefCell<Vec<bool>>>,
    _subscription: Subscription,
}

/// Cluster of tabs on one virtual clock.
pub struct SimTabs {
    env: SimEnv,
    store: SimStore,
    config: ElectionConfig,
    tabs: Vec<Tab>,
}

impl SimTabs {
    /// Empty cluster with default timeouts.
    pub fn new(seed: u64) -> Self {
        Self::with_config(seed, ElectionConfig::default())
    }

    /// Empty cluster with custom timeouts.
    pub fn with_config(seed: u64, config: ElectionConfig) -> Self {
        let env = SimEnv::with_seed(seed);
        let store = SimStore::new(&env);
        Self { env, store, config, tabs: Vec::new() }
    }

    /// Shared clock.
    pub fn env(&self) -> &SimEnv {
        &self.env
    }

    /// Shared store.
    pub fn store(&self) -> &SimStore {
        &self.store
    }

    /// Open a tab at `rank`. Returns its index.
    pub fn open(&mut self, rank: ActivityRank) -> usize {
        let election = LeaderElection::new(self.env.clone(), self.store.handle(), self.config.clone(), rank);
        let transitions = Rc::new(RefCell::new(Vec::new()));
        let log = Rc::clone(&transitions);
        let subscription = election.subscribe(move |leader| log.borrow_mut().push(*leader));

        self.tabs.push(Tab { election: Some(election), transitions, _subscription: subscription });
        self.tabs.len() - 1
    }

    /// Election of tab `index`, unless closed or crashed.
    pub fn election(&self, index: usize) -> Option<&TabElection> {
        self.tabs.get(index)?.election.as_ref()
    }

    /// Change the activity of tab `index`.
    pub fn set_activity(&self, index: usize, rank: ActivityRank) {
        if let Some(election) = self.election(index) {
            election.set_activity(rank);
        }
    }

    /// Close tab `index` cleanly.
    pub fn close(&mut self, index: usize) {
        if let Some(election) = self.tabs.get_mut(index).and_then(|t| t.election.take()) {
            election.destroy();
        }
    }

    /// Kill tab `index` without letting it clean up.
    pub fn crash(&mut self, index: usize) {
        if let Some(tab) = self.tabs.get_mut(index) {
            tab.election = None;
        }
    }

    /// Advance virtual time.
    pub fn advance(&self, duration: Duration) {
        self.env.advance(duration);
    }

    /// Indices of tabs reporting leadership.
    pub fn leaders(&self) -> Vec<usize> {
        (0..self.tabs.len()).filter(|&i| self.election(i).is_some_and(TabElection::is_leader)).collect()
    }

    /// Every leadership change reported to tab `index`.
    pub fn transitions(&self, index: usize) -> Vec<bool> {
        self.tabs.get(index).map(|t| t.transitions.borrow().clone()).unwrap_or_default()
    }

    /// Observable state of every live tab and both records.
    pub fn snapshot(&self) -> ElectionSnapshot {
        let tabs = (0..self.tabs.len())
            .filter_map(|index| {
                let election = self.election(index)?;
                Some(TabSnapshot { index, bid: election.bid().to_string(), is_leader: election.is_leader() })
            })
            .collect();
        ElectionSnapshot { tabs, requested: self.store.peek(REQUEST_KEY), elected: self.store.peek(ELECT_KEY) }
    }
}
