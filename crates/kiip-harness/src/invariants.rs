//! Invariant checking for election simulations.
//!
//! Invariants are properties that must hold once the election has settled.
//! They are checked against an [`ElectionSnapshot`] taken from a
//! [`crate::SimTabs`] cluster; races in flight are allowed to break them
//! briefly, so only check after advancing past a few election rounds.

use std::fmt;

/// Invariant check result.
pub type InvariantResult = Result<(), Violation>;

/// Invariant violation with context.
#[derive(Debug, Clone)]
pub struct Violation {
    /// Name of the violated invariant.
    pub invariant: &'static str,
    /// Description of what went wrong.
    pub message: String,
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.invariant, self.message)
    }
}

impl std::error::Error for Violation {}

/// Observable state of one tab.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TabSnapshot {
    /// Index in the cluster.
    pub index: usize,
    /// Current bid.
    pub bid: String,
    /// Whether the tab reports leadership.
    pub is_leader: bool,
}

/// Observable state of a settled election.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ElectionSnapshot {
    /// Tabs still taking part (neither destroyed nor crashed).
    pub tabs: Vec<TabSnapshot>,
    /// Value of the request record.
    pub requested: Option<String>,
    /// Value of the elected record.
    pub elected: Option<String>,
}

impl ElectionSnapshot {
    /// Tabs reporting leadership.
    pub fn leaders(&self) -> Vec<&TabSnapshot> {
        self.tabs.iter().filter(|t| t.is_leader).collect()
    }
}

/// A property of a settled election.
pub trait Invariant {
    /// Invariant name for error reporting.
    fn name(&self) -> &'static str;

    /// Check the invariant against a snapshot.
    fn check(&self, state: &ElectionSnapshot) -> InvariantResult;
}

/// Exactly one live tab leads.
pub struct SingleLeader;

impl Invariant for SingleLeader {
    fn name(&self) -> &'static str {
        "SingleLeader"
    }

    fn check(&self, state: &ElectionSnapshot) -> InvariantResult {
        let leaders = state.leaders();
        if state.tabs.is_empty() || leaders.len() == 1 {
            return Ok(());
        }
        Err(Violation {
            invariant: self.name(),
            message: format!(
                "{} leaders among {} tabs: {:?}",
                leaders.len(),
                state.tabs.len(),
                leaders.iter().map(|t| &t.bid).collect::<Vec<_>>()
            ),
        })
    }
}

/// The leader's bid is the elected record.
pub struct LeaderOwnsRecord;

impl Invariant for LeaderOwnsRecord {
    fn name(&self) -> &'static str {
        "LeaderOwnsRecord"
    }

    fn check(&self, state: &ElectionSnapshot) -> InvariantResult {
        for leader in state.leaders() {
            if state.elected.as_deref() != Some(leader.bid.as_str()) {
                return Err(Violation {
                    invariant: self.name(),
                    message: format!("tab {} leads as {} but ELECT is {:?}", leader.index, leader.bid, state.elected),
                });
            }
        }
        Ok(())
    }
}

/// The smallest live bid leads.
///
/// Does not hold while a crashed leader's record is still in the store.
pub struct BestBidLeads;

impl Invariant for BestBidLeads {
    fn name(&self) -> &'static str {
        "BestBidLeads"
    }

    fn check(&self, state: &ElectionSnapshot) -> InvariantResult {
        let Some(best) = state.tabs.iter().min_by(|a, b| a.bid.cmp(&b.bid)) else { return Ok(()) };
        if best.is_leader {
            return Ok(());
        }
        Err(Violation {
            invariant: self.name(),
            message: format!(
                "best bid {} (tab {}) does not lead; leaders: {:?}",
                best.bid,
                best.index,
                state.leaders().iter().map(|t| &t.bid).collect::<Vec<_>>()
            ),
        })
    }
}

/// Registry of invariants to check.
pub struct InvariantRegistry {
    invariants: Vec<Box<dyn Invariant>>,
}

impl Default for InvariantRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl InvariantRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self { invariants: Vec::new() }
    }

    /// [`SingleLeader`] and [`LeaderOwnsRecord`].
    pub fn standard() -> Self {
        let mut registry = Self::new();
        registry.add(SingleLeader);
        registry.add(LeaderOwnsRecord);
        registry
    }

    /// Add an invariant to the registry.
    pub fn add<I: Invariant + 'static>(&mut self, invariant: I) {
        self.invariants.push(Box::new(invariant));
    }

    /// Check all invariants, returning every violation found.
    pub fn check_all(&self, state: &ElectionSnapshot) -> Result<(), Vec<Violation>> {
        let violations: Vec<_> = self.invariants.iter().filter_map(|inv| inv.check(state).err()).collect();

        if violations.is_empty() { Ok(()) } else { Err(violations) }
    }

    /// Check all invariants, panicking with every violation.
    pub fn assert_all(&self, state: &ElectionSnapshot, context: &str) {
        if let Err(violations) = self.check_all(state) {
            let messages: Vec<_> = violations.iter().map(|v| v.to_string()).collect();
            panic!("Invariant violation {context}:\n  {}", messages.join("\n  "));
        }
    }
}
