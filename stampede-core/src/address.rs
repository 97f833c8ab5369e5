//! Hierarchical component addresses
//!
//! Every component in a running topology is identified by its position in
//! the tree rooted at the coordinator: `C`, `C_A2`, `C_A2_W4`, `C_A2_W4_T1`.
//! Indices are dense, 1-based and allocated in registration order, so the
//! same inventory always produces the same addresses. An index may be the
//! wildcard `*`, which addresses every child at that level and is how
//! fan-out destinations such as "all workers of agent 1" (`C_A1_W*`) are
//! expressed.

use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Depth of an address in the component tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum AddressLevel {
    Coordinator,
    Agent,
    Worker,
    Test,
}

impl AddressLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            AddressLevel::Coordinator => "coordinator",
            AddressLevel::Agent => "agent",
            AddressLevel::Worker => "worker",
            AddressLevel::Test => "test",
        }
    }
}

impl fmt::Display for AddressLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One segment of an address path: a concrete 1-based id, or the fan-out
/// wildcard addressing every child at that level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum AddressIndex {
    All,
    Id(u32),
}

impl AddressIndex {
    /// Whether this index selects the given concrete id.
    pub fn matches(&self, id: u32) -> bool {
        match self {
            AddressIndex::All => true,
            AddressIndex::Id(n) => *n == id,
        }
    }

    /// The concrete id, if this index is not a wildcard.
    pub fn id(&self) -> Option<u32> {
        match self {
            AddressIndex::All => None,
            AddressIndex::Id(n) => Some(*n),
        }
    }

    pub fn is_wildcard(&self) -> bool {
        matches!(self, AddressIndex::All)
    }
}

impl fmt::Display for AddressIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AddressIndex::All => write!(f, "*"),
            AddressIndex::Id(n) => write!(f, "{n}"),
        }
    }
}

/// Address of a component in the coordinator/agent/worker/test tree.
///
/// Each variant carries exactly the indices meaningful at its level, so an
/// address can never hold junk below its own depth. Ordering is derived,
/// which makes collections of addresses iterate in deterministic
/// registration order (`C_A1_W2` before `C_A2_W1`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Address {
    Coordinator,
    Agent {
        agent: AddressIndex,
    },
    Worker {
        agent: AddressIndex,
        worker: AddressIndex,
    },
    Test {
        agent: AddressIndex,
        worker: AddressIndex,
        test: AddressIndex,
    },
}

impl Address {
    /// Concrete agent address `C_A<n>`.
    pub fn agent(agent: u32) -> Address {
        Address::Agent {
            agent: AddressIndex::Id(agent),
        }
    }

    /// Concrete worker address `C_A<a>_W<w>`.
    pub fn worker(agent: u32, worker: u32) -> Address {
        Address::Worker {
            agent: AddressIndex::Id(agent),
            worker: AddressIndex::Id(worker),
        }
    }

    /// Concrete test instance address `C_A<a>_W<w>_T<t>`.
    pub fn test(agent: u32, worker: u32, test: u32) -> Address {
        Address::Test {
            agent: AddressIndex::Id(agent),
            worker: AddressIndex::Id(worker),
            test: AddressIndex::Id(test),
        }
    }

    /// Fan-out address for every agent: `C_A*`.
    pub fn all_agents() -> Address {
        Address::Agent {
            agent: AddressIndex::All,
        }
    }

    /// Fan-out address for every worker in the topology: `C_A*_W*`.
    pub fn all_workers() -> Address {
        Address::Worker {
            agent: AddressIndex::All,
            worker: AddressIndex::All,
        }
    }

    /// Fan-out address for the workers of one agent: `C_A<a>_W*`.
    pub fn workers_of(agent: u32) -> Address {
        Address::Worker {
            agent: AddressIndex::Id(agent),
            worker: AddressIndex::All,
        }
    }

    /// Run-level broadcast address for one test on every worker:
    /// `C_A*_W*_T<t>`.
    pub fn test_instances(test: u32) -> Address {
        Address::Test {
            agent: AddressIndex::All,
            worker: AddressIndex::All,
            test: AddressIndex::Id(test),
        }
    }

    /// The test instance address below a concrete worker address.
    pub fn test_on(&self, test: u32) -> Option<Address> {
        match self {
            Address::Worker { agent, worker } => Some(Address::Test {
                agent: *agent,
                worker: *worker,
                test: AddressIndex::Id(test),
            }),
            _ => None,
        }
    }

    pub fn level(&self) -> AddressLevel {
        match self {
            Address::Coordinator => AddressLevel::Coordinator,
            Address::Agent { .. } => AddressLevel::Agent,
            Address::Worker { .. } => AddressLevel::Worker,
            Address::Test { .. } => AddressLevel::Test,
        }
    }

    /// The enclosing address one level up; `None` at the root.
    pub fn parent(&self) -> Option<Address> {
        match self {
            Address::Coordinator => None,
            Address::Agent { .. } => Some(Address::Coordinator),
            Address::Worker { agent, .. } => Some(Address::Agent { agent: *agent }),
            Address::Test { agent, worker, .. } => Some(Address::Worker {
                agent: *agent,
                worker: *worker,
            }),
        }
    }

    pub fn agent_index(&self) -> Option<AddressIndex> {
        match self {
            Address::Coordinator => None,
            Address::Agent { agent }
            | Address::Worker { agent, .. }
            | Address::Test { agent, .. } => Some(*agent),
        }
    }

    pub fn worker_index(&self) -> Option<AddressIndex> {
        match self {
            Address::Worker { worker, .. } | Address::Test { worker, .. } => Some(*worker),
            _ => None,
        }
    }

    pub fn test_index(&self) -> Option<AddressIndex> {
        match self {
            Address::Test { test, .. } => Some(*test),
            _ => None,
        }
    }

    /// The index this address carries at the given level, if it is that deep.
    pub fn index_at(&self, level: AddressLevel) -> Option<AddressIndex> {
        match level {
            AddressLevel::Coordinator => None,
            AddressLevel::Agent => self.agent_index(),
            AddressLevel::Worker => self.worker_index(),
            AddressLevel::Test => self.test_index(),
        }
    }

    /// Whether the address contains no wildcard segments.
    pub fn is_concrete(&self) -> bool {
        match self {
            Address::Coordinator => true,
            Address::Agent { agent } => !agent.is_wildcard(),
            Address::Worker { agent, worker } => !agent.is_wildcard() && !worker.is_wildcard(),
            Address::Test {
                agent,
                worker,
                test,
            } => !agent.is_wildcard() && !worker.is_wildcard() && !test.is_wildcard(),
        }
    }

    /// Whether this (possibly wildcarded) address selects the given concrete
    /// address. Both must sit at the same level.
    pub fn matches(&self, concrete: &Address) -> bool {
        if self.level() != concrete.level() {
            return false;
        }
        for level in [AddressLevel::Agent, AddressLevel::Worker, AddressLevel::Test] {
            match (self.index_at(level), concrete.index_at(level)) {
                (None, None) => {}
                (Some(sel), Some(idx)) => match idx.id() {
                    Some(id) => {
                        if !sel.matches(id) {
                            return false;
                        }
                    }
                    None => {
                        if sel != idx {
                            return false;
                        }
                    }
                },
                _ => return false,
            }
        }
        true
    }

    /// Whether a route toward this destination passes through the given
    /// concrete node, i.e. the destination's indices select the node at every
    /// level the node occupies. Used when forwarding an envelope down the
    /// tree.
    pub fn routes_through(&self, node: &Address) -> bool {
        if self.level() <= node.level() {
            return false;
        }
        for level in [AddressLevel::Agent, AddressLevel::Worker, AddressLevel::Test] {
            if level > node.level() {
                break;
            }
            let Some(node_id) = node.index_at(level).and_then(|i| i.id()) else {
                return false;
            };
            match self.index_at(level) {
                Some(sel) if sel.matches(node_id) => {}
                _ => return false,
            }
        }
        true
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Address::Coordinator => write!(f, "C"),
            Address::Agent { agent } => write!(f, "C_A{agent}"),
            Address::Worker { agent, worker } => write!(f, "C_A{agent}_W{worker}"),
            Address::Test {
                agent,
                worker,
                test,
            } => write!(f, "C_A{agent}_W{worker}_T{test}"),
        }
    }
}

/// Errors raised when parsing the canonical string form of an address.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AddressParseError {
    #[error("empty address")]
    Empty,
    #[error("address must start with 'C': '{0}'")]
    MissingRoot(String),
    #[error("malformed address segment '{0}'")]
    MalformedSegment(String),
    #[error("address index must be >= 1 in segment '{0}'")]
    ZeroIndex(String),
    #[error("unexpected trailing segments in '{0}'")]
    TrailingSegments(String),
}

fn parse_index(segment: &str, prefix: char) -> Result<AddressIndex, AddressParseError> {
    let rest = segment
        .strip_prefix(prefix)
        .ok_or_else(|| AddressParseError::MalformedSegment(segment.to_string()))?;
    if rest == "*" {
        return Ok(AddressIndex::All);
    }
    let id: u32 = rest
        .parse()
        .map_err(|_| AddressParseError::MalformedSegment(segment.to_string()))?;
    if id == 0 {
        return Err(AddressParseError::ZeroIndex(segment.to_string()));
    }
    Ok(AddressIndex::Id(id))
}

impl FromStr for Address {
    type Err = AddressParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(AddressParseError::Empty);
        }
        let mut segments = s.split('_');
        if segments.next() != Some("C") {
            return Err(AddressParseError::MissingRoot(s.to_string()));
        }
        let Some(agent_seg) = segments.next() else {
            return Ok(Address::Coordinator);
        };
        let agent = parse_index(agent_seg, 'A')?;
        let Some(worker_seg) = segments.next() else {
            return Ok(Address::Agent { agent });
        };
        let worker = parse_index(worker_seg, 'W')?;
        let Some(test_seg) = segments.next() else {
            return Ok(Address::Worker { agent, worker });
        };
        let test = parse_index(test_seg, 'T')?;
        if segments.next().is_some() {
            return Err(AddressParseError::TrailingSegments(s.to_string()));
        }
        Ok(Address::Test {
            agent,
            worker,
            test,
        })
    }
}

// Addresses appear as JSON map keys in ack outcome maps, so they serialize
// as their canonical string form.
impl Serialize for Address {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Address {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(de::Error::custom)
    }
}
