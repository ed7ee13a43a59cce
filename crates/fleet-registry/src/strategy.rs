//! Instance selection strategies

use serde::{Deserialize, Serialize};
use std::fmt;

/// How `pick` chooses among the healthy instances of a service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SelectionStrategy {
    Random,
    #[default]
    RoundRobin,
    /// Lowest in-flight request count wins.
    LeastConnections,
}

impl SelectionStrategy {
    pub const ALL: [SelectionStrategy; 3] = [
        SelectionStrategy::Random,
        SelectionStrategy::RoundRobin,
        SelectionStrategy::LeastConnections,
    ];
}

impl std::str::FromStr for SelectionStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "random" => Ok(SelectionStrategy::Random),
            "round_robin" => Ok(SelectionStrategy::RoundRobin),
            "least_connections" => Ok(SelectionStrategy::LeastConnections),
            _ => Err(format!("Unknown selection strategy: {}", s)),
        }
    }
}

impl fmt::Display for SelectionStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SelectionStrategy::Random => write!(f, "random"),
            SelectionStrategy::RoundRobin => write!(f, "round_robin"),
            SelectionStrategy::LeastConnections => write!(f, "least_connections"),
        }
    }
}
