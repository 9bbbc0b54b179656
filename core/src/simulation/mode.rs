use std::fmt::{self, Display, Formatter};

/// Lifecycle state of a [`SimulationRunner`](super::SimulationRunner).
///
/// Modes only move forward: `NotStarted`, `Initializing`, `Running`, `Terminated`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(feature = "serde", derive(serde::Deserialize, serde::Serialize))]
pub enum SimulationMode {
    #[default]
    NotStarted,
    Initializing,
    Running { tlv_port: u16 },
    Terminated { status: i32 },
}

impl SimulationMode {
    pub fn is_not_started(&self) -> bool {
        matches!(self, Self::NotStarted)
    }

    pub fn is_initializing(&self) -> bool {
        matches!(self, Self::Initializing)
    }

    pub fn is_running(&self) -> bool {
        matches!(self, Self::Running { .. })
    }

    pub fn is_terminated(&self) -> bool {
        matches!(self, Self::Terminated { .. })
    }

    /// The TCP port of the TLV interface while running.
    pub fn tlv_port(&self) -> Option<u16> {
        match self {
            Self::Running { tlv_port } => Some(*tlv_port),
            _ => None,
        }
    }

    pub fn termination_status(&self) -> Option<i32> {
        match self {
            Self::Terminated { status } => Some(*status),
            _ => None,
        }
    }

    fn rank(&self) -> u8 {
        match self {
            Self::NotStarted => 0,
            Self::Initializing => 1,
            Self::Running { .. } => 2,
            Self::Terminated { .. } => 3,
        }
    }

    /// Whether moving from `self` to `next` keeps the lifecycle monotonic.
    pub(crate) fn can_become(&self, next: &Self) -> bool {
        next.rank() > self.rank()
    }
}

impl Display for SimulationMode {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotStarted => write!(f, "Not Started"),
            Self::Initializing => write!(f, "Initializing"),
            Self::Running { tlv_port } => write!(f, "Running on TCP: [{}]", tlv_port),
            Self::Terminated { status } => write!(f, "Terminated (exit: [{}])", status),
        }
    }
}
