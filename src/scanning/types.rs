use derive_more::{Add, AddAssign, From, Sub};
use serde::Serialize;
use std::fmt::{self, Display, Formatter};

/// Time-to-live (ttl) newtype.
#[derive(
    Debug,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    Ord,
    PartialOrd,
    Hash,
    From,
    Add,
    Sub,
    AddAssign,
    Serialize,
)]
pub struct TimeToLive(pub u8);

impl TimeToLive {
    /// The length of a route leading to a target at this distance.
    #[must_use]
    pub fn route_len(self) -> usize {
        usize::from(self.0.saturating_sub(1))
    }
}

impl Display for TimeToLive {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.0, f)
    }
}

/// ICMP identifier newtype.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Ord, PartialOrd, From, Serialize)]
pub struct TraceId(pub u16);

/// ICMP sequence number newtype.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Ord, PartialOrd, From, Add, AddAssign, Serialize,
)]
pub struct Sequence(pub u16);

/// Source or destination port newtype.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Ord, PartialOrd, From, Serialize)]
pub struct Port(pub u16);
