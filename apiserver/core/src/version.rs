use std::{
    fmt,
    str::FromStr,
    sync::atomic::{AtomicU64, Ordering},
};

/// A point in the store's mutation history.
///
/// Resource versions are assigned from a single [`Sequence`] shared by every kind, so they are
/// totally ordered across the whole store and never reused.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ResourceVersion(u64);

/// Hands out resource versions.
///
/// A sequence is owned by a store and passed to each per-kind table by handle, so independent
/// stores (e.g. in tests) never share a counter.
#[derive(Debug, Default)]
pub struct Sequence(AtomicU64);

// === impl ResourceVersion ===

impl ResourceVersion {
    /// The version of an empty store. No object ever carries it.
    pub const ZERO: Self = Self(0);

    pub const fn new(v: u64) -> Self {
        Self(v)
    }

    pub const fn get(self) -> u64 {
        self.0
    }

    /// Parses the `resourceVersion` string carried in object metadata and watch requests.
    ///
    /// An empty string means "unset".
    pub fn parse_opt(s: &str) -> Result<Option<Self>, crate::Error> {
        if s.is_empty() {
            return Ok(None);
        }
        s.parse().map(Some)
    }
}

impl fmt::Display for ResourceVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ResourceVersion {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse::<u64>()
            .map(Self)
            .map_err(|_| crate::Error::Invalid(format!("invalid resource version: {s:?}")))
    }
}

impl From<u64> for ResourceVersion {
    fn from(v: u64) -> Self {
        Self(v)
    }
}

// === impl Sequence ===

impl Sequence {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the most recently assigned version, or [`ResourceVersion::ZERO`].
    pub fn current(&self) -> ResourceVersion {
        ResourceVersion(self.0.load(Ordering::Acquire))
    }

    /// Advances the sequence, returning the new version.
    ///
    /// Callers must hold the write section of the table being mutated so that the version, the
    /// record update and the event publish are observed together.
    pub fn advance(&self) -> ResourceVersion {
        ResourceVersion(self.0.fetch_add(1, Ordering::AcqRel) + 1)
    }
}
