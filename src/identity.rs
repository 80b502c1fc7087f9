//! Identity values produced by key strategies.

/// The raw identity a check counts under, or a sentinel that bypasses the
/// store entirely.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Identity {
    /// Ordinary identity material, mixed into the cache key.
    Bytes(Vec<u8>),
    /// No per-caller component: count against the group-wide key.
    Group,
    /// Skip the store; the caller is always allowed and the verdict carries
    /// no store key (`can_reset` is false).
    Exempt,
    /// Skip the store; the verdict's excess count is exactly this value
    /// (0 means allowed). Lets a strategy pre-compute a denial.
    Precomputed(u32),
}

impl Identity {
    pub fn bytes(value: impl Into<Vec<u8>>) -> Self {
        Self::Bytes(value.into())
    }

    pub(crate) fn is_empty_bytes(&self) -> bool {
        matches!(self, Self::Bytes(b) if b.is_empty())
    }
}

impl From<Vec<u8>> for Identity {
    fn from(value: Vec<u8>) -> Self {
        Self::Bytes(value)
    }
}

impl From<&[u8]> for Identity {
    fn from(value: &[u8]) -> Self {
        Self::Bytes(value.to_vec())
    }
}

impl From<&str> for Identity {
    fn from(value: &str) -> Self {
        Self::Bytes(value.as_bytes().to_vec())
    }
}

impl From<String> for Identity {
    fn from(value: String) -> Self {
        Self::Bytes(value.into_bytes())
    }
}

/// `true` counts against the group-wide key; `false` bypasses the check.
impl From<bool> for Identity {
    fn from(value: bool) -> Self {
        if value {
            Self::Group
        } else {
            Self::Exempt
        }
    }
}

impl From<u32> for Identity {
    fn from(value: u32) -> Self {
        Self::Precomputed(value)
    }
}
