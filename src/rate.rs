//! Rate descriptors: how many requests fit in one fixed window.
//!
//! The string grammar is `count[/multiplier][unit]` with unit one of
//! `s m h d w` (default seconds) and multiplier defaulting to 1:
//! `"100"` is 100 per second, `"2/4s"` is 2 per 4 seconds, `"5/m"` is
//! 5 per minute. A limit of 0 means "always deny, bypass the store".

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use crate::error::RatelimitError;
use crate::request::RequestContext;
use crate::verdict::Action;

/// A parsed rate: `limit` requests per `window_seconds` fixed window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Rate {
    limit: u32,
    window_seconds: u32,
}

impl Rate {
    /// Build a rate, rejecting zero-length windows.
    pub fn new(limit: u32, window_seconds: u32) -> Result<Self, RatelimitError> {
        if window_seconds == 0 {
            return Err(RatelimitError::InvalidRate { limit, window_seconds });
        }
        Ok(Self { limit, window_seconds })
    }

    pub fn limit(&self) -> u32 {
        self.limit
    }

    pub fn window_seconds(&self) -> u32 {
        self.window_seconds
    }

    pub fn window(&self) -> Duration {
        Duration::from_secs(u64::from(self.window_seconds))
    }
}

impl fmt::Display for Rate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}s", self.limit, self.window_seconds)
    }
}

fn period_seconds(unit: char) -> Option<u32> {
    match unit {
        's' => Some(1),
        'm' => Some(60),
        'h' => Some(3_600),
        'd' => Some(86_400),
        'w' => Some(604_800),
        _ => None,
    }
}

fn parse_count(s: &str, original: &str) -> Result<u32, RatelimitError> {
    if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
        return Err(RatelimitError::InvalidFormat(original.to_string()));
    }
    s.parse()
        .map_err(|_| RatelimitError::InvalidFormat(original.to_string()))
}

impl FromStr for Rate {
    type Err = RatelimitError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (count, window_spec) = match s.split_once('/') {
            Some((count, rest)) => (count, Some(rest)),
            None => (s, None),
        };
        let limit = parse_count(count, s)?;
        let window_seconds = match window_spec {
            None => 1,
            Some(rest) => {
                let (digits, unit) = match rest.strip_suffix(|c: char| c.is_ascii_alphabetic()) {
                    Some(digits) => (digits, rest.chars().next_back()),
                    None => (rest, None),
                };
                let multiplier = if digits.is_empty() { 1 } else { parse_count(digits, s)? };
                let period = match unit {
                    None => 1,
                    Some(c) => period_seconds(c)
                        .ok_or_else(|| RatelimitError::InvalidFormat(s.to_string()))?,
                };
                multiplier
                    .checked_mul(period)
                    .ok_or_else(|| RatelimitError::InvalidFormat(s.to_string()))?
            }
        };
        Rate::new(limit, window_seconds)
    }
}

impl TryFrom<(u32, u32)> for Rate {
    type Error = RatelimitError;

    fn try_from((limit, window_seconds): (u32, u32)) -> Result<Self, Self::Error> {
        Rate::new(limit, window_seconds)
    }
}

/// Callback resolving a rate from the request, group, and action.
pub type RateFn =
    dyn Fn(Option<&dyn RequestContext>, &str, Action) -> Result<Rate, RatelimitError>
        + Send
        + Sync;

/// How a rate is supplied to the engine.
#[derive(Clone)]
pub enum RateArg {
    /// A fixed, pre-parsed rate.
    Fixed(Rate),
    /// Resolved per call from the request, group, and action.
    Dynamic(Arc<RateFn>),
    /// No rate at all. Valid only when the key strategy resolves to an exempt
    /// or precomputed identity; anything else is a [`RatelimitError::MissingRate`].
    Missing,
}

impl RateArg {
    /// Parse a rate string into the fixed form.
    pub fn parse(s: &str) -> Result<Self, RatelimitError> {
        Ok(Self::Fixed(s.parse()?))
    }

    pub fn dynamic<F>(f: F) -> Self
    where
        F: Fn(Option<&dyn RequestContext>, &str, Action) -> Result<Rate, RatelimitError>
            + Send
            + Sync
            + 'static,
    {
        Self::Dynamic(Arc::new(f))
    }

    pub(crate) fn resolve(
        &self,
        request: Option<&dyn RequestContext>,
        group: &str,
        action: Action,
    ) -> Result<Option<Rate>, RatelimitError> {
        match self {
            Self::Fixed(rate) => Ok(Some(*rate)),
            Self::Dynamic(f) => f(request, group, action).map(Some),
            Self::Missing => Ok(None),
        }
    }
}

impl From<Rate> for RateArg {
    fn from(rate: Rate) -> Self {
        Self::Fixed(rate)
    }
}

impl fmt::Debug for RateArg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fixed(rate) => f.debug_tuple("Fixed").field(rate).finish(),
            Self::Dynamic(_) => f.write_str("Dynamic(..)"),
            Self::Missing => f.write_str("Missing"),
        }
    }
}
