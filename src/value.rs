//! Decoded value types shared between the codec, the derived metric engine
//! and the state snapshot.

use core::fmt;

/// Millisecond-resolution monotonic instant.
///
/// The core never reads a clock. The host's tick source passes the current
/// instant into [`crate::coordinator::Coordinator::poll_once`] and friends,
/// which keeps every scheduling decision deterministic and testable.
pub type Instant = fugit::Instant<u64, 1, 1000>;

/// Millisecond-resolution duration, used for tier intervals.
pub type Duration = fugit::Duration<u64, 1, 1000>;

/// A typed register value after decoding.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// Scaled numeric value in the register's engineering unit.
    Number(f64),
    /// Packed-ASCII string, NUL padding trimmed.
    Text(String),
    /// Set bits of a status/alarm block.
    Flags(FlagSet),
}

impl Value {
    pub fn as_number(&self) -> Option<f64> {
        match self {
            Value::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_flags(&self) -> Option<&FlagSet> {
        match self {
            Value::Flags(f) => Some(f),
            _ => None,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Number(n) => write!(f, "{n}"),
            Value::Text(s) => f.write_str(s),
            Value::Flags(set) => write!(f, "{set}"),
        }
    }
}

/// One set bit of a bitfield register.
///
/// Bits without an entry in the definition's bit map are kept as
/// [`Flag::Reserved`] rather than dropped, so a raw status word can always be
/// reconstructed from the decoded set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flag {
    Named(&'static str),
    Reserved(u8),
}

impl fmt::Display for Flag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Flag::Named(name) => f.write_str(name),
            Flag::Reserved(bit) => write!(f, "reserved bit {bit}"),
        }
    }
}

/// The set bits of a decoded bitfield, in ascending bit order.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FlagSet(pub Vec<Flag>);

impl FlagSet {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Flag> {
        self.0.iter()
    }

    /// Whether a flag with the given display name is set. Reserved bits
    /// match their `reserved bit N` rendering.
    pub fn contains(&self, name: &str) -> bool {
        self.0.iter().any(|f| f.to_string() == name)
    }
}

impl fmt::Display for FlagSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, flag) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{flag}")?;
        }
        Ok(())
    }
}

/// A logical value as exposed to consumers.
///
/// `timestamp` is the instant of the last successful read (or recompute, for
/// derived metrics). A failed poll leaves the previous value in place with
/// its old timestamp, so staleness shows up as timestamp age rather than a
/// vanishing entry. `valid` is false only while no successful read has ever
/// happened, or when a derived metric is undefined; the `value` field is
/// meaningless while `valid` is false.
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedValue {
    pub value: Value,
    pub timestamp: Option<Instant>,
    pub valid: bool,
}

impl DecodedValue {
    /// A freshly decoded value.
    pub fn fresh(value: Value, now: Instant) -> Self {
        Self {
            value,
            timestamp: Some(now),
            valid: true,
        }
    }

    /// Placeholder for a register whose first read failed.
    pub fn missing() -> Self {
        Self {
            value: Value::Number(0.0),
            timestamp: None,
            valid: false,
        }
    }

    /// Age of this value relative to `now`, if it was ever read.
    pub fn age(&self, now: Instant) -> Option<Duration> {
        self.timestamp.and_then(|t| now.checked_duration_since(t))
    }
}
