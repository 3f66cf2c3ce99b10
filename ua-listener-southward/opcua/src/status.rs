use opcua::types::SubStatusCode;
use serde::{Deserialize, Serialize};
use std::{collections::HashSet, fmt};
use ua_listener_sdk::{ListenerError, ListenerResult};

/// OPC UA status code as carried on the wire.
///
/// The upper 16 bits identify the code, the lower 16 bits carry info bits
/// that are ignored for naming.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StatusCode(pub u32);

const SEVERITY_MASK: u32 = 0xC000_0000;
const SEVERITY_UNCERTAIN: u32 = 0x4000_0000;
const SEVERITY_BAD: u32 = 0x8000_0000;

impl StatusCode {
    pub const GOOD: StatusCode = StatusCode(0x0000_0000);
    pub const GOOD_OVERLOAD: StatusCode = StatusCode(0x002F_0000);
    pub const UNCERTAIN: StatusCode = StatusCode(0x4000_0000);
    pub const BAD: StatusCode = StatusCode(0x8000_0000);
    pub const BAD_UNEXPECTED_ERROR: StatusCode = StatusCode(0x8001_0000);
    pub const BAD_OUT_OF_MEMORY: StatusCode = StatusCode(0x8003_0000);
    pub const BAD_RESOURCE_UNAVAILABLE: StatusCode = StatusCode(0x8004_0000);
    pub const BAD_TOO_MANY_OPERATIONS: StatusCode = StatusCode(0x8010_0000);
    pub const BAD_USER_ACCESS_DENIED: StatusCode = StatusCode(0x801F_0000);
    pub const BAD_IDENTITY_TOKEN_INVALID: StatusCode = StatusCode(0x8020_0000);
    pub const BAD_IDENTITY_TOKEN_REJECTED: StatusCode = StatusCode(0x8021_0000);
    pub const BAD_NODE_ID_INVALID: StatusCode = StatusCode(0x8033_0000);
    pub const BAD_NODE_ID_UNKNOWN: StatusCode = StatusCode(0x8034_0000);
    pub const BAD_ATTRIBUTE_ID_INVALID: StatusCode = StatusCode(0x8035_0000);
    pub const BAD_NOT_READABLE: StatusCode = StatusCode(0x803A_0000);
    pub const BAD_MONITORED_ITEM_FILTER_UNSUPPORTED: StatusCode = StatusCode(0x8044_0000);
    pub const BAD_FILTER_NOT_ALLOWED: StatusCode = StatusCode(0x8045_0000);
    pub const BAD_TOO_MANY_SESSIONS: StatusCode = StatusCode(0x8056_0000);
    pub const BAD_TOO_MANY_MONITORED_ITEMS: StatusCode = StatusCode(0x80DB_0000);

    #[inline]
    pub fn bits(self) -> u32 {
        self.0
    }

    #[inline]
    pub fn is_good(self) -> bool {
        self.0 & SEVERITY_MASK == 0
    }

    #[inline]
    pub fn is_uncertain(self) -> bool {
        self.0 & SEVERITY_MASK == SEVERITY_UNCERTAIN
    }

    #[inline]
    pub fn is_bad(self) -> bool {
        self.0 & SEVERITY_BAD != 0
    }

    /// Symbolic name, falling back to the severity name for unknown codes.
    pub fn name(self) -> &'static str {
        self.sub_code().name()
    }

    pub fn description(self) -> &'static str {
        self.sub_code().description()
    }

    /// Entry of the standard status table, info bits ignored.
    fn sub_code(self) -> SubStatusCode {
        match opcua::types::StatusCode::from(self.0).sub_code() {
            SubStatusCode::Invalid if self.is_good() => SubStatusCode::Good,
            SubStatusCode::Invalid if self.is_uncertain() => SubStatusCode::Uncertain,
            SubStatusCode::Invalid => SubStatusCode::Bad,
            known => known,
        }
    }

    /// Human-readable quality text, e.g.
    /// `The operation succeeded. StatusGood (0x0)`.
    pub fn quality(self) -> String {
        format!(
            "{} Status{} ({:#X})",
            self.description(),
            self.name(),
            self.0
        )
    }
}

impl From<u32> for StatusCode {
    #[inline]
    fn from(v: u32) -> Self {
        StatusCode(v)
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({:#X})", self.name(), self.0)
    }
}

/// Decides which notification statuses carry a usable value.
///
/// Good is always accepted; further codes come from the
/// `workarounds.additional_valid_status_codes` setting.
#[derive(Debug, Clone, Default)]
pub struct StatusPolicy {
    additional: HashSet<u32>,
}

impl StatusPolicy {
    pub fn from_codes<S: AsRef<str>>(codes: &[S]) -> ListenerResult<Self> {
        let mut additional = HashSet::with_capacity(codes.len());
        for raw in codes {
            let raw = raw.as_ref();
            let code = parse_u32_literal(raw.trim()).ok_or_else(|| {
                ListenerError::ConfigurationError(format!(
                    "parsing additional valid status code \"{raw}\" failed"
                ))
            })?;
            additional.insert(code);
        }
        Ok(Self { additional })
    }

    #[inline]
    pub fn is_ok(&self, status: StatusCode) -> bool {
        status == StatusCode::GOOD || self.additional.contains(&status.0)
    }
}

/// Parse an unsigned 32-bit literal with an optional `0x`, `0o` or `0b` prefix.
fn parse_u32_literal(s: &str) -> Option<u32> {
    let lower = s.to_ascii_lowercase();
    let (digits, radix) = if let Some(rest) = lower.strip_prefix("0x") {
        (rest, 16)
    } else if let Some(rest) = lower.strip_prefix("0o") {
        (rest, 8)
    } else if let Some(rest) = lower.strip_prefix("0b") {
        (rest, 2)
    } else {
        (lower.as_str(), 10)
    };
    let digits = digits.replace('_', "");
    if digits.is_empty() {
        return None;
    }
    u32::from_str_radix(&digits, radix).ok()
}
