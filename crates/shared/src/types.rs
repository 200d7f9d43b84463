//! Common types used across Reelkit

use serde::{Deserialize, Serialize};

// =============================================================================
// Usage kinds
// =============================================================================

/// Billable work unit produced by the content pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum UsageKind {
    /// Script generation
    Script,
    /// Voiceover synthesis
    Voice,
    /// Lip-sync rendering
    Lipsync,
    /// Timeline edit/export
    Edit,
}

impl UsageKind {
    /// All kinds, in the order they appear on the usage subscription
    pub const ALL: [UsageKind; 4] = [Self::Script, Self::Voice, Self::Lipsync, Self::Edit];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Script => "script",
            Self::Voice => "voice",
            Self::Lipsync => "lipsync",
            Self::Edit => "edit",
        }
    }

    /// Ledger column holding the lifetime counter for this kind
    pub fn counter_column(&self) -> &'static str {
        match self {
            Self::Script => "script_count",
            Self::Voice => "voice_count",
            Self::Lipsync => "lipsync_count",
            Self::Edit => "edit_count",
        }
    }
}

impl std::str::FromStr for UsageKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "script" => Ok(Self::Script),
            "voice" => Ok(Self::Voice),
            "lipsync" => Ok(Self::Lipsync),
            "edit" => Ok(Self::Edit),
            other => Err(format!("unknown usage kind: {other}")),
        }
    }
}

impl std::fmt::Display for UsageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// =============================================================================
// Access subscription status
// =============================================================================

/// Local mirror of the payer's access subscription status.
///
/// Values track Stripe's subscription statuses; `Unknown` covers anything a
/// newer API version might send that we don't recognize.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "VARCHAR", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum AccessStatus {
    Trialing,
    Active,
    PastDue,
    Canceled,
    Unpaid,
    Incomplete,
    IncompleteExpired,
    Paused,
    Unknown,
}

impl AccessStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Trialing => "trialing",
            Self::Active => "active",
            Self::PastDue => "past_due",
            Self::Canceled => "canceled",
            Self::Unpaid => "unpaid",
            Self::Incomplete => "incomplete",
            Self::IncompleteExpired => "incomplete_expired",
            Self::Paused => "paused",
            Self::Unknown => "unknown",
        }
    }

    /// Parse a Stripe subscription status string, never failing
    pub fn parse(s: &str) -> Self {
        match s {
            "trialing" => Self::Trialing,
            "active" => Self::Active,
            "past_due" => Self::PastDue,
            "canceled" => Self::Canceled,
            "unpaid" => Self::Unpaid,
            "incomplete" => Self::Incomplete,
            "incomplete_expired" => Self::IncompleteExpired,
            "paused" => Self::Paused,
            _ => Self::Unknown,
        }
    }

    /// Whether this status entitles the payer to consume usage
    pub fn is_usable(&self) -> bool {
        matches!(self, Self::Active | Self::Trialing)
    }

    /// Block reason to record on the ledger, if this status blocks billing
    pub fn block_reason(&self) -> Option<&'static str> {
        match self {
            Self::PastDue => Some("subscription_past_due"),
            Self::Unpaid => Some("subscription_unpaid"),
            Self::Incomplete => Some("subscription_incomplete"),
            Self::IncompleteExpired => Some("subscription_incomplete_expired"),
            _ => None,
        }
    }
}

impl std::fmt::Display for AccessStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    #[test]
    fn usage_kind_round_trips_through_str() {
        for kind in UsageKind::ALL {
            assert_eq!(UsageKind::from_str(kind.as_str()), Ok(kind));
        }
        assert!(UsageKind::from_str("thumbnail").is_err());
    }

    #[test]
    fn access_status_usability() {
        assert!(AccessStatus::Active.is_usable());
        assert!(AccessStatus::Trialing.is_usable());
        assert!(!AccessStatus::PastDue.is_usable());
        assert!(!AccessStatus::Canceled.is_usable());
        assert!(!AccessStatus::Unknown.is_usable());
    }

    #[test]
    fn block_reasons_cover_delinquent_statuses() {
        assert_eq!(
            AccessStatus::PastDue.block_reason(),
            Some("subscription_past_due")
        );
        assert_eq!(AccessStatus::Unpaid.block_reason(), Some("subscription_unpaid"));
        assert!(AccessStatus::Incomplete.block_reason().is_some());
        assert!(AccessStatus::IncompleteExpired.block_reason().is_some());
        assert_eq!(AccessStatus::Active.block_reason(), None);
        assert_eq!(AccessStatus::Trialing.block_reason(), None);
        assert_eq!(AccessStatus::Canceled.block_reason(), None);
    }

    #[test]
    fn parse_is_total() {
        assert_eq!(AccessStatus::parse("past_due"), AccessStatus::PastDue);
        assert_eq!(AccessStatus::parse("something_new"), AccessStatus::Unknown);
    }
}
