//! Plan catalogue
//!
//! The plan identifier is stored on both `subscriptions.plan` and the
//! denormalized `organizations.plan` column as the uppercase string form.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Plan {
    #[default]
    Free,
    Pro,
    Business,
    Enterprise,
}

impl Plan {
    pub fn as_str(&self) -> &'static str {
        match self {
            Plan::Free => "FREE",
            Plan::Pro => "PRO",
            Plan::Business => "BUSINESS",
            Plan::Enterprise => "ENTERPRISE",
        }
    }

    /// Knowledge items an organization may archive per calendar month.
    /// `None` means unlimited.
    pub fn monthly_archive_limit(&self) -> Option<i64> {
        match self {
            Plan::Free => Some(25),
            Plan::Pro => Some(500),
            Plan::Business => Some(5_000),
            Plan::Enterprise => None,
        }
    }

    /// Usage count at which the owner gets an early warning (80% of the limit).
    pub fn usage_warning_threshold(&self) -> Option<i64> {
        self.monthly_archive_limit()
            .map(|limit| (limit * 4 + 4) / 5)
    }
}

impl fmt::Display for Plan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown plan: {0}")]
pub struct UnknownPlan(pub String);

impl FromStr for Plan {
    type Err = UnknownPlan;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "FREE" => Ok(Plan::Free),
            "PRO" => Ok(Plan::Pro),
            "BUSINESS" => Ok(Plan::Business),
            "ENTERPRISE" => Ok(Plan::Enterprise),
            _ => Err(UnknownPlan(s.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_case_insensitively() {
        assert_eq!("business".parse::<Plan>().unwrap(), Plan::Business);
        assert_eq!("PRO".parse::<Plan>().unwrap(), Plan::Pro);
        assert!("gold".parse::<Plan>().is_err());
    }

    #[test]
    fn warning_threshold_is_eighty_percent_rounded_up() {
        assert_eq!(Plan::Free.usage_warning_threshold(), Some(20));
        assert_eq!(Plan::Pro.usage_warning_threshold(), Some(400));
        assert_eq!(Plan::Enterprise.usage_warning_threshold(), None);
    }

    #[test]
    fn serializes_as_uppercase() {
        let json = serde_json::to_string(&Plan::Business).unwrap();
        assert_eq!(json, "\"BUSINESS\"");
    }
}
