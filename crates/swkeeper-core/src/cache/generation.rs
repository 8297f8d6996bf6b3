use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Time-based token identifying one worker install.
///
/// Ids are milliseconds since the epoch, bumped past the previous id when the
/// clock has not moved so two installs never share one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct GenerationId(u64);

impl GenerationId {
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    /// Next id at `now`, strictly greater than `previous`.
    pub fn next(now: DateTime<Utc>, previous: Option<GenerationId>) -> Self {
        let millis = now.timestamp_millis().max(0) as u64;
        match previous {
            Some(GenerationId(prev)) if millis <= prev => Self(prev + 1),
            _ => Self(millis),
        }
    }

    pub fn value(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for GenerationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The named caches making up one generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CacheRole {
    /// Shell documents primed on install and navigations.
    Core,
    /// Images, scripts and styles.
    Assets,
    /// API responses.
    Data,
}

impl CacheRole {
    pub const ALL: [CacheRole; 3] = [CacheRole::Core, CacheRole::Assets, CacheRole::Data];

    pub fn as_str(&self) -> &'static str {
        match self {
            CacheRole::Core => "core",
            CacheRole::Assets => "assets",
            CacheRole::Data => "data",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "core" => Some(CacheRole::Core),
            "assets" => Some(CacheRole::Assets),
            "data" => Some(CacheRole::Data),
            _ => None,
        }
    }
}

impl fmt::Display for CacheRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Backing store key for a named cache: `{app}-{role}-v{generation}`.
pub fn cache_name(app_name: &str, role: CacheRole, generation: GenerationId) -> String {
    format!("{}-{}-v{}", app_name, role, generation)
}

/// Inverse of [`cache_name`]. Names belonging to other apps or not following
/// the scheme yield `None`.
pub fn parse_cache_name(app_name: &str, name: &str) -> Option<(CacheRole, GenerationId)> {
    let rest = name.strip_prefix(app_name)?.strip_prefix('-')?;
    let (role, generation) = rest.split_once("-v")?;
    let role = CacheRole::parse(role)?;
    let generation = generation.parse::<u64>().ok()?;
    Some((role, GenerationId(generation)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_cache_name_round_trips() {
        let name = cache_name("ledger-app", CacheRole::Assets, GenerationId::new(42));
        assert_eq!(name, "ledger-app-assets-v42");
        assert_eq!(
            parse_cache_name("ledger-app", &name),
            Some((CacheRole::Assets, GenerationId::new(42)))
        );
    }

    #[test]
    fn test_parse_rejects_foreign_names() {
        assert_eq!(parse_cache_name("ledger", "other-core-v1"), None);
        assert_eq!(parse_cache_name("ledger", "ledger-images-v1"), None);
        assert_eq!(parse_cache_name("ledger", "ledger-core-vabc"), None);
        assert_eq!(parse_cache_name("ledger", "ledgercore-v1"), None);
    }

    #[test]
    fn test_next_is_monotonic_when_clock_stalls() {
        let now = Utc.timestamp_millis_opt(1_700_000_000_000).unwrap();
        let first = GenerationId::next(now, None);
        let second = GenerationId::next(now, Some(first));
        assert_eq!(first.value(), 1_700_000_000_000);
        assert!(second > first);

        let later = now + chrono::Duration::seconds(1);
        assert_eq!(GenerationId::next(later, Some(second)).value(), 1_700_000_001_000);
    }
}
