use serde::Serialize;
use std::sync::{
    Arc,
    atomic::{AtomicU8, Ordering},
};

/// Key-schema variant written by the job broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BrokerVersion {
    #[default]
    Unknown,
    V7,
    V8,
}

const PERIODS_V7: [&str; 4] = ["1h", "2h", "4h", "8h"];
const PERIODS_ALL: [&str; 7] = ["1h", "2h", "4h", "8h", "24h", "48h", "72h"];

impl BrokerVersion {
    /// Metrics period keys the broker can serve. V7 keeps no hourly rollups.
    pub fn metrics_periods(self) -> &'static [&'static str] {
        match self {
            Self::V7 => &PERIODS_V7,
            Self::V8 | Self::Unknown => &PERIODS_ALL,
        }
    }

    fn to_u8(self) -> u8 {
        match self {
            Self::Unknown => 0,
            Self::V7 => 7,
            Self::V8 => 8,
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            7 => Self::V7,
            8 => Self::V8,
            _ => Self::Unknown,
        }
    }
}

/// Classifies a metrics rollup key (`j|<date>|<hour>:<minute>`) by the width
/// of its date segment.
pub(crate) fn classify_rollup_key(key: &str) -> Option<BrokerVersion> {
    let mut parts = key.split('|');
    if parts.next() != Some("j") {
        return None;
    }
    let date = parts.next()?;
    let time = parts.next()?;
    if parts.next().is_some() || !date.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let (hour, minute) = time.split_once(':')?;
    if hour.is_empty() || minute.is_empty() {
        return None;
    }
    match date.len() {
        6 => Some(BrokerVersion::V8),
        8 => Some(BrokerVersion::V7),
        _ => None,
    }
}

/// Folds the versions seen during a scan. V8 wins over V7 mid-upgrade.
pub(crate) fn merge_detected(current: BrokerVersion, seen: BrokerVersion) -> BrokerVersion {
    match (current, seen) {
        (BrokerVersion::V8, _) | (_, BrokerVersion::V8) => BrokerVersion::V8,
        (BrokerVersion::V7, _) | (_, BrokerVersion::V7) => BrokerVersion::V7,
        _ => BrokerVersion::Unknown,
    }
}

/// Shared, write-once-detected broker version.
///
/// Only a detected (non-`Unknown`) value is ever stored, so readers observe
/// `Unknown` until detection succeeds and then the same value forever.
#[derive(Clone, Default)]
pub(crate) struct VersionCache(Arc<AtomicU8>);

impl VersionCache {
    pub(crate) fn get(&self) -> BrokerVersion {
        BrokerVersion::from_u8(self.0.load(Ordering::Acquire))
    }

    pub(crate) fn store(&self, version: BrokerVersion) -> BrokerVersion {
        if version == BrokerVersion::Unknown {
            return self.get();
        }
        match self.0.compare_exchange(
            BrokerVersion::Unknown.to_u8(),
            version.to_u8(),
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            Ok(_) => version,
            Err(existing) => BrokerVersion::from_u8(existing),
        }
    }
}
