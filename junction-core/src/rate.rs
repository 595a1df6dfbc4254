//! Effective poll rate resolution for junction links.

/// Poll rate used when neither links nor sources configure one.
pub const DEFAULT_POLL_RATE_MS: u64 = 5000;

/// Resolve the poll rate a consumer should request for a source.
///
/// The smallest strictly positive override across both tiers wins (device
/// links first, then collector links). Zero or negative overrides mean "no
/// override". Without any override, the device default is used, then the
/// collector default, then [`DEFAULT_POLL_RATE_MS`].
pub fn resolve_poll_rate(
    device_overrides: &[i64],
    collector_overrides: &[i64],
    device_default: Option<i64>,
    collector_default: Option<i64>,
) -> u64 {
    device_overrides
        .iter()
        .chain(collector_overrides)
        .copied()
        .filter(|rate| *rate > 0)
        .min()
        .or_else(|| device_default.filter(|rate| *rate > 0))
        .or_else(|| collector_default.filter(|rate| *rate > 0))
        .map(|rate| rate as u64)
        .unwrap_or(DEFAULT_POLL_RATE_MS)
}
