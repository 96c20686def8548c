//! Time-series harmonization
//!
//! This module aligns independently sampled source series onto one daily grid:
//! - Timestamps collapse to timezone-naive calendar days (same-day values are averaged)
//! - Trading series forward-fill across short closures (weekends)
//! - Weekly and monthly series forward-fill across their release gap
//! - Continuous daily series are linearly interpolated across the full span
//!
//! Rows where every signal is still missing after filling are dropped.
//! Output depends only on the set of inputs, never on their order.

use crate::error::ComputeError;
use crate::types::{Cadence, HarmonizedRow, SourceFetch};
use chrono::{Days, Duration, NaiveDate};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, warn};

/// Default forward-fill window for weekday-only series (days)
pub const DEFAULT_TRADING_FILL_DAYS: usize = 2;
/// Default forward-fill window for weekly series (days)
pub const DEFAULT_WEEKLY_FILL_DAYS: usize = 30;
/// Default forward-fill window for monthly series (days)
pub const DEFAULT_MONTHLY_FILL_DAYS: usize = 90;
/// Default cap on the grid length (days)
pub const DEFAULT_MAX_SPAN_DAYS: usize = 36_500;

/// Gap-filling windows per cadence
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HarmonizerConfig {
    pub trading_fill_days: usize,
    pub weekly_fill_days: usize,
    pub monthly_fill_days: usize,
    /// Longest grid built; older observations are dropped
    pub max_span_days: usize,
}

impl Default for HarmonizerConfig {
    fn default() -> Self {
        Self {
            trading_fill_days: DEFAULT_TRADING_FILL_DAYS,
            weekly_fill_days: DEFAULT_WEEKLY_FILL_DAYS,
            monthly_fill_days: DEFAULT_MONTHLY_FILL_DAYS,
            max_span_days: DEFAULT_MAX_SPAN_DAYS,
        }
    }
}

impl HarmonizerConfig {
    /// Forward-fill limit for a cadence; `None` means interpolate instead
    pub fn fill_limit(&self, cadence: Cadence) -> Option<usize> {
        match cadence {
            Cadence::Daily => None,
            Cadence::Trading => Some(self.trading_fill_days),
            Cadence::Weekly => Some(self.weekly_fill_days),
            Cadence::Monthly => Some(self.monthly_fill_days),
        }
    }
}

/// A source that could not contribute data to this harmonization
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SourceIssue {
    pub source: String,
    pub reason: String,
}

/// Wide daily table produced by the harmonizer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HarmonizedTable {
    /// Known signal names, sorted
    pub signals: Vec<String>,
    /// One row per day with at least one value, ascending
    pub rows: Vec<HarmonizedRow>,
    /// Sources that were unavailable or empty, sorted
    pub unavailable: Vec<SourceIssue>,
    /// Set when observations older than this day were dropped to bound the grid
    #[serde(default)]
    pub truncated_before: Option<NaiveDate>,
}

impl HarmonizedTable {
    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn start(&self) -> Option<NaiveDate> {
        self.rows.first().map(|r| r.timestamp)
    }

    pub fn end(&self) -> Option<NaiveDate> {
        self.rows.last().map(|r| r.timestamp)
    }

    /// Values of one signal in row order
    pub fn column(&self, signal: &str) -> Vec<Option<f64>> {
        self.rows.iter().map(|r| r.value(signal)).collect()
    }

    /// Keep only rows within the last `days` calendar days of the table.
    /// A window of zero keeps everything.
    pub fn trailing(&self, days: usize) -> HarmonizedTable {
        let cutoff = match (self.end(), days) {
            (Some(end), d) if d > 0 => end.checked_sub_days(Days::new(d as u64)),
            _ => None,
        };
        let rows = match cutoff {
            Some(cutoff) => self
                .rows
                .iter()
                .filter(|r| r.timestamp > cutoff)
                .cloned()
                .collect(),
            None => self.rows.clone(),
        };
        HarmonizedTable {
            signals: self.signals.clone(),
            rows,
            unavailable: self.unavailable.clone(),
            truncated_before: self.truncated_before,
        }
    }
}

/// Per-signal accumulator before grid alignment
#[derive(Debug, Default)]
struct ColumnInput {
    cadence: Cadence,
    by_day: BTreeMap<NaiveDate, Vec<f64>>,
}

/// Harmonizer for aligning source series onto a daily grid
#[derive(Debug, Clone, Default)]
pub struct Harmonizer {
    config: HarmonizerConfig,
}

impl Harmonizer {
    pub fn new(config: HarmonizerConfig) -> Self {
        Self { config }
    }

    /// Align all sources onto one daily grid spanning the union of their dates.
    ///
    /// An unavailable source yields an all-missing column and a [`SourceIssue`];
    /// it never aborts the others. Returns [`ComputeError::NoData`] only when
    /// no source produced a single finite observation.
    pub fn harmonize(&self, sources: &[SourceFetch]) -> Result<HarmonizedTable, ComputeError> {
        let mut columns: BTreeMap<String, ColumnInput> = BTreeMap::new();

        for fetch in sources {
            match fetch {
                SourceFetch::Ok(series) => {
                    let column = columns.entry(series.name.clone()).or_default();
                    // Duplicate names merge; the longest-filling cadence wins
                    column.cadence = column.cadence.max(series.cadence);

                    for point in series.points.iter().filter(|p| p.value.is_finite()) {
                        column
                            .by_day
                            .entry(point.timestamp)
                            .or_default()
                            .push(point.value);
                    }
                }
                SourceFetch::Unavailable { source, cadence, .. } => {
                    let column = columns.entry(source.clone()).or_default();
                    column.cadence = column.cadence.max(*cadence);
                }
            }
        }

        let unavailable = source_issues(sources);

        let start = columns
            .values()
            .filter_map(|c| c.by_day.keys().next().copied())
            .min();
        let end = columns
            .values()
            .filter_map(|c| c.by_day.keys().next_back().copied())
            .max();

        let (start, end) = match (start, end) {
            (Some(s), Some(e)) => (s, e),
            _ => {
                return Err(ComputeError::NoData(format!(
                    "none of {} sources produced an observation",
                    sources.len()
                )))
            }
        };

        // A stray far-off timestamp must not blow up the grid
        let max_span = self.config.max_span_days.max(1);
        let earliest = end
            .checked_sub_days(Days::new(max_span as u64 - 1))
            .unwrap_or(NaiveDate::MIN);
        let (start, truncated_before) = if start < earliest {
            warn!(
                first = %start,
                last = %end,
                max_span_days = max_span,
                "source span too long, dropping older observations"
            );
            let kept = columns
                .values()
                .filter_map(|c| c.by_day.range(earliest..).next().map(|(day, _)| *day))
                .min()
                .unwrap_or(end);
            (kept, Some(earliest))
        } else {
            (start, None)
        };

        let span = (end - start).num_days() as usize + 1;
        let mut filled: BTreeMap<String, Vec<Option<f64>>> = BTreeMap::new();

        for (name, column) in &columns {
            let mut values = vec![None; span];
            for (day, day_values) in column.by_day.range(start..) {
                let offset = (*day - start).num_days() as usize;
                values[offset] = Some(stable_mean(day_values));
            }

            match self.config.fill_limit(column.cadence) {
                Some(limit) => forward_fill(&mut values, limit),
                None => interpolate_linear(&mut values),
            }
            filled.insert(name.clone(), values);
        }

        let mut rows = Vec::with_capacity(span);
        for offset in 0..span {
            let values: BTreeMap<String, Option<f64>> = filled
                .iter()
                .map(|(name, column)| (name.clone(), column[offset]))
                .collect();
            if values.values().all(Option::is_none) {
                continue;
            }
            rows.push(HarmonizedRow {
                timestamp: start + Duration::days(offset as i64),
                values,
            });
        }

        debug!(
            signals = filled.len(),
            rows = rows.len(),
            span_days = span,
            unavailable = unavailable.len(),
            "harmonized sources"
        );

        Ok(HarmonizedTable {
            signals: filled.keys().cloned().collect(),
            rows,
            unavailable,
            truncated_before,
        })
    }
}

/// Sources that cannot contribute a single observation, sorted and deduplicated.
///
/// Available on its own so callers can still report per-source reasons when
/// harmonization ends in [`ComputeError::NoData`].
pub fn source_issues(sources: &[SourceFetch]) -> Vec<SourceIssue> {
    let mut issues: Vec<SourceIssue> = sources
        .iter()
        .filter_map(|fetch| match fetch {
            SourceFetch::Ok(series) => {
                if series.points.iter().any(|p| p.value.is_finite()) {
                    None
                } else {
                    debug!(source = %series.name, "source has no finite observations");
                    Some(SourceIssue {
                        source: series.name.clone(),
                        reason: "no finite observations".to_string(),
                    })
                }
            }
            SourceFetch::Unavailable { source, reason, .. } => {
                warn!(source = %source, reason = %reason, "source unavailable, column treated as missing");
                Some(SourceIssue {
                    source: source.clone(),
                    reason: reason.clone(),
                })
            }
        })
        .collect();
    issues.sort();
    issues.dedup();
    issues
}

/// Mean of same-day values, summed in sorted order so the result does not
/// depend on input order
fn stable_mean(values: &[f64]) -> f64 {
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);
    sorted.iter().sum::<f64>() / sorted.len() as f64
}

/// Carry the last observation forward for at most `limit` days
fn forward_fill(values: &mut [Option<f64>], limit: usize) {
    let mut last: Option<(usize, f64)> = None;
    for i in 0..values.len() {
        match values[i] {
            Some(v) => last = Some((i, v)),
            None => {
                if let Some((j, v)) = last {
                    if i - j <= limit {
                        values[i] = Some(v);
                    }
                }
            }
        }
    }
}

/// Linear interpolation between observations; the edges take the nearest
/// observation
fn interpolate_linear(values: &mut [Option<f64>]) {
    let known: Vec<(usize, f64)> = values
        .iter()
        .enumerate()
        .filter_map(|(i, v)| v.map(|v| (i, v)))
        .collect();

    let (first, last) = match (known.first(), known.last()) {
        (Some(f), Some(l)) => (*f, *l),
        _ => return,
    };

    for slot in values.iter_mut().take(first.0) {
        *slot = Some(first.1);
    }
    for slot in values.iter_mut().skip(last.0 + 1) {
        *slot = Some(last.1);
    }

    for pair in known.windows(2) {
        let (i0, v0) = pair[0];
        let (i1, v1) = pair[1];
        let width = (i1 - i0) as f64;
        for (step, slot) in values.iter_mut().enumerate().take(i1).skip(i0 + 1) {
            let t = (step - i0) as f64 / width;
            *slot = Some(v0 + (v1 - v0) * t);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{SeriesPoint, SourceSeries};
    use chrono::Datelike;
    use pretty_assertions::assert_eq;

    fn day(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn daily_series(name: &str, start: NaiveDate, values: &[f64]) -> SourceFetch {
        let points = values
            .iter()
            .enumerate()
            .map(|(i, v)| SeriesPoint::new(start + Duration::days(i as i64), *v))
            .collect();
        SourceSeries::new(name, Cadence::Daily, points).into()
    }

    fn weekday_series(name: &str, start: NaiveDate, days: usize) -> SourceFetch {
        let points = (0..days)
            .map(|i| start + Duration::days(i as i64))
            .filter(|d| d.weekday().number_from_monday() <= 5)
            .enumerate()
            .map(|(i, d)| SeriesPoint::new(d, 0.3 + 0.01 * i as f64))
            .collect();
        SourceSeries::new(name, Cadence::Trading, points).into()
    }

    #[test]
    fn test_weekend_gaps_forward_filled() {
        // 2024-01-01 is a Monday
        let start = day(2024, 1, 1);
        let sources = vec![
            weekday_series("market_volatility", start, 30),
            daily_series("weather_discomfort", start, &[0.5; 30]),
        ];

        let table = Harmonizer::default().harmonize(&sources).unwrap();
        assert_eq!(table.len(), 30);
        assert!(table.column("market_volatility").iter().all(Option::is_some));
        assert!(table.column("weather_discomfort").iter().all(Option::is_some));

        // Saturday carries Friday's close
        let friday = table.rows[4].value("market_volatility").unwrap();
        assert_eq!(table.rows[5].value("market_volatility"), Some(friday));
    }

    #[test]
    fn test_stray_timestamp_bounded_by_max_span() {
        let start = day(2024, 1, 1);
        let mut points: Vec<SeriesPoint> = (0..10)
            .map(|i| SeriesPoint::new(start + Duration::days(i), 0.4))
            .collect();
        points.push(SeriesPoint::new(day(1, 1, 1), 0.9));
        let series = SourceSeries::new("mobility", Cadence::Daily, points);

        let table = Harmonizer::default().harmonize(&[series.into()]).unwrap();
        assert_eq!(table.len(), 10);
        assert_eq!(table.start(), Some(start));
        assert!(table.truncated_before.is_some());

        let config = HarmonizerConfig {
            max_span_days: 5,
            ..HarmonizerConfig::default()
        };
        let table = Harmonizer::new(config)
            .harmonize(&[daily_series("mobility", start, &[0.1; 10])])
            .unwrap();
        assert_eq!(table.len(), 5);
        assert_eq!(table.start(), Some(start + Duration::days(5)));
        assert_eq!(table.truncated_before, Some(start + Duration::days(5)));
    }

    #[test]
    fn test_trailing_window_larger_than_calendar_keeps_everything() {
        let start = day(2024, 1, 1);
        let table = Harmonizer::default()
            .harmonize(&[daily_series("mobility", start, &[0.2, 0.3, 0.4])])
            .unwrap();
        assert_eq!(table.trailing(usize::MAX).len(), 3);
        assert_eq!(table.trailing(2).len(), 2);
    }

    #[test]
    fn test_source_issues_without_harmonizing() {
        let sources = vec![
            SourceFetch::unavailable("search_interest", "quota"),
            SourceSeries::new("mobility", Cadence::Daily, vec![]).into(),
            daily_series("crime_signal", day(2024, 1, 1), &[0.5]),
            SourceFetch::unavailable("search_interest", "quota"),
        ];
        let issues = source_issues(&sources);
        assert_eq!(issues.len(), 2);
        assert_eq!(issues[0].source, "mobility");
        assert_eq!(issues[1].reason, "quota");
    }

    #[test]
    fn test_forward_fill_respects_limit() {
        let mut values = vec![Some(1.0), None, None, None, Some(2.0)];
        forward_fill(&mut values, 2);
        assert_eq!(values, vec![Some(1.0), Some(1.0), Some(1.0), None, Some(2.0)]);
    }

    #[test]
    fn test_interpolation_both_directions() {
        let mut values = vec![None, Some(0.2), None, None, Some(0.8), None];
        interpolate_linear(&mut values);
        let got: Vec<f64> = values.into_iter().map(Option::unwrap).collect();
        let expected = [0.2, 0.2, 0.4, 0.6, 0.8, 0.8];
        for (g, e) in got.iter().zip(expected.iter()) {
            assert!((g - e).abs() < 1e-12, "{got:?}");
        }
    }

    #[test]
    fn test_monthly_series_fills_within_window() {
        let start = day(2024, 1, 1);
        let monthly = SourceSeries::new(
            "economic_uncertainty",
            Cadence::Monthly,
            vec![SeriesPoint::new(start, 0.4), SeriesPoint::new(day(2024, 2, 1), 0.6)],
        );
        let daily = daily_series("mobility", start, &[0.5; 45]);
        let table = Harmonizer::default()
            .harmonize(&[monthly.into(), daily])
            .unwrap();

        assert_eq!(table.len(), 45);
        assert_eq!(table.rows[20].value("economic_uncertainty"), Some(0.4));
        assert_eq!(table.rows[40].value("economic_uncertainty"), Some(0.6));
    }

    #[test]
    fn test_unavailable_source_does_not_abort_others() {
        let start = day(2024, 1, 1);
        let sources = vec![
            SourceFetch::unavailable("search_interest", "upstream timeout"),
            daily_series("mobility", start, &[0.4, 0.5, 0.6]),
        ];

        let table = Harmonizer::default().harmonize(&sources).unwrap();
        assert_eq!(table.len(), 3);
        assert_eq!(table.signals, vec!["mobility", "search_interest"]);
        assert!(table.column("search_interest").iter().all(Option::is_none));
        assert_eq!(table.unavailable.len(), 1);
        assert_eq!(table.unavailable[0].source, "search_interest");
    }

    #[test]
    fn test_all_empty_is_no_data() {
        let sources = vec![
            SourceSeries::new("mobility", Cadence::Daily, vec![]).into(),
            SourceFetch::unavailable("search_interest", "down"),
        ];
        let result = Harmonizer::default().harmonize(&sources);
        assert!(matches!(result, Err(ComputeError::NoData(_))));
        assert!(matches!(
            Harmonizer::default().harmonize(&[]),
            Err(ComputeError::NoData(_))
        ));
    }

    #[test]
    fn test_non_finite_points_are_missing() {
        let start = day(2024, 1, 1);
        let table = Harmonizer::default()
            .harmonize(&[daily_series("mobility", start, &[0.2, f64::NAN, 0.6])])
            .unwrap();
        assert!((table.rows[1].value("mobility").unwrap() - 0.4).abs() < 1e-12);
    }

    #[test]
    fn test_input_order_does_not_matter() {
        let start = day(2024, 1, 1);
        let a = weekday_series("market_volatility", start, 20);
        let b = daily_series("mobility", start + Duration::days(3), &[0.1, 0.9, 0.3, 0.7]);
        let c = SourceFetch::unavailable("crime_signal", "offline");
        let d = daily_series("mobility", start + Duration::days(3), &[0.3]);

        let h = Harmonizer::default();
        let forward = h.harmonize(&[a.clone(), b.clone(), c.clone(), d.clone()]).unwrap();
        let reversed = h.harmonize(&[d, c, b, a]).unwrap();
        assert_eq!(forward, reversed);
    }

    #[test]
    fn test_rows_with_no_values_are_dropped() {
        // Two trading points a week apart: the midweek gap exceeds the fill window
        let series = SourceSeries::new(
            "market_volatility",
            Cadence::Trading,
            vec![SeriesPoint::new(day(2024, 1, 1), 0.3), SeriesPoint::new(day(2024, 1, 8), 0.4)],
        );
        let table = Harmonizer::default().harmonize(&[series.into()]).unwrap();
        let days: Vec<u32> = table.rows.iter().map(|r| r.timestamp.day()).collect();
        assert_eq!(days, vec![1, 2, 3, 8]);
    }

    #[test]
    fn test_trailing_window() {
        let start = day(2024, 1, 1);
        let table = Harmonizer::default()
            .harmonize(&[daily_series("mobility", start, &[0.5; 10])])
            .unwrap();
        let recent = table.trailing(3);
        assert_eq!(recent.len(), 3);
        assert_eq!(recent.start(), Some(day(2024, 1, 8)));
        assert_eq!(table.trailing(0).len(), 10);
    }
}
