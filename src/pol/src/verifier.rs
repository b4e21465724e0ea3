//! Checkpoint-replay verification.
//!
//! Every saved interval `[i, i + save_freq)` of the index sequence is
//! replayed from the checkpoint at its start and the reproduced state is
//! compared with the checkpoint recorded at its end. Full verification does
//! this for every interval; top-q verification ranks the intervals of each
//! epoch and only deep-checks the q most suspicious ones per metric.

use std::collections::{BTreeSet, HashMap};
use std::ops::Range;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::distance::{checkpoint_distance, exceeds, stored_distance, DistanceRecord, Metric, ThresholdSet};
use crate::error::{PolError, Result};
use crate::params::ParamSet;
use crate::replay::ReplayRunner;
use crate::storage::{ProofDir, INDICES_FILE};

/// One checkpoint interval of the index sequence.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Interval {
    pub index: usize,
    pub start: usize,
    pub end: usize,
}

/// Split `total` steps into save intervals; the last one may be shorter.
pub fn intervals(total: usize, save_freq: usize) -> Result<Vec<Interval>> {
    if save_freq == 0 {
        return Err(PolError::InvalidConfig("save frequency must be positive".to_string()));
    }
    Ok((0..total)
        .step_by(save_freq)
        .enumerate()
        .map(|(index, start)| Interval { index, start, end: (start + save_freq).min(total) })
        .collect())
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct IntervalResult {
    pub interval: Interval,
    pub distances: DistanceRecord,
}

/// Per-metric aggregate over a set of checked intervals.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct MetricSummary {
    pub metric: Metric,
    pub threshold: f64,
    pub mean: f64,
    pub max: f64,
    pub min: f64,
    pub above: usize,
    pub total: usize,
}

impl MetricSummary {
    fn new(metric: Metric, threshold: f64, results: &[IntervalResult]) -> Self {
        let values: Vec<f64> = results.iter().filter_map(|r| r.distances.get(metric)).collect();
        let total = values.len();
        let mean = if total == 0 { 0.0 } else { values.iter().sum::<f64>() / total as f64 };
        // f64::max and f64::min skip NaN
        let (min, max) = if total == 0 {
            (0.0, 0.0)
        } else if values.iter().any(|d| d.is_nan()) {
            (f64::NAN, f64::NAN)
        } else {
            let min = values.iter().copied().fold(f64::INFINITY, f64::min);
            let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
            (min, max)
        };
        Self {
            metric,
            threshold,
            mean,
            max,
            min,
            above: values.iter().filter(|&&d| exceeds(d, threshold)).count(),
            total,
        }
    }

    pub fn fraction_above(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.above as f64 / self.total as f64
        }
    }

    fn log(&self, q: Option<usize>) {
        match q {
            Some(q) => info!("Distance metric: {} || threshold: {} || Q={}", self.metric, self.threshold, q),
            None => info!("Distance metric: {} || threshold: {}", self.metric, self.threshold),
        }
        info!("Average distance: {}, Max distance: {}, Min distance: {}", self.mean, self.max, self.min);
        if self.above == 0 {
            info!("None of the steps is above the threshold, the proof-of-learning is valid.");
        } else {
            info!(
                "{} / {} ({}%) of the steps are above the threshold, the proof-of-learning is invalid.",
                self.above,
                self.total,
                100.0 * self.fraction_above()
            );
        }
    }
}

/// Why a proof was rejected.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Violation {
    Distance { metric: Metric, threshold: f64, above: usize, total: usize },
    Initialization { min_p_value: f64, threshold: f64 },
    DatasetHash { expected: String, computed: String },
}

/// Aggregate outcome handed back to callers.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Verdict {
    Valid,
    Invalid { violations: Vec<Violation> },
}

impl Verdict {
    pub fn from_violations(violations: Vec<Violation>) -> Self {
        if violations.is_empty() {
            Verdict::Valid
        } else {
            Verdict::Invalid { violations }
        }
    }

    pub fn from_summaries(summaries: &[MetricSummary]) -> Self {
        Self::from_violations(
            summaries
                .iter()
                .filter(|s| s.above > 0)
                .map(|s| Violation::Distance {
                    metric: s.metric,
                    threshold: s.threshold,
                    above: s.above,
                    total: s.total,
                })
                .collect(),
        )
    }

    pub fn is_valid(&self) -> bool {
        matches!(self, Verdict::Valid)
    }

    pub fn violations(&self) -> &[Violation] {
        match self {
            Verdict::Valid => &[],
            Verdict::Invalid { violations } => violations,
        }
    }

    pub fn combine(self, other: Verdict) -> Verdict {
        let mut all = self.violations().to_vec();
        all.extend_from_slice(other.violations());
        Verdict::from_violations(all)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FullReport {
    pub intervals: Vec<IntervalResult>,
    pub summaries: Vec<MetricSummary>,
    pub verdict: Verdict,
}

/// How phase one of top-q verification scores intervals.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum RankingMode {
    /// Replay every interval and rank by reproduction error.
    Replay,
    /// Rank by the distance between consecutive recorded checkpoints.
    Update,
}

#[derive(Clone, Debug, PartialEq)]
pub struct TopQOptions {
    pub epochs: usize,
    pub q: usize,
    pub ranking: RankingMode,
    /// Reuse phase-one reproductions for the selected intervals.
    pub cache_replays: bool,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EpochReport {
    pub epoch: usize,
    pub ranking: Vec<IntervalResult>,
    /// Interval indices chosen for the deep check.
    pub selected: Vec<usize>,
    pub checked: Vec<IntervalResult>,
    pub summaries: Vec<MetricSummary>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct TopQReport {
    pub q: usize,
    pub epochs: Vec<EpochReport>,
    pub verdict: Verdict,
}

/// Positions (into `ranking`) of the union, over `metrics`, of the q largest distances.
pub fn select_top_q(ranking: &[DistanceRecord], metrics: &[Metric], q: usize) -> Vec<usize> {
    let mut selected = BTreeSet::new();
    for &metric in metrics {
        let mut order: Vec<(usize, f64)> = ranking
            .iter()
            .enumerate()
            .map(|(i, r)| (i, r.get(metric).unwrap_or(0.0)))
            .collect();
        // NaN sorts first: an unreproducible interval is the most suspicious
        order.sort_by(|a, b| match (a.1.is_nan(), b.1.is_nan()) {
            (true, false) => std::cmp::Ordering::Less,
            (false, true) => std::cmp::Ordering::Greater,
            _ => b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal),
        });
        selected.extend(order.into_iter().take(q).map(|(i, _)| i));
    }
    selected.into_iter().collect()
}

/// Interval ranges covered by each epoch.
///
/// Epoch `e` spans `round(c*e) .. round(c*(e+1))` with
/// `c = total / epochs / save_freq`; the last epoch runs to the final interval.
pub fn epoch_ranges(total: usize, save_freq: usize, epochs: usize) -> Result<Vec<Range<usize>>> {
    if epochs == 0 {
        return Err(PolError::InvalidConfig("epochs must be positive".to_string()));
    }
    let n = intervals(total, save_freq)?.len();
    let per_epoch = total as f64 / epochs as f64 / save_freq as f64;
    Ok((0..epochs)
        .map(|e| {
            let start = ((per_epoch * e as f64).round_ties_even() as usize).min(n);
            let end = if e + 1 == epochs {
                n
            } else {
                ((per_epoch * (e + 1) as f64).round_ties_even() as usize).min(n)
            };
            start..end.max(start)
        })
        .collect())
}

pub struct Verifier<'a> {
    proof: ProofDir,
    runner: ReplayRunner<'a>,
    thresholds: ThresholdSet,
    save_freq: usize,
}

impl<'a> Verifier<'a> {
    pub fn new(proof: ProofDir, runner: ReplayRunner<'a>, thresholds: ThresholdSet, save_freq: usize) -> Result<Self> {
        if save_freq == 0 {
            return Err(PolError::InvalidConfig("save frequency must be positive".to_string()));
        }
        Ok(Self { proof, runner, thresholds, save_freq })
    }

    fn load_sequence(&self) -> Result<Vec<usize>> {
        let sequence = self.proof.load_indices()?;
        if sequence.is_empty() {
            return Err(PolError::format(self.proof.root().join(INDICES_FILE), "empty index sequence"));
        }
        Ok(sequence)
    }

    fn replay_interval(&self, sequence: &[usize], interval: &Interval) -> Result<ParamSet> {
        let start = self.proof.load_checkpoint(interval.start)?;
        self.runner.replay(&start.net, &sequence[interval.start..interval.end])
    }

    fn compare(&self, interval: &Interval, reproduced: &ParamSet) -> Result<DistanceRecord> {
        checkpoint_distance(
            &self.proof.checkpoint_path(interval.end),
            reproduced,
            &self.thresholds.metrics(),
            self.runner.hyper().half,
        )
    }

    fn summarize(&self, results: &[IntervalResult]) -> Vec<MetricSummary> {
        self.thresholds
            .limits
            .iter()
            .map(|&(metric, threshold)| MetricSummary::new(metric, threshold, results))
            .collect()
    }

    /// Replay and check every interval.
    pub fn verify_all(&self) -> Result<FullReport> {
        let sequence = self.load_sequence()?;
        let mut results = Vec::new();
        for interval in intervals(sequence.len(), self.save_freq)? {
            let reproduced = self.replay_interval(&sequence, &interval)?;
            let distances = self.compare(&interval, &reproduced)?;
            results.push(IntervalResult { interval, distances });
        }

        let summaries = self.summarize(&results);
        summaries.iter().for_each(|s| s.log(None));
        let verdict = Verdict::from_summaries(&summaries);
        Ok(FullReport { intervals: results, summaries, verdict })
    }

    /// Rank every interval of each epoch, then deep-check the top q per metric.
    pub fn verify_topq(&self, opts: &TopQOptions) -> Result<TopQReport> {
        if opts.q == 0 {
            return Err(PolError::InvalidConfig("top-q verification needs q > 0".to_string()));
        }
        let sequence = self.load_sequence()?;
        let all = intervals(sequence.len(), self.save_freq)?;
        let metrics = self.thresholds.metrics();
        let half = self.runner.hyper().half;
        let ranges = epoch_ranges(sequence.len(), self.save_freq, opts.epochs)?;

        let mut epochs = Vec::with_capacity(ranges.len());
        for (epoch, range) in ranges.into_iter().enumerate() {
            info!("Verifying epoch {}/{}", epoch + 1, opts.epochs);
            if range.is_empty() {
                warn!(epoch = epoch + 1, "epoch has no checkpoint intervals");
                continue;
            }

            let mut cache: HashMap<usize, ParamSet> = HashMap::new();
            let mut ranking = Vec::with_capacity(range.len());
            for interval in &all[range.clone()] {
                let distances = match opts.ranking {
                    RankingMode::Replay => {
                        let reproduced = self.replay_interval(&sequence, interval)?;
                        let distances = self.compare(interval, &reproduced)?;
                        if opts.cache_replays {
                            cache.insert(interval.index, reproduced);
                        }
                        distances
                    }
                    RankingMode::Update => stored_distance(
                        &self.proof.checkpoint_path(interval.start),
                        &self.proof.checkpoint_path(interval.end),
                        &metrics,
                        half,
                    )?,
                };
                ranking.push(IntervalResult { interval: *interval, distances });
            }

            let records: Vec<DistanceRecord> = ranking.iter().map(|r| r.distances.clone()).collect();
            let selected: Vec<usize> = select_top_q(&records, &metrics, opts.q)
                .into_iter()
                .map(|pos| range.start + pos)
                .collect();

            let mut checked = Vec::with_capacity(selected.len());
            for &index in &selected {
                let interval = &all[index];
                let reproduced = match cache.remove(&index) {
                    Some(cached) => cached,
                    None => self.replay_interval(&sequence, interval)?,
                };
                let distances = self.compare(interval, &reproduced)?;
                checked.push(IntervalResult { interval: *interval, distances });
            }

            let summaries = self.summarize(&checked);
            summaries.iter().for_each(|s| s.log(Some(opts.q)));
            epochs.push(EpochReport { epoch, ranking, selected, checked, summaries });
        }

        let checked: Vec<IntervalResult> = epochs.iter().flat_map(|e| e.checked.iter().cloned()).collect();
        let verdict = Verdict::from_summaries(&self.summarize(&checked));
        Ok(TopQReport { q: opts.q, epochs, verdict })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(values: &[f64]) -> DistanceRecord {
        DistanceRecord {
            values: Metric::ALL.iter().copied().zip(values.iter().copied()).collect(),
        }
    }

    #[test]
    fn test_intervals_cover_sequence() {
        let ivs = intervals(250, 100).unwrap();
        assert_eq!(ivs.len(), 3);
        assert_eq!(ivs[2], Interval { index: 2, start: 200, end: 250 });
        assert_eq!(intervals(200, 100).unwrap().last().unwrap().end, 200);
        assert!(intervals(10, 0).is_err());
    }

    #[test]
    fn test_epoch_ranges() {
        assert_eq!(epoch_ranges(1000, 100, 2).unwrap(), vec![0..5, 5..10]);
        // 2.5 rounds to even, the trailing short interval joins the last epoch
        assert_eq!(epoch_ranges(500, 100, 2).unwrap(), vec![0..2, 2..5]);
        assert_eq!(epoch_ranges(250, 100, 1).unwrap(), vec![0..3]);
    }

    #[test]
    fn test_top_q_agreeing_metrics() {
        let ranking = vec![
            record(&[1.0, 1.0, 1.0, 0.1]),
            record(&[9.0, 9.0, 9.0, 0.9]),
            record(&[5.0, 5.0, 5.0, 0.5]),
            record(&[2.0, 2.0, 2.0, 0.2]),
        ];
        assert_eq!(select_top_q(&ranking, &Metric::ALL, 2), vec![1, 2]);
    }

    #[test]
    fn test_top_q_disagreeing_metrics() {
        let ranking = vec![
            record(&[9.0, 0.0, 0.0, 0.0]),
            record(&[0.0, 9.0, 0.0, 0.0]),
            record(&[0.0, 0.0, 9.0, 0.0]),
            record(&[0.0, 0.0, 0.0, 9.0]),
            record(&[1.0, 1.0, 1.0, 1.0]),
        ];
        let selected = select_top_q(&ranking, &Metric::ALL, 1);
        assert_eq!(selected, vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_top_q_union_size_bounds() {
        // a deterministic spread of rankings; the union is bounded by q and q * metrics
        for seed in 0..20u64 {
            let ranking: Vec<DistanceRecord> = (0..7u64)
                .map(|i| {
                    let v = |k: u64| ((seed * 31 + i * 17 + k * 7) % 11) as f64;
                    record(&[v(0), v(1), v(2), v(3)])
                })
                .collect();
            for q in 1..4 {
                let n = select_top_q(&ranking, &Metric::ALL, q).len();
                assert!(n >= q && n <= (q * 4).min(7), "seed {seed} q {q}: {n}");
            }
        }
    }

    #[test]
    fn test_nan_distance_ranks_first_and_fails() {
        let ranking = vec![record(&[1.0; 4]), record(&[f64::NAN; 4]), record(&[2.0; 4])];
        assert_eq!(select_top_q(&ranking, &[Metric::L2], 1), vec![1]);

        let results: Vec<IntervalResult> = ranking
            .into_iter()
            .enumerate()
            .map(|(index, distances)| IntervalResult {
                interval: Interval { index, start: index, end: index + 1 },
                distances,
            })
            .collect();
        let summary = MetricSummary::new(Metric::L2, 10.0, &results);
        assert_eq!(summary.above, 1);
    }

    #[test]
    fn test_nan_distance_poisons_the_summary() {
        let results: Vec<IntervalResult> = [record(&[0.5; 4]), record(&[f64::NAN; 4])]
            .into_iter()
            .enumerate()
            .map(|(index, distances)| IntervalResult {
                interval: Interval { index, start: index, end: index + 1 },
                distances,
            })
            .collect();
        let summary = MetricSummary::new(Metric::Linf, 10.0, &results);
        assert!(summary.max.is_nan());
        assert!(summary.min.is_nan());
        assert!(summary.mean.is_nan());
        assert_eq!((summary.above, summary.total), (1, 2));

        let clean = MetricSummary::new(Metric::Linf, 10.0, &results[..1]);
        assert_eq!((clean.min, clean.max, clean.mean), (0.5, 0.5, 0.5));
        let empty = MetricSummary::new(Metric::Linf, 10.0, &[]);
        assert_eq!((empty.min, empty.max, empty.mean, empty.total), (0.0, 0.0, 0.0, 0));
    }

    #[test]
    fn test_verdict_from_summaries() {
        let results = vec![IntervalResult {
            interval: Interval { index: 0, start: 0, end: 100 },
            distances: record(&[5.0, 0.5, 0.01, 0.001]),
        }];
        let ok = MetricSummary::new(Metric::L2, 1.0, &results);
        let bad = MetricSummary::new(Metric::L1, 1.0, &results);
        assert!(Verdict::from_summaries(&[ok.clone()]).is_valid());
        let verdict = Verdict::from_summaries(&[ok, bad]);
        assert_eq!(
            verdict.violations(),
            &[Violation::Distance { metric: Metric::L1, threshold: 1.0, above: 1, total: 1 }]
        );
        let json = serde_json::to_value(&verdict).unwrap();
        assert_eq!(json["status"], "invalid");
    }
}
