//! # Progress — Aggregation, ETA and the Status Line
//!
//! Combines the counters persisted from earlier runs with the live snapshot of
//! every worker output file into one [`Aggregate`], and renders it as the
//! fixed-width status line:
//!
//! ```text
//!   2114 of   6000 | Stg1  2983s | Stg2 693.5s |  22d 12:27:08 |  41d 08:37:51
//! ```
//!
//! Columns: curves done, curves requested, average stage 1 and stage 2 time
//! per curve, elapsed wall time, estimated time left.
//!
//! ## ETA
//!
//! `left = (requested - done) * (avg1 + avg2) / workers`. The projected end
//! time is recomputed at most once per refresh interval (default 60 s) so that
//! sparse early samples do not make the estimate jump around every tick.

use crate::job::JobCounters;
use crate::logscan::ProgressSnapshot;
use serde::{Deserialize, Serialize};
use std::time::Duration;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeStyle {
    /// `     1945628s`
    Seconds,
    /// `      22.519d`
    Mixed,
    /// ` 22d 12:27:08`
    #[default]
    Dhms,
    None,
}

impl TimeStyle {
    pub fn format(&self, secs: f64) -> String {
        let secs = secs.max(0.0);
        match self {
            TimeStyle::Seconds => format!("{:>13}", format!("{:.0}s", secs)),
            TimeStyle::Mixed => {
                let text = if secs <= 60.0 {
                    format!("{:.0}s", secs)
                } else if secs <= 3600.0 {
                    format!("{:.2}m", secs / 60.0)
                } else if secs <= 86400.0 {
                    format!("{:.3}h", secs / 3600.0)
                } else {
                    format!("{:.3}d", secs / 86400.0)
                };
                format!("{:>13}", text)
            }
            TimeStyle::Dhms => {
                let whole = secs.floor() as u64;
                format!(
                    "{:>3}d {:02}:{:02}:{:02}",
                    whole / 86400,
                    (whole % 86400) / 3600,
                    (whole % 3600) / 60,
                    whole % 60
                )
            }
            TimeStyle::None => String::new(),
        }
    }
}

/// Average seconds per unit, width-stable across magnitudes.
pub fn format_average(count: u64, total_secs: f64) -> String {
    if count == 0 {
        return " n/a s".to_string();
    }
    let avg = total_secs / count as f64;
    if avg < 10.0 {
        format!("{:.3}s", avg)
    } else if avg < 100.0 {
        format!("{:.2}s", avg)
    } else if avg < 1000.0 {
        format!("{:.1}s", avg)
    } else if avg < 10000.0 {
        format!(" {:.0}s", avg)
    } else {
        format!("{:.0}s", avg)
    }
}

/// Pool-wide progress at one instant.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct Aggregate {
    pub stage1_count: u64,
    pub stage1_secs: f64,
    pub stage2_count: u64,
    pub stage2_secs: f64,
    pub units_done: u64,
    /// Requested units; 0 when unbounded.
    pub units_total: u64,
    pub elapsed_secs: f64,
}

impl Aggregate {
    pub fn combine<'a, I>(prior: &JobCounters, snapshots: I, units_total: u64, elapsed: Duration) -> Self
    where
        I: IntoIterator<Item = &'a ProgressSnapshot>,
    {
        // Prior credits without recorded time stay out of the averages.
        let timed = |secs: f64| if secs > 0.0 { prior.curves_done } else { 0 };
        let mut agg = Aggregate {
            stage1_count: timed(prior.stage1_secs),
            stage1_secs: prior.stage1_secs,
            stage2_count: timed(prior.stage2_secs),
            stage2_secs: prior.stage2_secs,
            units_done: prior.curves_done,
            units_total,
            elapsed_secs: elapsed.as_secs_f64(),
        };
        for snap in snapshots {
            agg.stage1_count += snap.stage1_count;
            agg.stage1_secs += snap.stage1_secs();
            agg.stage2_count += snap.stage2_count;
            agg.stage2_secs += snap.stage2_secs();
            agg.units_done += snap.curves_done();
        }
        agg
    }

    pub fn avg_stage1(&self) -> f64 {
        if self.stage1_count == 0 {
            0.0
        } else {
            self.stage1_secs / self.stage1_count as f64
        }
    }

    pub fn avg_stage2(&self) -> f64 {
        if self.stage2_count == 0 {
            0.0
        } else {
            self.stage2_secs / self.stage2_count as f64
        }
    }
}

#[derive(Debug, Clone)]
pub struct EtaEstimator {
    refresh_secs: f64,
    workers: usize,
    projected_end: Option<f64>,
    computed_at: f64,
}

impl EtaEstimator {
    pub fn new(workers: usize, refresh: Duration) -> Self {
        EtaEstimator {
            refresh_secs: refresh.as_secs_f64(),
            workers: workers.max(1),
            projected_end: None,
            computed_at: 0.0,
        }
    }

    /// Seconds left, or `None` while there is nothing to extrapolate from.
    pub fn update(&mut self, agg: &Aggregate) -> Option<f64> {
        let per_unit = agg.avg_stage1() + agg.avg_stage2();
        if agg.units_total == 0 || agg.units_done == 0 || per_unit <= 0.0 {
            return None;
        }
        let stale = agg.elapsed_secs - self.computed_at >= self.refresh_secs;
        if self.projected_end.is_none() || stale {
            let remaining = agg.units_total.saturating_sub(agg.units_done) as f64;
            self.projected_end = Some(remaining * per_unit / self.workers as f64 + agg.elapsed_secs);
            self.computed_at = agg.elapsed_secs;
        }
        self.projected_end
            .map(|end| (end - agg.elapsed_secs).max(0.0))
    }
}

pub fn progress_line(agg: &Aggregate, runtime: TimeStyle, eta_style: TimeStyle, eta: Option<f64>) -> String {
    let eta_text = match (eta_style, eta) {
        (TimeStyle::None, _) => String::new(),
        (_, None) => "     n/a".to_string(),
        (style, Some(left)) => style.format(left),
    };
    format!(
        "{:6} of {:6} | Stg1 {} | Stg2 {} | {} | {}",
        agg.units_done,
        agg.units_total,
        format_average(agg.stage1_count, agg.stage1_secs),
        format_average(agg.stage2_count, agg.stage2_secs),
        runtime.format(agg.elapsed_secs),
        eta_text
    )
}

/// Fires once every `interval` of elapsed time.
#[derive(Debug, Clone)]
pub struct Cadence {
    interval: Duration,
    next: Duration,
}

impl Cadence {
    pub fn new(interval: Duration) -> Self {
        Cadence {
            interval,
            next: interval,
        }
    }

    pub fn due(&mut self, elapsed: Duration) -> bool {
        if self.interval.is_zero() || elapsed < self.next {
            return false;
        }
        while self.next <= elapsed {
            self.next += self.interval;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ── Formatting ─────────────────────────────────────────────────

    #[test]
    fn time_styles_match_column_widths() {
        assert_eq!(TimeStyle::Dhms.format(1_945_628.0), " 22d 12:27:08");
        assert_eq!(TimeStyle::Mixed.format(1_945_628.0), "      22.519d");
        assert_eq!(TimeStyle::Seconds.format(1_945_628.0), "     1945628s");
        assert_eq!(TimeStyle::Mixed.format(45.0), "          45s");
        assert_eq!(TimeStyle::Mixed.format(90.0), "        1.50m");
        assert_eq!(TimeStyle::Mixed.format(7200.0), "       2.000h");
        assert_eq!(TimeStyle::Dhms.format(0.0), "  0d 00:00:00");
        assert_eq!(TimeStyle::None.format(5.0), "");
    }

    #[test]
    fn averages_keep_their_width() {
        assert_eq!(format_average(0, 0.0), " n/a s");
        assert_eq!(format_average(2, 11.0), "5.500s");
        assert_eq!(format_average(1, 11.04), "11.04s");
        assert_eq!(format_average(1, 693.5), "693.5s");
        assert_eq!(format_average(1, 2983.0), " 2983s");
        assert_eq!(format_average(1, 12345.0), "12345s");
    }

    #[test]
    fn status_line_layout() {
        let agg = Aggregate {
            stage1_count: 2114,
            stage1_secs: 2983.0 * 2114.0,
            stage2_count: 2114,
            stage2_secs: 693.5 * 2114.0,
            units_done: 2114,
            units_total: 6000,
            elapsed_secs: 1_945_628.0,
        };
        let line = progress_line(&agg, TimeStyle::Dhms, TimeStyle::Dhms, Some(3_573_471.0));
        assert_eq!(
            line,
            "  2114 of   6000 | Stg1  2983s | Stg2 693.5s |  22d 12:27:08 |  41d 08:37:51"
        );
        let line = progress_line(&agg, TimeStyle::Dhms, TimeStyle::Dhms, None);
        assert!(line.ends_with("|      n/a"));
    }

    // ── Aggregation & ETA ──────────────────────────────────────────

    #[test]
    fn combine_adds_prior_and_live() {
        let prior = JobCounters {
            curves_done: 5,
            stage1_secs: 12.0,
            stage2_secs: 34.0,
        };
        let snaps = [
            ProgressSnapshot {
                stage1_count: 2,
                stage1_ms: 3000,
                stage2_count: 1,
                stage2_ms: 2300,
                ..Default::default()
            },
            ProgressSnapshot {
                stage1_count: 1,
                stage1_ms: 1000,
                factor_credit: 1,
                ..Default::default()
            },
        ];
        let agg = Aggregate::combine(&prior, &snaps, 10, Duration::from_secs(30));
        assert_eq!(agg.stage1_count, 8);
        assert_eq!(agg.stage1_secs, 16.0);
        assert_eq!(agg.stage2_count, 6);
        assert_eq!(agg.units_done, 7);
        assert_eq!(agg.units_total, 10);
    }

    #[test]
    fn untimed_prior_credit_does_not_dilute_averages() {
        let prior = JobCounters {
            curves_done: 90,
            ..Default::default()
        };
        let snaps = [ProgressSnapshot {
            stage1_count: 10,
            stage1_ms: 50_000,
            stage2_count: 10,
            stage2_ms: 100_000,
            ..Default::default()
        }];
        let agg = Aggregate::combine(&prior, &snaps, 100, Duration::from_secs(60));
        assert_eq!(agg.avg_stage1(), 5.0);
        assert_eq!(agg.avg_stage2(), 10.0);
        assert_eq!(agg.units_done, 100);

        let mut eta = EtaEstimator::new(1, Duration::from_secs(60));
        let partial = Aggregate {
            units_total: 110,
            ..agg
        };
        assert_eq!(eta.update(&partial), Some(150.0));
    }

    #[test]
    fn eta_refreshes_at_most_once_per_interval() {
        let mut eta = EtaEstimator::new(2, Duration::from_secs(60));
        let mut agg = Aggregate {
            stage1_count: 2,
            stage1_secs: 3.0,
            stage2_count: 2,
            stage2_secs: 5.0,
            units_done: 2,
            units_total: 10,
            elapsed_secs: 10.0,
        };
        assert_eq!(eta.update(&agg), Some(16.0));

        agg.units_done = 9;
        agg.elapsed_secs = 20.0;
        assert_eq!(eta.update(&agg), Some(6.0), "projection kept inside the interval");

        agg.elapsed_secs = 70.0;
        assert_eq!(eta.update(&agg), Some(2.0));

        agg.elapsed_secs = 500.0;
        agg.units_done = 10;
        assert_eq!(eta.update(&agg), Some(0.0));
    }

    #[test]
    fn eta_unavailable_without_samples_or_bound() {
        let mut eta = EtaEstimator::new(1, Duration::from_secs(60));
        let agg = Aggregate {
            units_total: 10,
            ..Default::default()
        };
        assert_eq!(eta.update(&agg), None);
        let unbounded = Aggregate {
            stage1_count: 1,
            stage1_secs: 1.0,
            units_done: 1,
            ..Default::default()
        };
        assert_eq!(eta.update(&unbounded), None);
    }

    #[test]
    fn cadence_fires_once_per_interval() {
        let mut c = Cadence::new(Duration::from_secs(10));
        assert!(!c.due(Duration::from_secs(5)));
        assert!(c.due(Duration::from_secs(10)));
        assert!(!c.due(Duration::from_secs(15)));
        assert!(c.due(Duration::from_secs(35)));
        assert!(!c.due(Duration::from_secs(39)));
        assert!(c.due(Duration::from_secs(40)));
        assert!(!Cadence::new(Duration::ZERO).due(Duration::from_secs(1000)));
    }
}
