//
// Copyright (c) The Holo Core Contributors
//
// SPDX-License-Identifier: MIT
//

// Number of packets over which the packet-loss percentage is computed
// (§4.E).
pub const PKTS_TO_CONSIDER_FOR_PKT_LOSS: u64 = 100;

// Rolling SLA accumulators for a single session.
//
// All accumulators are 64-bit, and the jitter computation is guarded against
// the division-by-`(detect_mult - 1)` hazard that a detect_mult of 1
// otherwise triggers (§4.E, §9).
#[derive(Clone, Copy, Debug, Default)]
pub struct Sla {
    lat_sum_ms: u64,
    jit_sum_ms: u64,
    last_lat_ms: Option<u64>,
    prior_lost_snapshot: u64,
}

// A latency/jitter report, emitted once every `detect_mult` samples.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct LatencyReport {
    pub latency_ms: u64,
    // None when detect_mult == 1: there's no second independent sample in
    // the window to diff against.
    pub jitter_ms: Option<u64>,
}

impl Sla {
    pub fn new() -> Sla {
        Default::default()
    }

    // Folds one round-trip sample into the rolling sums and, once
    // `rx_total` completes a full window of `detect_mult` samples, returns
    // the report for that window and resets the accumulators.
    pub fn record_sample(
        &mut self,
        elapsed_ms: u64,
        detect_mult: u8,
        rx_total: u64,
    ) -> Option<LatencyReport> {
        self.lat_sum_ms = self.lat_sum_ms.saturating_add(elapsed_ms);
        if let Some(last) = self.last_lat_ms {
            self.jit_sum_ms =
                self.jit_sum_ms.saturating_add(elapsed_ms.abs_diff(last));
        }
        self.last_lat_ms = Some(elapsed_ms);

        let window = u64::from(detect_mult.max(1));
        if rx_total == 0 || rx_total % window != 0 {
            return None;
        }

        let report = LatencyReport {
            latency_ms: self.lat_sum_ms / window,
            jitter_ms: (window > 1).then(|| self.jit_sum_ms / (window - 1)),
        };

        self.lat_sum_ms = 0;
        self.jit_sum_ms = 0;
        self.last_lat_ms = None;

        Some(report)
    }

    // Checks whether a packet-loss report is due (every
    // `PKTS_TO_CONSIDER_FOR_PKT_LOSS` transmitted packets) and, if so,
    // returns the loss percentage observed over the most recent window.
    pub fn maybe_loss_report(&mut self, tx_total: u64, rx_total: u64) -> Option<f64> {
        if tx_total == 0 || tx_total % PKTS_TO_CONSIDER_FOR_PKT_LOSS != 0 {
            return None;
        }

        let lost_cumulative = tx_total.saturating_sub(rx_total);
        let lost_in_window =
            lost_cumulative.saturating_sub(self.prior_lost_snapshot);
        self.prior_lost_snapshot = lost_cumulative;

        Some(lost_in_window as f64 / PKTS_TO_CONSIDER_FOR_PKT_LOSS as f64 * 100.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn latency_and_jitter_rollup() {
        let mut sla = Sla::new();
        assert_eq!(sla.record_sample(10, 3, 1), None);
        assert_eq!(sla.record_sample(20, 3, 2), None);
        let report = sla.record_sample(30, 3, 3).unwrap();
        assert_eq!(report.latency_ms, 20);
        assert_eq!(report.jitter_ms, Some(10));
    }

    #[test]
    fn detect_mult_one_never_reports_jitter() {
        let mut sla = Sla::new();
        let report = sla.record_sample(42, 1, 1).unwrap();
        assert_eq!(report.latency_ms, 42);
        assert_eq!(report.jitter_ms, None);
    }

    #[test]
    fn loss_report_every_window() {
        let mut sla = Sla::new();
        for tx in 1..100u64 {
            assert_eq!(sla.maybe_loss_report(tx, tx), None);
        }
        // 100 packets transmitted, 2 lost (98 received).
        let loss = sla.maybe_loss_report(100, 98).unwrap();
        assert!((loss - 2.0).abs() < f64::EPSILON);
    }

    #[test]
    fn loss_report_uses_window_delta_not_cumulative_total() {
        let mut sla = Sla::new();
        let first = sla.maybe_loss_report(100, 95).unwrap();
        assert!((first - 5.0).abs() < f64::EPSILON);
        // No further loss in the second window: cumulative lost stays at 5.
        let second = sla.maybe_loss_report(200, 105).unwrap();
        assert!((second - 0.0).abs() < f64::EPSILON);
    }
}
