//! Derived scores: VoIP MOS and the overall connection quality.

use crate::config::Scope;
use crate::incident::ServiceSample;

const PREFERRED_EXTERNAL: &str = "1.1.1.1";

/// Simplified E-model MOS from ping statistics. `None` when any input is missing.
pub fn voip_mos(rtt_ms: Option<f64>, jitter_ms: Option<f64>, loss_pct: Option<f64>) -> Option<f64> {
    let (rtt, jitter, loss) = (rtt_ms?, jitter_ms?, loss_pct?);
    let mos = 4.5 - (rtt + 2.0 * jitter) / 150.0 - 0.03 * loss;
    Some(mos.clamp(1.0, 4.5))
}

/// Inputs to [`quality_score`]; any of them may be unavailable.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct QualityInputs {
    pub rssi_dbm: Option<f64>,
    pub rtt_ms: Option<f64>,
    pub loss_pct: Option<f64>,
    pub jitter_ms: Option<f64>,
    pub throughput_mbps: Option<f64>,
}

impl QualityInputs {
    /// Take rtt, loss and jitter from the preferred external ICMP sample.
    pub fn with_service(mut self, sample: Option<&ServiceSample>) -> Self {
        if let Some(sample) = sample {
            self.rtt_ms = sample.stats.rtt_avg_ms;
            self.loss_pct = sample.stats.loss_pct;
            self.jitter_ms = sample.stats.jitter_ms;
        }
        self
    }
}

/// Weighted average of the available sub-scores, 0 to 100. `None` when nothing is known.
pub fn quality_score(inputs: &QualityInputs) -> Option<f64> {
    let parts = [
        (inputs.rssi_dbm.map(|rssi| (rssi + 90.0) * 2.5), 0.20),
        (inputs.rtt_ms.map(|rtt| 100.0 - rtt / 2.0), 0.25),
        (inputs.loss_pct.map(|loss| 100.0 - 10.0 * loss), 0.25),
        (inputs.jitter_ms.map(|jitter| 100.0 - jitter), 0.15),
        (inputs.throughput_mbps, 0.15),
    ];

    let (weighted, weights) = parts
        .iter()
        .filter_map(|(score, weight)| score.map(|s| (s.clamp(0.0, 100.0) * weight, *weight)))
        .fold((0.0, 0.0), |(sum, total), (value, weight)| (sum + value, total + weight));

    (weights > 0.0).then(|| weighted / weights)
}

/// `1.1.1.1` when it was probed externally, else the first external ICMP sample.
pub fn preferred_external(samples: &[ServiceSample]) -> Option<&ServiceSample> {
    let mut external = samples.iter().filter(|s| s.scope == Scope::External);
    samples
        .iter()
        .find(|s| s.scope == Scope::External && s.target == PREFERRED_EXTERNAL)
        .or_else(|| external.next())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::probe::PingStats;

    fn sample(target: &str, scope: Scope, rtt: f64) -> ServiceSample {
        ServiceSample {
            target: target.to_string(),
            scope,
            stats: PingStats {
                rtt_avg_ms: Some(rtt),
                loss_pct: Some(0.0),
                jitter_ms: Some(1.0),
            },
        }
    }

    #[test]
    fn test_voip_mos() {
        assert_eq!(voip_mos(Some(0.0), Some(0.0), Some(0.0)), Some(4.5));
        // 4.5 - (30 + 20) / 150 - 0.03 = 4.1366..
        let mos = voip_mos(Some(30.0), Some(10.0), Some(1.0)).unwrap();
        assert!((mos - 4.136_666).abs() < 1e-3);
        assert_eq!(voip_mos(Some(900.0), Some(100.0), Some(50.0)), Some(1.0));
        assert_eq!(voip_mos(None, Some(1.0), Some(0.0)), None);
        assert_eq!(voip_mos(Some(10.0), Some(1.0), None), None);
    }

    #[test]
    fn test_quality_score_all_inputs() {
        let inputs = QualityInputs {
            rssi_dbm: Some(-50.0),      // 100
            rtt_ms: Some(20.0),         // 90
            loss_pct: Some(0.0),        // 100
            jitter_ms: Some(10.0),      // 90
            throughput_mbps: Some(50.0), // 50
        };
        let expected = 0.20 * 100.0 + 0.25 * 90.0 + 0.25 * 100.0 + 0.15 * 90.0 + 0.15 * 50.0;
        let score = quality_score(&inputs).unwrap();
        assert!((score - expected).abs() < 1e-9);
    }

    #[test]
    fn test_quality_score_partial_and_empty() {
        let inputs = QualityInputs {
            rssi_dbm: Some(-70.0),
            ..Default::default()
        };
        assert_eq!(quality_score(&inputs), Some(50.0));

        let clamped = QualityInputs {
            loss_pct: Some(40.0),
            ..Default::default()
        };
        assert_eq!(quality_score(&clamped), Some(0.0));

        assert_eq!(quality_score(&QualityInputs::default()), None);
    }

    #[test]
    fn test_preferred_external() {
        let samples = vec![
            sample("10.0.0.1", Scope::Internal, 1.0),
            sample("8.8.8.8", Scope::External, 12.0),
            sample("1.1.1.1", Scope::External, 9.0),
        ];
        assert_eq!(preferred_external(&samples).unwrap().target, "1.1.1.1");
        assert_eq!(preferred_external(&samples[..2]).unwrap().target, "8.8.8.8");
        assert!(preferred_external(&samples[..1]).is_none());

        let inputs = QualityInputs::default().with_service(preferred_external(&samples));
        assert_eq!(inputs.rtt_ms, Some(9.0));
    }
}
