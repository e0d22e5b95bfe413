//! Risk statistics over daily return series.
//!
//! All figures use sample statistics (`n - 1` denominator) and a 365-day
//! year, since crypto trades every calendar day.

use serde::{Deserialize, Serialize};
use statrs::statistics::Statistics;

use crate::config::RiskConfig;
use crate::utils::types::{round2, symbol_for, CoinSeries};

const DAYS_PER_YEAR: f64 = 365.0;
/// Spreads below this are treated as zero when guarding divisions.
const EPSILON: f64 = 1e-12;

/// Risk figures for one coin over one lookback window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskSnapshot {
    pub coin: String,
    pub symbol: String,
    /// Annualized volatility, percent
    pub volatility: f64,
    pub sharpe: f64,
    /// Against the benchmark coin
    pub beta: f64,
    /// Historical one-day VaR, percent
    pub var: f64,
}

impl RiskSnapshot {
    pub fn rounded(&self) -> Self {
        Self {
            coin: self.coin.clone(),
            symbol: self.symbol.clone(),
            volatility: round2(self.volatility),
            sharpe: round2(self.sharpe),
            beta: round2(self.beta),
            var: round2(self.var),
        }
    }
}

/// Turns price series into [`RiskSnapshot`]s.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MetricsEngine {
    risk_free_rate: f64,
    confidence: f64,
}

impl Default for MetricsEngine {
    fn default() -> Self {
        Self::from_config(&RiskConfig::default())
    }
}

impl MetricsEngine {
    pub fn new(risk_free_rate: f64, confidence: f64) -> Self {
        Self { risk_free_rate, confidence }
    }

    pub fn from_config(cfg: &RiskConfig) -> Self {
        Self::new(cfg.risk_free_rate, cfg.confidence)
    }

    /// Compute every statistic for `series`, using `reference` for beta.
    ///
    /// Returns `None` when `series` has fewer than two prices, i.e. no
    /// return can be formed. A short or empty reference only zeroes beta.
    pub fn compute(&self, series: &CoinSeries, reference: &CoinSeries) -> Option<RiskSnapshot> {
        if series.len() < 2 {
            return None;
        }
        let returns = series.returns();
        let (asset, bench) = align_returns(series, reference);
        Some(RiskSnapshot {
            coin: series.coin.clone(),
            symbol: symbol_for(&series.coin),
            volatility: volatility(&returns),
            sharpe: sharpe_ratio(&returns, self.risk_free_rate),
            beta: beta(&asset, &bench),
            var: value_at_risk(&returns, self.confidence),
        })
    }
}

fn sample_std(xs: &[f64]) -> f64 {
    if xs.len() < 2 {
        return 0.0;
    }
    xs.iter().std_dev()
}

/// Standard deviation of daily returns, annualized, in percent.
pub fn volatility(returns: &[f64]) -> f64 {
    sample_std(returns) * DAYS_PER_YEAR.sqrt() * 100.0
}

/// `(mean * 365 - rf) / (std * sqrt(365))`, or 0 for a flat series.
pub fn sharpe_ratio(returns: &[f64], risk_free_rate: f64) -> f64 {
    let std = sample_std(returns);
    if std < EPSILON {
        return 0.0;
    }
    let mean = returns.iter().mean();
    (mean * DAYS_PER_YEAR - risk_free_rate) / (std * DAYS_PER_YEAR.sqrt())
}

/// `cov(asset, bench) / var(bench)` over equally long, aligned slices.
///
/// Both moments use the sample (n - 1) denominator, so the benchmark's own
/// beta is exactly 1. Mixing a sample covariance with a population variance
/// would scale every beta up by n / (n - 1), about 3.5% at 30 days.
pub fn beta(asset: &[f64], bench: &[f64]) -> f64 {
    if asset.len() != bench.len() || bench.len() < 2 {
        return 0.0;
    }
    let var = bench.iter().variance();
    if var < EPSILON {
        return 0.0;
    }
    asset.iter().covariance(bench.iter()) / var
}

/// Historical VaR: magnitude of the `1 - confidence` return quantile, in
/// percent.
pub fn value_at_risk(returns: &[f64], confidence: f64) -> f64 {
    percentile(returns, (1.0 - confidence) * 100.0)
        .map_or(0.0, |q| q.abs() * 100.0)
}

/// `p`-th percentile (0..=100) with linear interpolation between the two
/// nearest ranks.
pub fn percentile(values: &[f64], p: f64) -> Option<f64> {
    if values.is_empty() {
        return None;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(f64::total_cmp);
    let rank = (p.clamp(0.0, 100.0) / 100.0) * (sorted.len() - 1) as f64;
    let lo = rank.floor() as usize;
    let hi = rank.ceil() as usize;
    Some(sorted[lo] + (sorted[hi] - sorted[lo]) * (rank - lo as f64))
}

/// Pair up returns of two series that fall on the same date.
pub fn align_returns(series: &CoinSeries, reference: &CoinSeries) -> (Vec<f64>, Vec<f64>) {
    let bench: std::collections::HashMap<_, _> = reference.dated_returns().into_iter().collect();
    series
        .dated_returns()
        .into_iter()
        .filter_map(|(date, r)| bench.get(&date).map(|b| (r, *b)))
        .unzip()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::types::PricePoint;
    use chrono::{Duration, NaiveDate};
    use rstest::rstest;

    fn series(coin: &str, prices: &[f64]) -> CoinSeries {
        let start = NaiveDate::from_ymd_opt(2024, 3, 1).unwrap();
        let points = prices
            .iter()
            .enumerate()
            .map(|(i, p)| PricePoint::new(coin, start + Duration::days(i as i64), *p))
            .collect();
        CoinSeries::new(coin, points)
    }

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-9
    }

    #[test]
    fn constant_series_is_all_zero() {
        let flat = series("tether", &[1.0; 30]);
        let snap = MetricsEngine::default().compute(&flat, &flat).unwrap();
        assert_eq!(snap.volatility, 0.0);
        assert_eq!(snap.sharpe, 0.0);
        assert_eq!(snap.beta, 0.0);
        assert_eq!(snap.var, 0.0);
    }

    #[test]
    fn four_point_series_matches_formulas() {
        let s = series("ethereum", &[100.0, 110.0, 99.0, 105.0]);
        let r = s.returns();
        assert_eq!(r.len(), 3);
        assert!(close(r[0], 0.10));
        assert!(close(r[1], -0.10));
        assert!(close(r[2], 105.0 / 99.0 - 1.0));

        let mean = r.iter().sum::<f64>() / 3.0;
        let std = (r.iter().map(|x| (x - mean).powi(2)).sum::<f64>() / 2.0).sqrt();
        let engine = MetricsEngine::new(0.04, 0.95);
        let snap = engine.compute(&s, &series("bitcoin", &[1.0, 2.0, 3.0, 4.0])).unwrap();

        assert!(close(snap.volatility, std * 365f64.sqrt() * 100.0));
        assert!(close(snap.sharpe, (mean * 365.0 - 0.04) / (std * 365f64.sqrt())));
        // sorted [-0.1, 0.0606, 0.1], rank 0.1
        let q = -0.1 + (r[2] + 0.1) * 0.1;
        assert!(close(snap.var, q.abs() * 100.0));
        assert_eq!(snap.symbol, "ETH");
    }

    #[test]
    fn benchmark_has_unit_beta_against_itself() {
        let btc = series("bitcoin", &[100.0, 104.0, 98.0, 101.0, 107.0]);
        let snap = MetricsEngine::default().compute(&btc, &btc).unwrap();
        assert!(close(snap.beta, 1.0));
    }

    #[test]
    fn beta_scales_with_leverage() {
        let bench = series("bitcoin", &[100.0, 102.0, 99.0, 103.0, 101.0]);
        let lev: Vec<f64> = {
            let r = bench.returns();
            let mut p = vec![50.0];
            for x in r {
                let last = *p.last().unwrap();
                p.push(last * (1.0 + 2.0 * x));
            }
            p
        };
        let asset = series("dogecoin", &lev);
        let snap = MetricsEngine::default().compute(&asset, &bench).unwrap();
        assert!(close(snap.beta, 2.0));
    }

    #[rstest]
    #[case(&[], None)]
    #[case(&[100.0], None)]
    fn too_short_series_yield_nothing(#[case] prices: &[f64], #[case] expected: Option<RiskSnapshot>) {
        let s = series("cardano", prices);
        let bench = series("bitcoin", &[1.0, 2.0, 3.0]);
        assert_eq!(MetricsEngine::default().compute(&s, &bench), expected);
    }

    #[test]
    fn missing_benchmark_only_zeroes_beta() {
        let s = series("solana", &[10.0, 11.0, 10.5, 12.0]);
        let snap = MetricsEngine::default().compute(&s, &CoinSeries::empty("bitcoin")).unwrap();
        assert_eq!(snap.beta, 0.0);
        assert!(snap.volatility > 0.0);
    }

    #[test]
    fn non_positive_prices_are_excluded() {
        let s = series("tron", &[1.0, 0.0, -3.0, 1.1]);
        assert_eq!(s.len(), 2);
        assert_eq!(s.returns().len(), 1);
    }

    #[rstest]
    #[case(0.0, 1.0)]
    #[case(100.0, 5.0)]
    #[case(50.0, 3.0)]
    #[case(25.0, 2.0)]
    #[case(10.0, 1.4)]
    fn percentile_interpolates(#[case] p: f64, #[case] expected: f64) {
        let v = [5.0, 1.0, 4.0, 2.0, 3.0];
        assert!(close(percentile(&v, p).unwrap(), expected));
    }

    #[test]
    fn alignment_drops_unmatched_dates() {
        let a = series("ethereum", &[1.0, 2.0, 3.0, 4.0]);
        let start = NaiveDate::from_ymd_opt(2024, 3, 2).unwrap();
        let b = CoinSeries::new(
            "bitcoin",
            (0..3).map(|i| PricePoint::new("bitcoin", start + Duration::days(i), 10.0 + i as f64)).collect(),
        );
        let (x, y) = align_returns(&a, &b);
        assert_eq!(x.len(), 2);
        assert_eq!(y.len(), 2);
    }

    #[test]
    fn rounding_applies_to_every_figure() {
        let snap = RiskSnapshot {
            coin: "x".into(),
            symbol: "X".into(),
            volatility: 1.234,
            sharpe: -0.005,
            beta: 0.996,
            var: 2.0,
        };
        let r = snap.rounded();
        assert_eq!((r.volatility, r.beta, r.var), (1.23, 1.0, 2.0));
    }
}
