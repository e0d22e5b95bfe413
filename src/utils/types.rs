//! Common types used throughout the market-data service.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

/// Quote currency for every price the service handles.
pub const VS_CURRENCY: &str = "usd";

/// One daily USD price for a coin. Unique per `(coin, date)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PricePoint {
    pub coin: String,
    pub date: NaiveDate,
    pub price: f64,
}

impl PricePoint {
    pub fn new(coin: &str, date: NaiveDate, price: f64) -> Self {
        Self { coin: coin.to_string(), date, price }
    }
}

/// Ordered daily prices for one coin, ascending by date.
///
/// Points with a non-positive or non-finite price are dropped on
/// construction, so `returns().len() == len() - 1` whenever the series
/// is non-empty.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CoinSeries {
    pub coin: String,
    points: Vec<PricePoint>,
}

impl CoinSeries {
    pub fn new(coin: &str, mut points: Vec<PricePoint>) -> Self {
        points.retain(|p| p.price.is_finite() && p.price > 0.0);
        points.sort_by_key(|p| p.date);
        points.dedup_by_key(|p| p.date);
        Self { coin: coin.to_string(), points }
    }

    pub fn empty(coin: &str) -> Self {
        Self { coin: coin.to_string(), points: Vec::new() }
    }

    pub fn points(&self) -> &[PricePoint] {
        &self.points
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    pub fn prices(&self) -> Vec<f64> {
        self.points.iter().map(|p| p.price).collect()
    }

    /// Simple daily returns: `price[i] / price[i-1] - 1`.
    pub fn returns(&self) -> Vec<f64> {
        self.points.windows(2).map(|w| w[1].price / w[0].price - 1.0).collect()
    }

    /// Returns keyed by the date of the later point of each pair.
    pub fn dated_returns(&self) -> Vec<(NaiveDate, f64)> {
        self.points
            .windows(2)
            .map(|w| (w[1].date, w[1].price / w[0].price - 1.0))
            .collect()
    }
}

/// One row of the market snapshot served at `/api/crypto`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketRecord {
    pub id: String,
    pub name: String,
    pub symbol: String,
    pub current_price: f64,
    pub price_change_percentage_24h: f64,
    pub total_volume: f64,
}

/// Ticker symbol for a coin id. Well-known coins map to their listing
/// ticker; anything else falls back to the first three characters.
pub fn symbol_for(coin: &str) -> String {
    let known = match coin {
        | "bitcoin" => Some("BTC"),
        | "ethereum" => Some("ETH"),
        | "solana" => Some("SOL"),
        | "cardano" => Some("ADA"),
        | "dogecoin" => Some("DOGE"),
        | "ripple" => Some("XRP"),
        | "litecoin" => Some("LTC"),
        | "polkadot" => Some("DOT"),
        | "tron" => Some("TRX"),
        | "chainlink" => Some("LINK"),
        | _ => None,
    };
    match known {
        | Some(sym) => sym.to_string(),
        | None => coin.chars().take(3).collect::<String>().to_uppercase(),
    }
}

/// Round to two decimals, the precision the dashboards render.
pub fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

#[cfg(test)]
mod tests {
    use super::*;

    fn d(day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 1, day).unwrap()
    }

    #[test]
    fn series_sorts_and_drops_bad_prices() {
        let s = CoinSeries::new(
            "bitcoin",
            vec![
                PricePoint::new("bitcoin", d(3), 99.0),
                PricePoint::new("bitcoin", d(1), 100.0),
                PricePoint::new("bitcoin", d(2), 0.0),
                PricePoint::new("bitcoin", d(4), f64::NAN),
                PricePoint::new("bitcoin", d(5), 110.0),
            ],
        );
        let dates: Vec<_> = s.points().iter().map(|p| p.date).collect();
        assert_eq!(dates, vec![d(1), d(3), d(5)]);
        assert_eq!(s.returns().len(), s.len() - 1);
    }

    #[test]
    fn returns_match_hand_computation() {
        let points = [100.0, 110.0, 99.0, 105.0]
            .iter()
            .enumerate()
            .map(|(i, p)| PricePoint::new("x", d(i as u32 + 1), *p))
            .collect();
        let r = CoinSeries::new("x", points).returns();
        assert_eq!(r.len(), 3);
        assert!((r[0] - 0.10).abs() < 1e-12);
        assert!((r[1] + 0.10).abs() < 1e-12);
        assert!((r[2] - 6.0 / 99.0).abs() < 1e-12);
    }

    #[test]
    fn empty_and_single_point_have_no_returns() {
        assert!(CoinSeries::empty("x").returns().is_empty());
        let one = CoinSeries::new("x", vec![PricePoint::new("x", d(1), 5.0)]);
        assert!(one.returns().is_empty());
    }

    #[test]
    fn symbols_are_deterministic() {
        assert_eq!(symbol_for("bitcoin"), "BTC");
        assert_eq!(symbol_for("dogecoin"), "DOGE");
        assert_eq!(symbol_for("avalanche-2"), "AVA");
        assert_eq!(symbol_for("ab"), "AB");
    }

    #[test]
    fn rounding() {
        assert_eq!(round2(1.234_9), 1.23);
        assert_eq!(round2(-2.345_1), -2.35);
    }
}
