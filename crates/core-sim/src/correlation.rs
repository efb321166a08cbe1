use std::collections::{BTreeMap, VecDeque};

use serde::{Deserialize, Serialize};

use crate::config::CorrelationConfig;
use crate::stats::pearson;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CorrelationMatrix {
    pub timestamp: i64,
    pub symbols: Vec<String>,
    pub values: Vec<Vec<f64>>,
}

impl CorrelationMatrix {
    pub fn index_of(&self, symbol: &str) -> Option<usize> {
        self.symbols.iter().position(|candidate| candidate == symbol)
    }

    pub fn get(&self, left: &str, right: &str) -> Option<f64> {
        let row = self.index_of(left)?;
        let col = self.index_of(right)?;
        Some(self.values[row][col])
    }

    pub fn is_symmetric(&self, tolerance: f64) -> bool {
        let n = self.symbols.len();
        self.values.len() == n
            && self.values.iter().all(|row| row.len() == n)
            && (0..n).all(|i| {
                (self.values[i][i] - 1.0).abs() <= tolerance
                    && (0..n).all(|j| (self.values[i][j] - self.values[j][i]).abs() <= tolerance)
            })
    }
}

/// Rolling per-symbol return windows.
#[derive(Debug, Clone)]
pub struct CorrelationAnalyzer {
    config: CorrelationConfig,
    returns: BTreeMap<String, VecDeque<f64>>,
    latest: Option<CorrelationMatrix>,
}

impl CorrelationAnalyzer {
    pub fn new(config: CorrelationConfig) -> Self {
        Self {
            config,
            returns: BTreeMap::new(),
            latest: None,
        }
    }

    pub fn config(&self) -> &CorrelationConfig {
        &self.config
    }

    /// Non-finite returns are dropped.
    pub fn add_return(&mut self, symbol: &str, return_value: f64) {
        if !return_value.is_finite() {
            return;
        }

        let period = self.config.period.max(1);
        let window = self.returns.entry(symbol.to_string()).or_default();
        if window.len() >= period {
            window.pop_front();
        }
        window.push_back(return_value);
    }

    pub fn sample_count(&self, symbol: &str) -> usize {
        self.returns.get(symbol).map_or(0, VecDeque::len)
    }

    pub fn calculate_matrix(&mut self, timestamp: i64) -> &CorrelationMatrix {
        let eligible: Vec<(&String, Vec<f64>)> = self
            .returns
            .iter()
            .filter(|(_, window)| window.len() >= self.config.min_samples)
            .map(|(symbol, window)| (symbol, window.iter().copied().collect()))
            .collect();

        let n = eligible.len();
        let mut values = vec![vec![0.0; n]; n];
        for i in 0..n {
            values[i][i] = 1.0;
            for j in (i + 1)..n {
                let left = &eligible[i].1;
                let right = &eligible[j].1;
                let overlap = left.len().min(right.len());
                let rho = pearson(
                    &left[left.len() - overlap..],
                    &right[right.len() - overlap..],
                )
                .unwrap_or(0.0);
                values[i][j] = rho;
                values[j][i] = rho;
            }
        }

        let matrix = CorrelationMatrix {
            timestamp,
            symbols: eligible.into_iter().map(|(symbol, _)| symbol.clone()).collect(),
            values,
        };
        self.latest.insert(matrix)
    }

    pub fn latest_matrix(&self) -> Option<&CorrelationMatrix> {
        self.latest.as_ref()
    }
}

#[cfg(test)]
mod tests {
    use super::CorrelationAnalyzer;
    use crate::config::CorrelationConfig;
    use crate::rng::{RngAlgorithm, SeededRng};

    fn analyzer(period: usize, min_samples: usize) -> CorrelationAnalyzer {
        CorrelationAnalyzer::new(CorrelationConfig {
            period,
            min_samples,
        })
    }

    #[test]
    fn matrix_is_square_symmetric_with_unit_diagonal() {
        let mut analyzer = analyzer(30, 5);
        let mut rng = SeededRng::new(21, RngAlgorithm::Xorshift128);
        for _ in 0..40 {
            let common = rng.random_normal(0.0, 0.01);
            analyzer.add_return("AAA", common + rng.random_normal(0.0, 0.002));
            analyzer.add_return("BBB", common + rng.random_normal(0.0, 0.002));
            analyzer.add_return("CCC", rng.random_normal(0.0, 0.01));
        }

        let matrix = analyzer.calculate_matrix(99).clone();

        assert_eq!(matrix.symbols, vec!["AAA", "BBB", "CCC"]);
        assert!(matrix.is_symmetric(1e-12));
        for i in 0..3 {
            assert_eq!(matrix.values[i][i], 1.0);
        }
        assert!(matrix.get("AAA", "BBB").unwrap() > 0.8);
        assert_eq!(analyzer.latest_matrix(), Some(&matrix));
    }

    #[test]
    fn symbols_without_enough_samples_are_excluded() {
        let mut analyzer = analyzer(10, 4);
        for value in [0.01, -0.02, 0.03, 0.01] {
            analyzer.add_return("AAA", value);
        }
        analyzer.add_return("BBB", 0.01);

        let matrix = analyzer.calculate_matrix(1);

        assert_eq!(matrix.symbols, vec!["AAA"]);
        assert_eq!(matrix.get("AAA", "BBB"), None);
    }

    #[test]
    fn rolling_window_discards_oldest_returns() {
        let mut analyzer = analyzer(3, 2);
        for value in [1.0, 2.0, 3.0, 4.0, f64::NAN] {
            analyzer.add_return("AAA", value);
        }

        assert_eq!(analyzer.sample_count("AAA"), 3);
    }

    #[test]
    fn flat_series_correlates_to_zero_off_diagonal() {
        let mut analyzer = analyzer(5, 3);
        for value in [0.01, 0.02, 0.03] {
            analyzer.add_return("AAA", value);
            analyzer.add_return("FLAT", 0.0);
        }

        let matrix = analyzer.calculate_matrix(0);

        assert_eq!(matrix.get("AAA", "FLAT"), Some(0.0));
        assert_eq!(matrix.get("FLAT", "FLAT"), Some(1.0));
    }
}
