use crate::error::EngineError;
use crate::models::{Candle, Movement};
use chrono::{DateTime, Utc};
use serde::Serialize;

/// Probability reported when the data carries no information.
pub const UNINFORMATIVE_PROBABILITY: f64 = 0.5;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MarkovAnalysis {
    pub pattern: Vec<Movement>,
    pub target: Movement,
    pub occurrences: usize,
    pub hits: usize,
    pub probability: f64,
}

/// Counts every position where `pattern` matches and a following bar exists.
pub fn analyze_markov(movements: &[Movement], pattern: &[Movement], target: Movement) -> MarkovAnalysis {
    let mut occurrences = 0usize;
    let mut hits = 0usize;

    if !pattern.is_empty() && movements.len() > pattern.len() {
        for window in movements.windows(pattern.len() + 1) {
            if &window[..pattern.len()] == pattern {
                occurrences += 1;
                if window[pattern.len()] == target {
                    hits += 1;
                }
            }
        }
    }

    let probability = if occurrences == 0 {
        UNINFORMATIVE_PROBABILITY
    } else {
        hits as f64 / occurrences as f64
    };

    MarkovAnalysis {
        pattern: pattern.to_vec(),
        target,
        occurrences,
        hits,
        probability,
    }
}

pub fn markov_probability(movements: &[Movement], pattern: &[Movement], target: Movement) -> f64 {
    analyze_markov(movements, pattern, target).probability
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReversalEvent {
    pub direction: Movement,
    pub run_started_at: DateTime<Utc>,
    pub reversed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReversalAnalysis {
    pub run_length: usize,
    pub up_runs: usize,
    pub up_reversals: usize,
    pub down_runs: usize,
    pub down_reversals: usize,
    pub up_reversal_probability: f64,
    pub down_reversal_probability: f64,
    pub events: Vec<ReversalEvent>,
}

fn ratio_or_default(hits: usize, total: usize) -> f64 {
    if total == 0 {
        UNINFORMATIVE_PROBABILITY
    } else {
        hits as f64 / total as f64
    }
}

/// Finds every maximal run of exactly `run_length` identical movements and checks whether
/// the next bar reverses it. A run closing the series counts as a run without a reversal.
pub fn analyze_reversals(candles: &[Candle], run_length: usize) -> ReversalAnalysis {
    let mut up_runs = 0;
    let mut up_reversals = 0;
    let mut down_runs = 0;
    let mut down_reversals = 0;
    let mut events = Vec::new();

    if run_length > 0 {
        let mut start = 0;
        while start < candles.len() {
            let direction = candles[start].movement;
            let mut end = start;
            while end + 1 < candles.len() && candles[end + 1].movement == direction {
                end += 1;
            }

            if end - start + 1 == run_length {
                let next = candles.get(end + 1);
                let reversed = next.is_some();
                match direction {
                    Movement::Up => {
                        up_runs += 1;
                        up_reversals += usize::from(reversed);
                    }
                    Movement::Down => {
                        down_runs += 1;
                        down_reversals += usize::from(reversed);
                    }
                }
                if let Some(bar) = next {
                    events.push(ReversalEvent {
                        direction,
                        run_started_at: candles[start].timestamp,
                        reversed_at: bar.timestamp,
                    });
                }
            }

            start = end + 1;
        }
    }

    ReversalAnalysis {
        run_length,
        up_runs,
        up_reversals,
        down_runs,
        down_reversals,
        up_reversal_probability: ratio_or_default(up_reversals, up_runs),
        down_reversal_probability: ratio_or_default(down_reversals, down_runs),
        events,
    }
}

/// Parses patterns such as `UUD`, `up,up,down` or `U D`.
pub fn parse_pattern(raw: &str) -> Result<Vec<Movement>, EngineError> {
    if raw.contains(',') || raw.contains(char::is_whitespace) {
        raw.split(|c: char| c == ',' || c.is_whitespace())
            .filter(|token| !token.is_empty())
            .map(parse_movement)
            .collect()
    } else {
        raw.chars()
            .map(|c| parse_movement(c.encode_utf8(&mut [0u8; 4])))
            .collect()
    }
}

pub fn parse_movement(raw: &str) -> Result<Movement, EngineError> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "u" | "up" => Ok(Movement::Up),
        "d" | "down" => Ok(Movement::Down),
        other => Err(EngineError::invalid(
            "pattern",
            format!("expected U/D or up/down, got '{}'", other),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use Movement::{Down, Up};

    fn candles_for(moves: &[Movement]) -> Vec<Candle> {
        let base = Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap();
        moves
            .iter()
            .enumerate()
            .map(|(i, movement)| {
                let (open, close) = match movement {
                    Up => (100.0, 101.0),
                    Down => (101.0, 100.0),
                };
                Candle::new(base + Duration::hours(i as i64), open, 102.0, 99.0, close, 1.0, 1)
            })
            .collect()
    }

    #[test]
    fn markov_counts_only_occurrences_with_a_following_bar() {
        // [Up, Down] occurs three times; the last one closes the series.
        let series = [Up, Down, Up, Up, Down, Down, Up, Down];
        let analysis = analyze_markov(&series, &[Up, Down], Up);
        assert_eq!(analysis.occurrences, 2);
        assert_eq!(analysis.hits, 1);
        assert_eq!(analysis.probability, 0.5);
        assert_eq!(markov_probability(&series, &[Up, Down], Down), 0.5);
        assert_eq!(markov_probability(&series, &[Down, Down], Up), 1.0);
    }

    #[test]
    fn markov_falls_back_to_uninformative_prior() {
        assert_eq!(markov_probability(&[Up, Up], &[Up, Up], Up), 0.5);
        assert_eq!(markov_probability(&[Up, Up, Up], &[], Up), 0.5);
        assert_eq!(markov_probability(&[Up, Up, Up], &[Down], Up), 0.5);
    }

    #[test]
    fn reversal_worked_example() {
        let candles = candles_for(&[Up, Up, Down, Up, Up, Up, Down, Down, Up, Down, Down]);
        let analysis = analyze_reversals(&candles, 2);
        assert_eq!(analysis.up_runs, 1);
        assert_eq!(analysis.up_reversal_probability, 1.0);
        assert_eq!(analysis.down_runs, 2);
        assert_eq!(analysis.down_reversals, 1);
        assert_eq!(analysis.down_reversal_probability, 0.5);
        assert_eq!(analysis.events.len(), 2);
        assert_eq!(analysis.events[0].reversed_at, candles[2].timestamp);
        assert_eq!(analysis.events[1].direction, Down);
        assert_eq!(analysis.events[1].reversed_at, candles[8].timestamp);
    }

    #[test]
    fn reversal_defaults_when_no_runs_exist() {
        let analysis = analyze_reversals(&candles_for(&[Up, Down, Up]), 3);
        assert_eq!(analysis.up_reversal_probability, 0.5);
        assert_eq!(analysis.down_reversal_probability, 0.5);
        assert!(analysis.events.is_empty());
        assert_eq!(analyze_reversals(&[], 0).up_runs, 0);
    }

    #[test]
    fn patterns_parse_compact_and_spelled_forms() {
        assert_eq!(parse_pattern("UUD").unwrap(), vec![Up, Up, Down]);
        assert_eq!(parse_pattern("up, down").unwrap(), vec![Up, Down]);
        assert!(parse_pattern("UXD").is_err());
    }
}
