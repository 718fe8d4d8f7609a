// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Synthetic value sources feeding the reference generators. Each source
//! holds its value for a random repeat count before picking the next one,
//! which exercises the changed-value detection of the delta emission.

use std::io::Write;

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};
use serde::Deserialize;

fn rng_from_seed(seed: u64) -> SmallRng {
    if seed > 0 {
        SmallRng::seed_from_u64(seed)
    } else {
        SmallRng::from_entropy()
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct RandomGaugeSourceConfig {
    /// Value range; max < min means the full non-negative range.
    pub min: i32,
    pub max: i32,
    /// Each value is repeated 1..max_repeat times.
    pub max_repeat: i32,
    /// 0 seeds from entropy.
    pub seed: u64,
}

impl Default for RandomGaugeSourceConfig {
    fn default() -> Self {
        RandomGaugeSourceConfig {
            min: 0,
            max: -1,
            max_repeat: 1,
            seed: 0,
        }
    }
}

/// A random number min..=max, each value repeated 1..N times.
pub struct RandomGaugeSource {
    pub val: i32,
    val_bytes: Vec<u8>,
    count_left: i32,
    rng: SmallRng,
    min: i32,
    max: i32,
    max_repeat: i32,
    constant: bool,
}

impl RandomGaugeSource {
    pub fn new(cfg: &RandomGaugeSourceConfig) -> Self {
        let constant = cfg.max == cfg.min;
        let mut source = RandomGaugeSource {
            val: cfg.min,
            val_bytes: Vec::new(),
            count_left: 0,
            rng: rng_from_seed(cfg.seed),
            min: cfg.min,
            max: cfg.max,
            max_repeat: cfg.max_repeat,
            constant,
        };
        if constant {
            let _ = write!(source.val_bytes, "{}", source.val);
        }
        source
    }

    /// The current value in exposition form; valid after the first
    /// [`RandomGaugeSource::refresh`] (or always, for a constant source).
    pub fn val_bytes(&self) -> &[u8] {
        &self.val_bytes
    }

    /// Pick the next value and refresh the exposition form.
    pub fn refresh(&mut self) {
        self.update(true);
    }

    /// Pick the next value without rebuilding the exposition form; used
    /// when only the raw value matters (e.g. as a choice selector).
    pub fn advance(&mut self) {
        self.update(false);
    }

    fn update(&mut self, full: bool) {
        if self.constant {
            return;
        }
        if self.count_left > 0 {
            self.count_left -= 1;
            return;
        }
        self.val = if self.max > self.min {
            self.rng.gen_range(self.min..=self.max)
        } else {
            self.rng.gen_range(0..i32::MAX)
        };
        if full {
            self.val_bytes.clear();
            let _ = write!(self.val_bytes, "{}", self.val);
        }
        if self.max_repeat > 1 {
            self.count_left = self.rng.gen_range(0..self.max_repeat);
        }
    }
}

#[derive(Clone, Debug, Deserialize)]
#[serde(default)]
pub struct RandomCounterSourceConfig {
    pub init: u32,
    /// Increment range applied when the value changes.
    pub min_inc: u32,
    pub max_inc: u32,
    pub max_repeat: i32,
    pub seed: u64,
}

impl Default for RandomCounterSourceConfig {
    fn default() -> Self {
        RandomCounterSourceConfig {
            init: 0,
            min_inc: 1,
            max_inc: 1,
            max_repeat: 1,
            seed: 0,
        }
    }
}

/// A counter incremented by a random amount, each value repeated 1..N times.
pub struct RandomCounterSource {
    pub val: u32,
    count_left: i32,
    rng: SmallRng,
    min_inc: u32,
    max_inc: u32,
    max_repeat: i32,
}

impl RandomCounterSource {
    pub fn new(cfg: &RandomCounterSourceConfig) -> Self {
        RandomCounterSource {
            val: cfg.init,
            count_left: 1,
            rng: rng_from_seed(cfg.seed),
            min_inc: cfg.min_inc,
            max_inc: cfg.max_inc,
            max_repeat: cfg.max_repeat,
        }
    }

    pub fn advance(&mut self) {
        if self.count_left > 0 {
            self.count_left -= 1;
            return;
        }
        let inc = if self.max_inc > self.min_inc {
            self.min_inc + self.rng.gen_range(0..=(self.max_inc - self.min_inc))
        } else {
            self.min_inc
        };
        self.val = self.val.wrapping_add(inc);
        if self.max_repeat > 1 {
            self.count_left = self.rng.gen_range(0..self.max_repeat);
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(default)]
pub struct RandomCategoricalSourceConfig {
    pub choices: Vec<String>,
    pub max_repeat: i32,
    pub seed: u64,
}

/// A random selection from a list of choices, each repeated 1..N times.
pub struct RandomCategoricalSource {
    choices: Vec<Vec<u8>>,
    selector: Option<RandomGaugeSource>,
}

impl RandomCategoricalSource {
    pub fn new(cfg: &RandomCategoricalSourceConfig) -> Self {
        let selector = if cfg.choices.is_empty() {
            None
        } else {
            Some(RandomGaugeSource::new(&RandomGaugeSourceConfig {
                min: 0,
                max: cfg.choices.len() as i32 - 1,
                max_repeat: cfg.max_repeat,
                seed: cfg.seed,
            }))
        };
        RandomCategoricalSource {
            choices: cfg.choices.iter().map(|c| c.as_bytes().to_vec()).collect(),
            selector,
        }
    }

    pub fn advance(&mut self) {
        if let Some(selector) = &mut self.selector {
            selector.advance();
        }
    }

    pub fn val(&self) -> &[u8] {
        match &self.selector {
            Some(selector) => &self.choices[selector.val as usize],
            None => b"",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gauge_stays_in_range() {
        let mut source = RandomGaugeSource::new(&RandomGaugeSourceConfig {
            min: 10,
            max: 20,
            max_repeat: 3,
            seed: 17,
        });
        for _ in 0..200 {
            source.refresh();
            assert!((10..=20).contains(&source.val));
            assert_eq!(source.val_bytes(), source.val.to_string().as_bytes());
        }
    }

    #[test]
    fn test_gauge_constant_range() {
        let mut source = RandomGaugeSource::new(&RandomGaugeSourceConfig {
            min: 7,
            max: 7,
            max_repeat: 1,
            seed: 0,
        });
        for _ in 0..5 {
            source.refresh();
            assert_eq!(source.val, 7);
            assert_eq!(source.val_bytes(), b"7");
        }
    }

    #[test]
    fn test_gauge_seed_is_reproducible() {
        let cfg = RandomGaugeSourceConfig {
            min: 0,
            max: 1_000_000,
            max_repeat: 1,
            seed: 42,
        };
        let mut a = RandomGaugeSource::new(&cfg);
        let mut b = RandomGaugeSource::new(&cfg);
        for _ in 0..50 {
            a.refresh();
            b.refresh();
            assert_eq!(a.val, b.val);
        }
    }

    #[test]
    fn test_counter_is_monotonic() {
        let mut source = RandomCounterSource::new(&RandomCounterSourceConfig {
            init: 100,
            min_inc: 1,
            max_inc: 10,
            max_repeat: 2,
            seed: 5,
        });
        let mut prev = source.val;
        for _ in 0..100 {
            source.advance();
            assert!(source.val >= prev);
            assert!(source.val - prev <= 10);
            prev = source.val;
        }
    }

    #[test]
    fn test_counter_constant_increment_repeats_first_value() {
        let mut source = RandomCounterSource::new(&RandomCounterSourceConfig::default());
        assert_eq!(source.val, 0);
        source.advance(); // consumes the initial repeat
        assert_eq!(source.val, 0);
        source.advance();
        assert_eq!(source.val, 1);
        source.advance();
        assert_eq!(source.val, 2);
    }

    #[test]
    fn test_categorical_picks_from_choices() {
        let mut source = RandomCategoricalSource::new(&RandomCategoricalSourceConfig {
            choices: vec!["red".to_string(), "green".to_string(), "blue".to_string()],
            max_repeat: 2,
            seed: 11,
        });
        for _ in 0..100 {
            source.advance();
            let val = source.val();
            assert!([&b"red"[..], b"green", b"blue"].contains(&val));
        }
    }

    #[test]
    fn test_categorical_empty_choices() {
        let mut source = RandomCategoricalSource::new(&RandomCategoricalSourceConfig::default());
        source.advance();
        assert_eq!(source.val(), b"");
    }
}
