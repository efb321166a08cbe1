use serde::{Deserialize, Serialize};
use thiserror::Error;

const MULBERRY_INCREMENT: u32 = 0x6D2B_79F5;
const UNIT_SCALE: f64 = 4_294_967_296.0;
const POISSON_KNUTH_LIMIT: f64 = 30.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RngAlgorithm {
    #[default]
    Mulberry32,
    Xorshift128,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RngError {
    #[error("min {min} is greater than max {max}")]
    InvalidRange { min: i64, max: i64 },
    #[error("cannot choose from an empty slice")]
    EmptyChoice,
    #[error("sample size {requested} exceeds population {available}")]
    SampleTooLarge { requested: usize, available: usize },
    #[error("block size {block_size} exceeds series length {total_length}")]
    BlockTooLarge {
        block_size: usize,
        total_length: usize,
    },
    #[error("block size must be positive")]
    EmptyBlock,
    #[error("distribution parameter must be finite and positive")]
    InvalidParameter,
    #[error("rng state does not match its algorithm")]
    InvalidState,
}

/// Exported generator state. Restoring it resumes the exact sequence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RngState {
    pub seed: i64,
    pub algorithm: RngAlgorithm,
    pub words: Vec<u32>,
    pub draws: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Core {
    Mulberry32 { state: u32 },
    Xorshift128 { x: u32, y: u32, z: u32, w: u32 },
}

impl Core {
    fn seeded(seed: i64, algorithm: RngAlgorithm) -> Self {
        let mut mix = seed as u64;
        match algorithm {
            RngAlgorithm::Mulberry32 => Self::Mulberry32 {
                state: (splitmix64(&mut mix) >> 32) as u32,
            },
            RngAlgorithm::Xorshift128 => {
                let first = splitmix64(&mut mix);
                let second = splitmix64(&mut mix);
                let mut words = [
                    (first >> 32) as u32,
                    first as u32,
                    (second >> 32) as u32,
                    second as u32,
                ];
                if words.iter().all(|word| *word == 0) {
                    words[3] = 1;
                }
                Self::Xorshift128 {
                    x: words[0],
                    y: words[1],
                    z: words[2],
                    w: words[3],
                }
            }
        }
    }

    fn next_u32(&mut self) -> u32 {
        match self {
            Self::Mulberry32 { state } => {
                *state = state.wrapping_add(MULBERRY_INCREMENT);
                let mut t = *state;
                t = (t ^ (t >> 15)).wrapping_mul(t | 1);
                t ^= t.wrapping_add((t ^ (t >> 7)).wrapping_mul(t | 61));
                t ^ (t >> 14)
            }
            Self::Xorshift128 { x, y, z, w } => {
                let t = *x ^ (*x << 11);
                *x = *y;
                *y = *z;
                *z = *w;
                *w = *w ^ (*w >> 19) ^ (t ^ (t >> 8));
                *w
            }
        }
    }

    fn words(&self) -> Vec<u32> {
        match self {
            Self::Mulberry32 { state } => vec![*state],
            Self::Xorshift128 { x, y, z, w } => vec![*x, *y, *z, *w],
        }
    }
}

/// Deterministic pseudo-random source. Everything derived from [`SeededRng::random`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeededRng {
    seed: i64,
    algorithm: RngAlgorithm,
    core: Core,
    draws: u64,
}

impl SeededRng {
    pub fn new(seed: i64, algorithm: RngAlgorithm) -> Self {
        Self {
            seed,
            algorithm,
            core: Core::seeded(seed, algorithm),
            draws: 0,
        }
    }

    pub fn from_state(state: &RngState) -> Result<Self, RngError> {
        let core = match (state.algorithm, state.words.as_slice()) {
            (RngAlgorithm::Mulberry32, [word]) => Core::Mulberry32 { state: *word },
            (RngAlgorithm::Xorshift128, [x, y, z, w]) => {
                if [x, y, z, w].iter().all(|word| **word == 0) {
                    return Err(RngError::InvalidState);
                }
                Core::Xorshift128 {
                    x: *x,
                    y: *y,
                    z: *z,
                    w: *w,
                }
            }
            _ => return Err(RngError::InvalidState),
        };

        Ok(Self {
            seed: state.seed,
            algorithm: state.algorithm,
            core,
            draws: state.draws,
        })
    }

    pub fn seed(&self) -> i64 {
        self.seed
    }

    pub fn algorithm(&self) -> RngAlgorithm {
        self.algorithm
    }

    pub fn draws(&self) -> u64 {
        self.draws
    }

    pub fn state(&self) -> RngState {
        RngState {
            seed: self.seed,
            algorithm: self.algorithm,
            words: self.core.words(),
            draws: self.draws,
        }
    }

    /// Uniform draw in `[0, 1)`.
    pub fn random(&mut self) -> f64 {
        self.draws += 1;
        f64::from(self.core.next_u32()) / UNIT_SCALE
    }

    pub fn random_int(&mut self, min: i64, max: i64) -> Result<i64, RngError> {
        if min > max {
            return Err(RngError::InvalidRange { min, max });
        }
        let span = (max as i128 - min as i128 + 1) as f64;
        let offset = (self.random() * span).floor() as i128;
        Ok((min as i128 + offset).min(max as i128) as i64)
    }

    pub fn random_float(&mut self, min: f64, max: f64) -> f64 {
        min + self.random() * (max - min)
    }

    pub fn random_bool(&mut self, probability: f64) -> bool {
        self.random() < probability
    }

    pub fn random_choice<'a, T>(&mut self, items: &'a [T]) -> Result<&'a T, RngError> {
        if items.is_empty() {
            return Err(RngError::EmptyChoice);
        }
        let index = self.random_index(items.len());
        Ok(&items[index])
    }

    /// Draws `n` distinct elements, preserving draw order.
    pub fn random_sample<T: Clone>(&mut self, items: &[T], n: usize) -> Result<Vec<T>, RngError> {
        if n > items.len() {
            return Err(RngError::SampleTooLarge {
                requested: n,
                available: items.len(),
            });
        }

        let mut pool: Vec<T> = items.to_vec();
        for i in 0..n {
            let j = i + self.random_index(pool.len() - i);
            pool.swap(i, j);
        }
        pool.truncate(n);
        Ok(pool)
    }

    /// Fisher–Yates, back to front.
    pub fn shuffle<T>(&mut self, items: &mut [T]) {
        for i in (1..items.len()).rev() {
            let j = self.random_index(i + 1);
            items.swap(i, j);
        }
    }

    /// Box–Muller transform; consumes two uniforms per call.
    pub fn random_normal(&mut self, mean: f64, std_dev: f64) -> f64 {
        let u1 = 1.0 - self.random();
        let u2 = self.random();
        let radius = (-2.0 * u1.ln()).sqrt();
        mean + std_dev * radius * (2.0 * std::f64::consts::PI * u2).cos()
    }

    pub fn random_exponential(&mut self, lambda: f64) -> Result<f64, RngError> {
        if !lambda.is_finite() || lambda <= 0.0 {
            return Err(RngError::InvalidParameter);
        }
        Ok(-(1.0 - self.random()).ln() / lambda)
    }

    pub fn random_poisson(&mut self, lambda: f64) -> Result<u64, RngError> {
        if !lambda.is_finite() || lambda < 0.0 {
            return Err(RngError::InvalidParameter);
        }
        if lambda == 0.0 {
            return Ok(0);
        }

        if lambda < POISSON_KNUTH_LIMIT {
            let limit = (-lambda).exp();
            let mut count = 0_u64;
            let mut product = self.random();
            while product > limit {
                count += 1;
                product *= self.random();
            }
            return Ok(count);
        }

        let approx = self.random_normal(lambda, lambda.sqrt()).round();
        Ok(approx.max(0.0) as u64)
    }

    /// Start indices are uniform over `[0, total_length - block_size]`; the
    /// result is the concatenation of every window.
    pub fn block_bootstrap_indices(
        &mut self,
        total_length: usize,
        block_size: usize,
        num_blocks: usize,
    ) -> Result<Vec<usize>, RngError> {
        if block_size == 0 {
            return Err(RngError::EmptyBlock);
        }
        if block_size > total_length {
            return Err(RngError::BlockTooLarge {
                block_size,
                total_length,
            });
        }

        let max_start = total_length - block_size;
        let mut indices = Vec::with_capacity(block_size * num_blocks);
        for _ in 0..num_blocks {
            let start = self.random_index(max_start + 1);
            indices.extend(start..start + block_size);
        }
        Ok(indices)
    }

    fn random_index(&mut self, len: usize) -> usize {
        let index = (self.random() * len as f64) as usize;
        index.min(len.saturating_sub(1))
    }
}

fn splitmix64(state: &mut u64) -> u64 {
    *state = state.wrapping_add(0x9E37_79B9_7F4A_7C15);
    let mut z = *state;
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}
