//! Typing cadence.
//!
//! Two delays make the NPC feel like someone on the other side of the plant:
//! a "thinking" pause before a reply is requested, proportional to how much the
//! user wrote, and a per-character "typing" pause that lingers on punctuation.

use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

const COMMAS: [char; 2] = [',', '，'];
const SENTENCE_ENDS: [char; 7] = ['.', '?', '!', '。', '？', '！', '…'];

#[derive(Debug, Clone, Copy, PartialEq, serde::Deserialize)]
#[serde(default)]
pub struct DelayParameters {
    pub thinking_base_ms: f64,
    pub thinking_per_char_ms: f64,
    pub thinking_spread_ms: f64,
    pub thinking_cap_ms: f64,

    pub typing_base_ms: f64,
    pub typing_jitter_ms: f64,
    /// Hard lower bound for ordinary characters.
    pub typing_floor_ms: f64,

    pub comma_pause_ms: [f64; 2],
    pub sentence_pause_ms: [f64; 2],

    pub hesitation_chance: f64,
    pub hesitation_ms: f64,
}

impl Default for DelayParameters {
    fn default() -> Self {
        Self {
            thinking_base_ms: 600.0,
            thinking_per_char_ms: 40.0,
            thinking_spread_ms: 800.0,
            thinking_cap_ms: 4000.0,
            typing_base_ms: 80.0,
            typing_jitter_ms: 30.0,
            typing_floor_ms: 50.0,
            comma_pause_ms: [350.0, 500.0],
            sentence_pause_ms: [500.0, 700.0],
            hesitation_chance: 0.04,
            hesitation_ms: 300.0,
        }
    }
}

fn non_negative(v: f64) -> f64 {
    if v.is_finite() {
        v.max(0.0)
    } else {
        0.0
    }
}

fn ordered([lo, hi]: [f64; 2]) -> [f64; 2] {
    let (lo, hi) = (non_negative(lo), non_negative(hi));
    if hi < lo {
        [hi, lo]
    } else {
        [lo, hi]
    }
}

impl DelayParameters {
    /// Clamps a loaded configuration so every delay stays finite, non-negative
    /// and inside its declared bounds.
    pub fn sanitize(mut self) -> Self {
        self.thinking_base_ms = non_negative(self.thinking_base_ms);
        self.thinking_per_char_ms = non_negative(self.thinking_per_char_ms);
        self.thinking_spread_ms = non_negative(self.thinking_spread_ms);
        self.thinking_cap_ms = non_negative(self.thinking_cap_ms).max(self.thinking_base_ms);

        self.typing_base_ms = non_negative(self.typing_base_ms);
        self.typing_jitter_ms = non_negative(self.typing_jitter_ms);
        self.typing_floor_ms = non_negative(self.typing_floor_ms);

        self.comma_pause_ms = ordered(self.comma_pause_ms);
        self.sentence_pause_ms = ordered(self.sentence_pause_ms);

        self.hesitation_chance = if self.hesitation_chance.is_finite() {
            self.hesitation_chance.clamp(0.0, 1.0)
        } else {
            0.0
        };
        self.hesitation_ms = non_negative(self.hesitation_ms);
        self
    }
}

#[derive(Debug)]
pub struct DelayModel<R = StdRng> {
    params: DelayParameters,
    rng: R,
}

impl DelayModel<StdRng> {
    pub fn new(params: DelayParameters) -> Self {
        Self::with_rng(params, StdRng::from_entropy())
    }

    /// Deterministic sequence, for tests.
    #[cfg(test)]
    pub fn with_seed(params: DelayParameters, seed: u64) -> Self {
        Self::with_rng(params, StdRng::seed_from_u64(seed))
    }
}

impl<R: Rng> DelayModel<R> {
    pub fn with_rng(params: DelayParameters, rng: R) -> Self {
        Self {
            params: params.sanitize(),
            rng,
        }
    }

    /// Uniform sample in `[lo, hi)`, or `lo` when the range is empty.
    fn uniform(&mut self, lo: f64, hi: f64) -> f64 {
        if hi > lo {
            self.rng.gen_range(lo..hi)
        } else {
            lo
        }
    }

    /// How long the NPC "reads" a message of `input_len` characters before answering.
    pub fn thinking_delay(&mut self, input_len: usize) -> Duration {
        let p = self.params;
        let spread = self.uniform(0.0, p.thinking_spread_ms);
        let ms = p.thinking_base_ms + p.thinking_per_char_ms * input_len as f64 + spread;
        Duration::from_secs_f64(ms.min(p.thinking_cap_ms) / 1000.0)
    }

    /// Pause after typing `c`.
    pub fn typing_delay(&mut self, c: char) -> Duration {
        let p = self.params;
        let ms = if COMMAS.contains(&c) {
            self.uniform(p.comma_pause_ms[0], p.comma_pause_ms[1])
        } else if SENTENCE_ENDS.contains(&c) {
            self.uniform(p.sentence_pause_ms[0], p.sentence_pause_ms[1])
        } else {
            let jitter = self.uniform(-p.typing_jitter_ms, p.typing_jitter_ms);
            let mut ms = (p.typing_base_ms + jitter).max(p.typing_floor_ms);
            // mid-thought hesitation
            if self.rng.gen_bool(p.hesitation_chance) {
                ms += p.hesitation_ms;
            }
            ms
        };
        Duration::from_secs_f64(ms / 1000.0)
    }
}
