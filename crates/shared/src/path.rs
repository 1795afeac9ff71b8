//! Deterministic index sequences for the draw animation.
//!
//! Everything here is a pure function of its inputs so that every viewer,
//! whatever its frame rate or join time, lands on the same index at the same
//! elapsed time.

use crate::{
    domain::{PlayerId, SessionId},
    protocol::Tempo,
};

pub const FNV_OFFSET_BASIS: u32 = 0x811c_9dc5;
pub const FNV_PRIME: u32 = 0x0100_0193;

pub const DEFAULT_BASE_HZ: f64 = 12.0;
pub const MIN_BASE_HZ: f64 = 4.0;
pub const MAX_BASE_HZ: f64 = 24.0;
pub const DEFAULT_SLOWDOWN_MS: u64 = 1_800;
pub const MIN_SLOWDOWN_MS: u64 = 900;
pub const MAX_SLOWDOWN_MS: u64 = 12_000;
pub const DEFAULT_REVEAL_MS: u64 = 1_200;
pub const MIN_REVEAL_MS: u64 = 400;
pub const MAX_REVEAL_MS: u64 = 2_500;
/// Longest spin that is animated. Longer steps hold the final scan frame.
pub const MAX_SCAN_MS: u64 = 120_000;

const SPIN_UP_TICKS: u32 = 4;
const SPIN_UP_EXTRA: f64 = 0.75;
/// Interval multiplier reached at the very end of the slowdown window.
const SLOWDOWN_MAX_FACTOR: f64 = 3.0;
/// Weight of the final hold relative to one base reveal step.
const REVEAL_HOLD_WEIGHT: f64 = 3.0;

/// Order-sensitive 32-bit FNV-1a fold. Numbers are folded as their decimal
/// text and fields are separated by `|`, so any client can reproduce it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fnv1a(u32);

impl Default for Fnv1a {
    fn default() -> Self {
        Self(FNV_OFFSET_BASIS)
    }
}

impl Fnv1a {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn bytes(mut self, bytes: &[u8]) -> Self {
        for byte in bytes {
            self.0 ^= u32::from(*byte);
            self.0 = self.0.wrapping_mul(FNV_PRIME);
        }
        self
    }

    pub fn str(self, value: &str) -> Self {
        self.bytes(value.as_bytes()).bytes(b"|")
    }

    pub fn int(self, value: i64) -> Self {
        self.str(&value.to_string())
    }

    pub fn finish(self) -> u32 {
        self.0
    }
}

/// Seed for one step's animation: step identity, timing and candidate order.
pub fn derive_step_seed(
    session_id: SessionId,
    step: u32,
    started_at_ms: i64,
    duration_ms: u64,
    payload_seed: Option<u32>,
    candidates: &[PlayerId],
) -> u32 {
    let mut hash = Fnv1a::new()
        .str("draw-step")
        .int(session_id.0)
        .int(i64::from(step))
        .int(started_at_ms)
        .int(i64::try_from(duration_ms).unwrap_or(i64::MAX));
    if let Some(seed) = payload_seed {
        hash = hash.str("seed").int(i64::from(seed));
    }
    for candidate in candidates {
        hash = hash.int(candidate.0);
    }
    hash.finish()
}

/// Tempo with defaults applied and every knob clamped to its legal range.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResolvedTempo {
    pub base_hz: f64,
    pub slowdown_ms: u64,
    pub near_miss: bool,
}

impl Default for ResolvedTempo {
    fn default() -> Self {
        Self {
            base_hz: DEFAULT_BASE_HZ,
            slowdown_ms: DEFAULT_SLOWDOWN_MS,
            near_miss: false,
        }
    }
}

impl ResolvedTempo {
    pub fn resolve(tempo: Option<&Tempo>) -> Self {
        let Some(tempo) = tempo else {
            return Self::default();
        };
        let base_hz = tempo
            .base_hz
            .filter(|hz| hz.is_finite())
            .unwrap_or(DEFAULT_BASE_HZ)
            .clamp(MIN_BASE_HZ, MAX_BASE_HZ);
        let slowdown_ms = tempo
            .slowdown_ms
            .unwrap_or(DEFAULT_SLOWDOWN_MS)
            .clamp(MIN_SLOWDOWN_MS, MAX_SLOWDOWN_MS);
        Self {
            base_hz,
            slowdown_ms,
            near_miss: tempo.near_miss.unwrap_or(false),
        }
    }

    pub fn base_tick_ms(&self) -> f64 {
        1000.0 / self.base_hz
    }
}

fn ease_out_cubic(t: f64) -> f64 {
    let inv = 1.0 - t.clamp(0.0, 1.0);
    1.0 - inv * inv * inv
}

fn lookup(path: &[usize], timeline_ms: &[u64], elapsed_ms: i64) -> Option<usize> {
    let first = *path.first()?;
    let Ok(elapsed) = u64::try_from(elapsed_ms) else {
        return Some(first);
    };
    let pos = timeline_ms.partition_point(|t| *t <= elapsed);
    Some(path[pos.saturating_sub(1)])
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanPath {
    pub start_index: usize,
    pub candidate_count: usize,
    pub duration_ms: u64,
    /// Candidate index shown from the matching `timeline_ms` entry onwards.
    pub path: Vec<usize>,
    pub timeline_ms: Vec<u64>,
}

impl ScanPath {
    pub fn index_at_elapsed(&self, elapsed_ms: i64) -> Option<usize> {
        lookup(&self.path, &self.timeline_ms, elapsed_ms)
    }

    pub fn last_index(&self) -> Option<usize> {
        self.path.last().copied()
    }

    pub fn is_empty(&self) -> bool {
        self.path.is_empty()
    }
}

pub fn index_at_elapsed(path: &ScanPath, elapsed_ms: i64) -> Option<usize> {
    path.index_at_elapsed(elapsed_ms)
}

fn scan_interval(
    elapsed: f64,
    tick: u32,
    base: f64,
    slowdown_from: f64,
    slowdown: f64,
) -> f64 {
    let mut interval = base;
    if tick < SPIN_UP_TICKS {
        let remaining = f64::from(SPIN_UP_TICKS - tick) / f64::from(SPIN_UP_TICKS);
        interval = base * (1.0 + SPIN_UP_EXTRA * remaining);
    }
    if slowdown > 0.0 && elapsed >= slowdown_from {
        let progress = (elapsed - slowdown_from) / slowdown;
        let eased = base * (1.0 + (SLOWDOWN_MAX_FACTOR - 1.0) * ease_out_cubic(progress));
        interval = interval.max(eased);
    }
    interval
}

pub fn clamp_scan_ms(duration_ms: u64) -> u64 {
    duration_ms.min(MAX_SCAN_MS)
}

/// Builds the scanning timeline for `[0, duration_ms]`, with `duration_ms`
/// capped at [`MAX_SCAN_MS`].
///
/// The index advances by one (mod `candidate_count`) per tick. Ticks spin up
/// to the base rate, hold it, then ease out to three base ticks inside the
/// slowdown window. The last entry is pinned at exactly `duration_ms`.
pub fn build_scan_path(
    seed: u32,
    candidate_count: usize,
    duration_ms: u64,
    tempo: Option<&Tempo>,
) -> ScanPath {
    let duration_ms = clamp_scan_ms(duration_ms);
    if candidate_count == 0 {
        return ScanPath {
            start_index: 0,
            candidate_count,
            duration_ms,
            path: Vec::new(),
            timeline_ms: Vec::new(),
        };
    }

    let tempo = ResolvedTempo::resolve(tempo);
    let start_index = seed as usize % candidate_count;
    let base = tempo.base_tick_ms();
    let total = duration_ms as f64;
    let slowdown = tempo.slowdown_ms.min(duration_ms) as f64;
    let slowdown_from = total - slowdown;

    let mut path = vec![start_index];
    let mut timeline_ms = vec![0];
    let mut elapsed = 0.0_f64;
    let mut index = start_index;
    let mut tick = 0_u32;
    loop {
        elapsed += scan_interval(elapsed, tick, base, slowdown_from, slowdown);
        if elapsed >= total {
            break;
        }
        index = (index + 1) % candidate_count;
        tick = tick.saturating_add(1);
        path.push(index);
        timeline_ms.push(elapsed.floor() as u64);
    }
    path.push(index);
    timeline_ms.push(duration_ms);

    ScanPath {
        start_index,
        candidate_count,
        duration_ms,
        path,
        timeline_ms,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RevealPath {
    pub start_index: usize,
    pub winner_index: usize,
    pub candidate_count: usize,
    pub duration_ms: u64,
    pub path: Vec<usize>,
    pub timeline_ms: Vec<u64>,
}

impl RevealPath {
    pub fn index_at_elapsed(&self, elapsed_ms: i64) -> Option<usize> {
        lookup(&self.path, &self.timeline_ms, elapsed_ms)
    }
}

pub fn clamp_reveal_ms(reveal_duration_ms: Option<u64>) -> u64 {
    reveal_duration_ms
        .unwrap_or(DEFAULT_REVEAL_MS)
        .clamp(MIN_REVEAL_MS, MAX_REVEAL_MS)
}

/// Forward-only walk from `start_index` to `winner_index`, ending on a hold
/// frame of the winner. With `near_miss`, the candidate right before the
/// winner lingers for one extra frame.
pub fn build_reveal_path(
    start_index: usize,
    winner_index: usize,
    candidate_count: usize,
    reveal_duration_ms: Option<u64>,
    near_miss: bool,
) -> RevealPath {
    let duration_ms = clamp_reveal_ms(reveal_duration_ms);
    if candidate_count == 0 {
        return RevealPath {
            start_index,
            winner_index,
            candidate_count,
            duration_ms,
            path: Vec::new(),
            timeline_ms: Vec::new(),
        };
    }

    let start_index = start_index % candidate_count;
    let winner_index = winner_index % candidate_count;
    let distance = (winner_index + candidate_count - start_index) % candidate_count;

    let mut moves = Vec::with_capacity(distance + 1);
    let mut index = start_index;
    for _ in 0..distance {
        index = (index + 1) % candidate_count;
        moves.push(index);
    }
    if near_miss && moves.len() >= 2 {
        let before_winner = moves[moves.len() - 2];
        moves.insert(moves.len() - 1, before_winner);
    }

    let step_count = moves.len();
    let weights: Vec<f64> = (0..step_count)
        .map(|i| {
            let progress = i as f64 / step_count as f64;
            1.0 + (SLOWDOWN_MAX_FACTOR - 1.0) * ease_out_cubic(progress)
        })
        .collect();
    let total_weight = weights.iter().sum::<f64>() + REVEAL_HOLD_WEIGHT;
    let total = duration_ms as f64;

    let mut path = Vec::with_capacity(step_count + 2);
    let mut timeline_ms = Vec::with_capacity(step_count + 2);
    path.push(start_index);
    timeline_ms.push(0);
    let mut acc = 0.0_f64;
    for (next, weight) in moves.into_iter().zip(weights) {
        acc += weight;
        path.push(next);
        timeline_ms.push((total * acc / total_weight).floor() as u64);
    }
    path.push(winner_index);
    timeline_ms.push(duration_ms);

    RevealPath {
        start_index,
        winner_index,
        candidate_count,
        duration_ms,
        path,
        timeline_ms,
    }
}

#[cfg(test)]
#[path = "tests/path_tests.rs"]
mod tests;
