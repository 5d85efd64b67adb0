use regex::Regex;
use std::sync::OnceLock;

use crate::model::ProgressUpdate;

/// Fraction the coordinator reports when the sync lock is acquired, before
/// any transport notification arrives. Translated fractions start here so
/// one job's stream never dips below what was already reported.
pub const BASELINE_PROGRESS: f64 = 0.02;

/// Coarse phases a git transport reports, in the order they are expected
/// to occur during a clone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClonePhase {
  Counting,
  Compressing,
  Receiving,
  Resolving,
}

impl ClonePhase {
  /// Upper bound of the sub-range of [0, 1] owned by this phase.
  fn ceiling(self) -> f64 {
    match self {
      ClonePhase::Counting => 0.05,
      ClonePhase::Compressing => 0.10,
      ClonePhase::Receiving => 0.90,
      ClonePhase::Resolving => 1.0,
    }
  }
}

/// Maps raw (phase, current, max) notifications onto a single smoothed
/// fraction in [0, 1].
///
/// Each phase owns a fixed sub-range; entering a new phase promotes the
/// previous ceiling to the new floor, and within a phase the counter pair
/// interpolates linearly. Phases that never report counters are skipped
/// without a fractional update. This is a UX smoothing heuristic, not an
/// exact byte accounting.
#[derive(Debug)]
pub struct ProgressTranslator {
  phase: Option<ClonePhase>,
  floor: f64,
  ceiling: f64,
  emitted: f64,
}

impl Default for ProgressTranslator {
  fn default() -> Self {
    Self::new()
  }
}

impl ProgressTranslator {
  pub fn new() -> Self {
    Self {
      phase: None,
      floor: 0.0,
      ceiling: BASELINE_PROGRESS,
      emitted: BASELINE_PROGRESS,
    }
  }

  /// Feed one notification. Returns an update only when the counter pair
  /// is usable (`max` present and non-zero); otherwise the caller forwards
  /// the message untranslated.
  pub fn observe(
    &mut self,
    phase: ClonePhase,
    current: u64,
    max: Option<u64>,
    message: &str,
  ) -> Option<ProgressUpdate> {
    if self.phase != Some(phase) {
      self.phase = Some(phase);
      self.floor = self.ceiling;
      self.ceiling = phase.ceiling();
    }

    let max = max.filter(|m| *m > 0)?;
    let within = (current as f64 / max as f64).clamp(0.0, 1.0);
    let fraction = (self.floor + within * (self.ceiling - self.floor)).clamp(0.0, 1.0);
    // Fractions never go backwards within one job, even if the transport
    // interleaves phase notifications.
    self.emitted = self.emitted.max(fraction);
    Some(ProgressUpdate {
      progress: self.emitted,
      message: message.to_string(),
    })
  }
}

static COUNTED: OnceLock<Regex> = OnceLock::new();
static BARE: OnceLock<Regex> = OnceLock::new();

fn phase_for(word: &str) -> Option<ClonePhase> {
  match word {
    // Modern git says "Enumerating" where older servers said "Counting".
    "Enumerating" | "Counting" => Some(ClonePhase::Counting),
    "Compressing" => Some(ClonePhase::Compressing),
    "Receiving" => Some(ClonePhase::Receiving),
    "Resolving" => Some(ClonePhase::Resolving),
    _ => None,
  }
}

/// Parse one sideband line from the remote into a phase and its counters.
///
/// Handles both counted forms ("Compressing objects:  45% (9/20)") and the
/// bare count git emits while still enumerating ("Counting objects: 123"),
/// which has no usable max.
pub fn parse_sideband(line: &str) -> Option<(ClonePhase, u64, Option<u64>)> {
  let line = line.strip_prefix("remote:").unwrap_or(line).trim();

  let counted = COUNTED.get_or_init(|| {
    Regex::new(
      r"^(Enumerating|Counting|Compressing|Receiving|Resolving) (?:objects|deltas):\s*(?:\d+%\s*)?\((\d+)/(\d+)\)",
    )
    .unwrap()
  });
  if let Some(c) = counted.captures(line) {
    let phase = phase_for(&c[1])?;
    let current = c[2].parse().ok()?;
    let max = c[3].parse().ok()?;
    return Some((phase, current, Some(max)));
  }

  let bare = BARE
    .get_or_init(|| Regex::new(r"^(Enumerating|Counting|Compressing) objects:\s*(\d+)").unwrap());
  if let Some(c) = bare.captures(line) {
    let phase = phase_for(&c[1])?;
    let current = c[2].parse().ok()?;
    return Some((phase, current, None));
  }

  None
}
