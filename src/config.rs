use serde::{Deserialize, Serialize};

/// Knobs shared by compilation, parsing and counting.
///
/// Deserializes with every field optional, falling back to [`Config::default`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
  /// Name of the start category
  pub start: String,
  /// Name of the synthetic category above the start category
  pub gamma: String,
  /// Deepest stack a compiled category may carry
  pub max_stack_depth: usize,
  /// Number of nonterminals `X1..Xk` in the rule space
  pub max_nonterminals: usize,
  /// Work a single chart column may do before the parse is abandoned
  pub max_states_per_column: usize,
  /// Tallest derivation counted when normalizing
  pub count_depth: usize,
}

impl Default for Config {
  fn default() -> Self {
    Self {
      start: "START".to_string(),
      gamma: "Gamma".to_string(),
      max_stack_depth: 3,
      max_nonterminals: 4,
      max_states_per_column: 100_000,
      count_depth: 8,
    }
  }
}
