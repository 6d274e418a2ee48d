use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use thiserror::Error;

/// Everything that can go wrong while building, compiling or parsing a grammar.
///
/// Only [`Error::Malformed`] and [`Error::UnboundedDerivation`] describe a bad
/// *hypothesis*; a search loop should reject the mutation and carry on. See
/// [`Error::rejects_hypothesis`].
#[derive(Debug, Error)]
pub enum Error {
  /// A rule or grammar that breaks the push/pop/arity rules, or contains a
  /// cyclic unit production
  #[error("malformed hypothesis: {0}")]
  Malformed(String),
  /// A column processed more states than the configured limit
  #[error("unbounded derivation: column {column} exceeded {limit} states")]
  UnboundedDerivation { column: usize, limit: usize },
  /// Cancellation was requested between two columns
  #[error("parse cancelled")]
  Cancelled,
  /// Grammar or vocabulary source text didn't parse
  #[error("syntax error: {0}")]
  Syntax(String),
  #[error(transparent)]
  Io(#[from] std::io::Error),
}

impl Error {
  /// True for errors that mean "this grammar is no good", which the objective
  /// scores as probability zero instead of aborting the run.
  pub fn rejects_hypothesis(&self) -> bool {
    matches!(self, Self::Malformed(_) | Self::UnboundedDerivation { .. })
  }
}

impl From<String> for Error {
  fn from(s: String) -> Self {
    Self::Syntax(s)
  }
}

impl From<&str> for Error {
  fn from(s: &str) -> Self {
    Self::Syntax(s.to_string())
  }
}

pub type Result<T> = std::result::Result<T, Error>;

/// Shared flag a caller can flip to stop a parse or generation at the next
/// column boundary.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
  pub fn new() -> Self {
    Default::default()
  }

  pub fn cancel(&self) {
    self.0.store(true, Ordering::Relaxed);
  }

  pub fn is_cancelled(&self) -> bool {
    self.0.load(Ordering::Relaxed)
  }
}

/// Takes a list where each element is a set of choices, and returns all the possible sets
/// generated. Will clone the elements.
///
/// ```
/// let v = vec![
///   vec![1],
///   vec![2, 3],
///   vec![4],
///   vec![5, 6, 7],
/// ];
///
/// assert_eq!(lig::utils::combinations(&v), vec![
///   vec![1, 2, 4, 5],
///   vec![1, 3, 4, 5],
///   vec![1, 2, 4, 6],
///   vec![1, 3, 4, 6],
///   vec![1, 2, 4, 7],
///   vec![1, 3, 4, 7],
/// ]);
/// ```
pub fn combinations<T>(list: &[Vec<T>]) -> Vec<Vec<T>>
where
  T: Clone,
{
  if list.is_empty() {
    Vec::new()
  } else if list.len() == 1 {
    list[0].iter().map(|e| vec![e.clone()]).collect()
  } else {
    let (head, tail) = list.split_at(1);
    let head = &head[0];

    combinations(tail)
      .into_iter()
      .flat_map(|subseq| {
        // prepend every element of the head to every possible subseq
        head.iter().map(move |v| {
          let mut newseq = subseq.clone();
          newseq.insert(0, v.clone());
          newseq
        })
      })
      .collect()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_rejects_hypothesis() {
    assert!(Error::Malformed("x".into()).rejects_hypothesis());
    assert!(Error::UnboundedDerivation { column: 3, limit: 10 }.rejects_hypothesis());
    assert!(!Error::Cancelled.rejects_hypothesis());
    assert!(!Error::from("bad line").rejects_hypothesis());
  }

  #[test]
  fn test_cancel_flag_is_shared() {
    let flag = CancelFlag::new();
    let other = flag.clone();
    assert!(!other.is_cancelled());
    flag.cancel();
    assert!(other.is_cancelled());
  }

  #[test]
  fn test_combinations_empty_choice() {
    let v: Vec<Vec<u8>> = vec![vec![1, 2], vec![]];
    assert!(combinations(&v).is_empty());
  }
}
