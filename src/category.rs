use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};

/// Reserved name of the empty category, written as the sole RHS of an epsilon rule
pub const EPSILON: &str = "Epsilon";
/// Marks the "rest of the stack" in a schema category, as in `NP[*NP]`
pub const WILDCARD: char = '*';
/// Joins stack symbols in a stack string, top of stack last: `S[NP.WH]`
pub const SEPARATOR: char = '.';

/// A grammar symbol, optionally annotated with a stack.
///
/// Equality and hashing only look at the name and the stack text. The depth is a
/// counter kept alongside: the number of concrete symbols on the stack, not
/// counting a wildcard.
#[derive(Debug, Clone)]
pub struct Category {
  name: String,
  stack: String,
  depth: usize,
}

impl Category {
  pub fn new(name: impl Into<String>) -> Self {
    Self {
      name: name.into(),
      stack: String::new(),
      depth: 0,
    }
  }

  pub fn with_stack(name: impl Into<String>, stack: impl Into<String>) -> Self {
    let stack = stack.into();
    let depth = match StackPattern::parse(&stack) {
      Some(pattern) => pattern.depth(),
      None => stack_symbols(&stack).count(),
    };
    Self {
      name: name.into(),
      stack,
      depth,
    }
  }

  pub fn epsilon() -> Self {
    Self::new(EPSILON)
  }

  pub fn name(&self) -> &str {
    &self.name
  }

  pub fn stack(&self) -> &str {
    &self.stack
  }

  pub fn depth(&self) -> usize {
    self.depth
  }

  pub fn is_epsilon(&self) -> bool {
    self.name == EPSILON && self.stack.is_empty()
  }

  pub fn has_wildcard(&self) -> bool {
    self.stack.contains(WILDCARD)
  }

  pub fn is_stack_empty(&self) -> bool {
    self.stack.is_empty()
  }

  /// The same symbol with its stack stripped
  pub fn base(&self) -> Self {
    Self::new(self.name.clone())
  }

  /// The wildcard pattern of a schema category, or None for a concrete one
  pub fn pattern(&self) -> Option<StackPattern> {
    StackPattern::parse(&self.stack)
  }

  /// Renames the category and every stack symbol found in `names`
  pub fn renamed(&self, names: &HashMap<String, String>) -> Self {
    let rename = |s: &str| names.get(s).cloned().unwrap_or_else(|| s.to_string());
    let stack = match self.pattern() {
      Some(pattern) => StackPattern {
        prefix: rename_symbols(&pattern.prefix, rename),
        suffix: rename_symbols(&pattern.suffix, rename),
      }
      .to_string(),
      None => rename_symbols(&self.stack, rename),
    };

    Self {
      name: rename(&self.name),
      stack,
      depth: self.depth,
    }
  }
}

fn stack_symbols(stack: &str) -> impl Iterator<Item = &str> {
  stack.split(SEPARATOR).filter(|s| !s.is_empty())
}

fn rename_symbols(stack: &str, rename: impl Fn(&str) -> String) -> String {
  stack_symbols(stack)
    .map(rename)
    .collect::<Vec<_>>()
    .join(&SEPARATOR.to_string())
}

impl PartialEq for Category {
  fn eq(&self, other: &Self) -> bool {
    self.name == other.name && self.stack == other.stack
  }
}

impl Eq for Category {}

impl Hash for Category {
  fn hash<H: Hasher>(&self, state: &mut H) {
    self.name.hash(state);
    self.stack.hash(state);
  }
}

impl PartialOrd for Category {
  fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
    Some(self.cmp(other))
  }
}

impl Ord for Category {
  fn cmp(&self, other: &Self) -> Ordering {
    (&self.name, &self.stack).cmp(&(&other.name, &other.stack))
  }
}

impl fmt::Display for Category {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    if self.stack.is_empty() {
      write!(f, "{}", self.name)
    } else {
      write!(f, "{}[{}]", self.name, self.stack)
    }
  }
}

/// A schema stack of the form `prefix*suffix`, where `*` captures the rest of
/// a concrete stack. Matching only splits at separators, so a symbol can never
/// be matched against part of another symbol.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StackPattern {
  prefix: String,
  suffix: String,
}

impl StackPattern {
  /// Reads a schema stack text. None if it has no wildcard.
  pub fn parse(stack: &str) -> Option<Self> {
    let (prefix, suffix) = stack.split_once(WILDCARD)?;
    Some(Self {
      prefix: prefix.trim_end_matches(SEPARATOR).to_string(),
      suffix: suffix.trim_start_matches(SEPARATOR).to_string(),
    })
  }

  /// Number of explicit symbols around the wildcard
  pub fn depth(&self) -> usize {
    stack_symbols(&self.prefix).count() + stack_symbols(&self.suffix).count()
  }

  /// Matches a concrete stack, returning what the wildcard captured
  pub fn capture<'a>(&self, stack: &'a str) -> Option<&'a str> {
    let mut rest = stack;

    if !self.prefix.is_empty() {
      rest = rest.strip_prefix(self.prefix.as_str())?;
      if !rest.is_empty() {
        rest = rest.strip_prefix(SEPARATOR)?;
      }
    }

    if !self.suffix.is_empty() {
      if rest == self.suffix {
        rest = "";
      } else {
        rest = rest
          .strip_suffix(self.suffix.as_str())?
          .strip_suffix(SEPARATOR)?;
      }
    }

    Some(rest)
  }

  /// Fills the wildcard with a captured stack
  pub fn substitute(&self, captured: &str) -> String {
    [self.prefix.as_str(), captured, self.suffix.as_str()]
      .iter()
      .filter(|s| !s.is_empty())
      .copied()
      .collect::<Vec<_>>()
      .join(&SEPARATOR.to_string())
  }
}

impl fmt::Display for StackPattern {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    if !self.prefix.is_empty() {
      write!(f, "{}{}", self.prefix, SEPARATOR)?;
    }
    write!(f, "{}{}", WILDCARD, self.suffix)
  }
}
