use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};

use crate::category::Category;
use crate::utils::{Error, Result};

/// Sequence number of a rule inside the grammar that owns it
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RuleId(pub u32);

impl RuleId {
  /// Id of a rule that hasn't been inserted into a grammar yet
  pub const UNASSIGNED: RuleId = RuleId(u32::MAX);

  pub fn index(self) -> usize {
    self.0 as usize
  }
}

impl fmt::Display for RuleId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "r{}", self.0)
  }
}

/// What a schema rule does to the stack it receives
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum StackOp {
  /// Passes the stack through unchanged (or carries no stack at all)
  Constant,
  /// Pushes a symbol onto the stack handed to a child
  Push,
  /// Pops a symbol off the stack it was given
  Pop,
}

impl StackOp {
  pub const ALL: [StackOp; 3] = [StackOp::Constant, StackOp::Push, StackOp::Pop];

  pub fn index(self) -> usize {
    match self {
      Self::Constant => 0,
      Self::Push => 1,
      Self::Pop => 2,
    }
  }
}

/// A unary or binary production. Identity is the id handed out by the
/// owning grammar, not the categories: two structurally equal rules from
/// different insertions are different rules.
#[derive(Debug, Clone)]
pub struct Rule {
  pub id: RuleId,
  pub lhs: Category,
  pub rhs: Vec<Category>,
  /// Schema rule this one was compiled from
  pub origin: Option<RuleId>,
}

impl Rule {
  pub fn new(lhs: Category, rhs: Vec<Category>) -> Self {
    Self {
      id: RuleId::UNASSIGNED,
      lhs,
      rhs,
      origin: None,
    }
  }

  pub fn epsilon(lhs: Category) -> Self {
    Self::new(lhs, vec![Category::epsilon()])
  }

  pub fn len(&self) -> usize {
    self.rhs.len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  pub fn is_epsilon(&self) -> bool {
    self.rhs.len() == 1 && self.rhs[0].is_epsilon()
  }

  pub fn is_unary(&self) -> bool {
    self.rhs.len() == 1 && !self.is_epsilon()
  }

  pub fn is_binary(&self) -> bool {
    self.rhs.len() == 2
  }

  /// Whether any side carries a wildcard stack
  pub fn is_schema(&self) -> bool {
    self.lhs.has_wildcard() || self.rhs.iter().any(|c| c.has_wildcard())
  }

  /// Index of the right-hand category that inherits the stack
  pub fn heir(&self) -> Option<usize> {
    self.rhs.iter().position(|c| c.has_wildcard())
  }

  pub fn stack_op(&self) -> StackOp {
    let popped = self.lhs.pattern().map(|p| p.depth()).unwrap_or(0);
    let pushed = self
      .heir()
      .and_then(|idx| self.rhs[idx].pattern())
      .map(|p| p.depth())
      .unwrap_or(0);

    if pushed > 0 {
      StackOp::Push
    } else if popped > 0 {
      StackOp::Pop
    } else {
      StackOp::Constant
    }
  }

  /// Checks the arity and stack-usage rules every grammar rule obeys
  pub fn validate(&self) -> Result<()> {
    if self.rhs.is_empty() || self.rhs.len() > 2 {
      return Err(Error::Malformed(format!(
        "rule must have 1 or 2 right-hand categories: {}",
        self
      )));
    }
    if self.lhs.is_epsilon() {
      return Err(Error::Malformed(format!("epsilon can't be rewritten: {}", self)));
    }
    if self.rhs.len() > 1 && self.rhs.iter().any(|c| c.is_epsilon()) {
      return Err(Error::Malformed(format!(
        "epsilon must be the only right-hand category: {}",
        self
      )));
    }

    let wildcards = self.rhs.iter().filter(|c| c.has_wildcard()).count();
    if wildcards > 1 {
      return Err(Error::Malformed(format!(
        "only one child can inherit the stack: {}",
        self
      )));
    }
    if wildcards == 1 && !self.lhs.has_wildcard() {
      return Err(Error::Malformed(format!(
        "a child inherits a stack the parent doesn't have: {}",
        self
      )));
    }

    let popped = self.lhs.pattern().map(|p| p.depth()).unwrap_or(0);
    let pushed = self
      .heir()
      .and_then(|idx| self.rhs[idx].pattern())
      .map(|p| p.depth())
      .unwrap_or(0);
    if popped > 0 && pushed > 0 {
      return Err(Error::Malformed(format!("rule both pushes and pops: {}", self)));
    }
    if popped > 1 || pushed > 1 {
      return Err(Error::Malformed(format!(
        "rule moves more than one stack symbol: {}",
        self
      )));
    }

    Ok(())
  }

  /// Deep copy of the production, detached from any grammar
  pub fn copy_structure(&self) -> Self {
    Self::new(self.lhs.clone(), self.rhs.clone())
  }

  pub fn same_production(&self, other: &Rule) -> bool {
    self.lhs == other.lhs && self.rhs == other.rhs
  }

  pub fn renamed(&self, names: &HashMap<String, String>) -> Self {
    Self {
      id: self.id,
      lhs: self.lhs.renamed(names),
      rhs: self.rhs.iter().map(|c| c.renamed(names)).collect(),
      origin: self.origin,
    }
  }
}

impl PartialEq for Rule {
  fn eq(&self, other: &Self) -> bool {
    self.id == other.id
  }
}

impl Eq for Rule {}

impl Hash for Rule {
  fn hash<H: Hasher>(&self, state: &mut H) {
    self.id.hash(state);
  }
}

impl fmt::Display for Rule {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{} ->", self.lhs)?;
    if self.is_epsilon() {
      return Ok(());
    }
    for c in self.rhs.iter() {
      write!(f, " {}", c)?;
    }
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn cat(name: &str) -> Category {
    Category::new(name)
  }

  fn stacked(name: &str, stack: &str) -> Category {
    Category::with_stack(name, stack)
  }

  #[test]
  fn test_identity_is_the_id() {
    let mut a = Rule::new(cat("S"), vec![cat("NP"), cat("VP")]);
    let mut b = a.copy_structure();
    a.id = RuleId(1);
    b.id = RuleId(2);
    assert_ne!(a, b);
    assert!(a.same_production(&b));

    let mut c = Rule::new(cat("X"), vec![cat("Y")]);
    c.id = RuleId(1);
    assert_eq!(a, c);
  }

  #[test]
  fn test_copy_structure_does_not_alias() {
    let mut a = Rule::new(cat("S"), vec![cat("NP")]);
    a.id = RuleId(4);
    let mut b = a.copy_structure();
    b.rhs[0] = cat("VP");
    assert_eq!(b.id, RuleId::UNASSIGNED);
    assert_eq!(a.rhs[0], cat("NP"));
  }

  #[test]
  fn test_stack_op() {
    let push = Rule::new(stacked("S", "*"), vec![cat("NP"), stacked("VP", "*NP")]);
    assert_eq!(push.stack_op(), StackOp::Push);
    assert_eq!(push.heir(), Some(1));

    let pop = Rule::epsilon(stacked("NP", "*NP"));
    assert_eq!(pop.stack_op(), StackOp::Pop);

    let copy = Rule::new(stacked("VP", "*"), vec![cat("V"), stacked("NP", "*")]);
    assert_eq!(copy.stack_op(), StackOp::Constant);

    let plain = Rule::new(cat("S"), vec![cat("NP"), cat("VP")]);
    assert_eq!(plain.stack_op(), StackOp::Constant);
    assert!(!plain.is_schema());
  }

  #[test]
  fn test_validate() {
    assert!(Rule::new(cat("S"), vec![cat("NP"), cat("VP")]).validate().is_ok());
    assert!(Rule::epsilon(cat("NP")).validate().is_ok());

    let bad = [
      Rule::new(cat("S"), vec![]),
      Rule::new(cat("S"), vec![cat("A"), cat("B"), cat("C")]),
      Rule::new(cat("S"), vec![cat("A"), Category::epsilon()]),
      Rule::new(stacked("S", "*"), vec![stacked("A", "*"), stacked("B", "*")]),
      Rule::new(cat("S"), vec![stacked("A", "*")]),
      Rule::new(stacked("S", "*NP"), vec![stacked("A", "*NP")]),
      Rule::new(stacked("S", "*"), vec![stacked("A", "*NP.NP")]),
    ];
    for rule in bad.iter() {
      assert!(
        matches!(rule.validate(), Err(Error::Malformed(_))),
        "should reject {}",
        rule
      );
    }
  }

  #[test]
  fn test_display() {
    let r = Rule::new(stacked("S", "*"), vec![cat("NP"), stacked("VP", "*NP")]);
    assert_eq!(r.to_string(), "S[*] -> NP VP[*NP]");
    assert_eq!(Rule::epsilon(stacked("NP", "*NP")).to_string(), "NP[*NP] ->");
  }
}
