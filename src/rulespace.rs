use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::fmt;

use tracing::debug;

use crate::category::{Category, SEPARATOR, WILDCARD};
use crate::config::Config;
use crate::grammar::SchemaGrammar;
use crate::rules::{Rule, StackOp};
use crate::utils::Result;

/// Address of a rule in a [`RuleSpace`]: its class, the index of its
/// left-hand nonterminal, and its row within that nonterminal's block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Coordinate {
  pub class: StackOp,
  pub lhs: usize,
  pub rhs: usize,
}

impl fmt::Display for Coordinate {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{:?}:{}:{}", self.class, self.lhs, self.rhs)
  }
}

/// Every schema rule a hypothesis could contain, over a fixed symbol set: the
/// parts of speech plus nonterminals `X1..Xk`.
///
/// Each class has one block of rows per nonterminal `Xi`:
///
/// ```text
/// Constant  0            START -> Xi
///           1..=S        Xi[*] -> a            (a[*] if a is a nonterminal)
///           ..           Xi[*] -> a b          (rightmost nonterminal inherits)
/// Push      ..           Xi[*] -> a b[*a]      (b a nonterminal)
/// Pop       0..S         Xi[*a] -> Epsilon
///           ..           Xi[*a] -> b[*]        (b a nonterminal)
/// ```
///
/// where `S` is the number of symbols. Lookups are constant time both ways.
/// Built once, then only read, so one space can be shared by every thread
/// evaluating hypotheses.
#[derive(Debug, Clone)]
pub struct RuleSpace {
  start: Category,
  symbols: Vec<Category>,
  nonterminals: Vec<Category>,
  rows: [Vec<Vec<Rule>>; 3],
  coordinates: HashMap<(Category, Vec<Category>), Coordinate>,
}

impl RuleSpace {
  pub fn new(pos: &HashSet<String>, config: &Config) -> Self {
    let mut pos = pos.iter().cloned().collect::<Vec<_>>();
    pos.sort();
    let nonterminals = (1..=config.max_nonterminals)
      .map(|i| Category::new(format!("X{}", i)))
      .collect::<Vec<_>>();
    let symbols = pos
      .into_iter()
      .map(Category::new)
      .chain(nonterminals.iter().cloned())
      .collect::<Vec<_>>();

    let mut space = Self {
      start: Category::new(config.start.clone()),
      symbols,
      nonterminals,
      rows: [Vec::new(), Vec::new(), Vec::new()],
      coordinates: HashMap::new(),
    };

    for lhs in 0..space.nonterminals.len() {
      let constant = space.constant_rows(lhs);
      let push = space.push_rows(lhs);
      let pop = space.pop_rows(lhs);
      space.rows[StackOp::Constant.index()].push(constant);
      space.rows[StackOp::Push.index()].push(push);
      space.rows[StackOp::Pop.index()].push(pop);
    }

    for class in StackOp::ALL {
      for (lhs, block) in space.rows[class.index()].iter().enumerate() {
        for (rhs, rule) in block.iter().enumerate() {
          let key = (rule.lhs.clone(), rule.rhs.clone());
          space.coordinates.insert(key, Coordinate { class, lhs, rhs });
        }
      }
    }

    debug!(
      symbols = space.symbols.len(),
      nonterminals = space.nonterminals.len(),
      rules = space.len(),
      "built rule space"
    );
    space
  }

  fn is_nonterminal(&self, c: &Category) -> bool {
    self.nonterminals.contains(c)
  }

  /// Nonterminals a category names, itself first and then its stack symbols
  fn mentioned(&self, c: &Category) -> Vec<&Category> {
    std::iter::once(c.name())
      .chain(c.stack().split([SEPARATOR, WILDCARD]))
      .filter_map(|name| self.nonterminals.iter().find(|x| x.name() == name))
      .collect()
  }

  fn inherits(c: &Category) -> Category {
    Category::with_stack(c.name(), "*")
  }

  fn constant_rows(&self, lhs: usize) -> Vec<Rule> {
    let x = &self.nonterminals[lhs];
    let schema_x = Self::inherits(x);
    let mut rows = vec![Rule::new(self.start.clone(), vec![x.clone()])];

    for a in self.symbols.iter() {
      let a = if self.is_nonterminal(a) {
        Self::inherits(a)
      } else {
        a.clone()
      };
      rows.push(Rule::new(schema_x.clone(), vec![a]));
    }

    for a in self.symbols.iter() {
      for b in self.symbols.iter() {
        let rhs = if self.is_nonterminal(b) {
          vec![a.clone(), Self::inherits(b)]
        } else if self.is_nonterminal(a) {
          vec![Self::inherits(a), b.clone()]
        } else {
          vec![a.clone(), b.clone()]
        };
        rows.push(Rule::new(schema_x.clone(), rhs));
      }
    }
    rows
  }

  fn push_rows(&self, lhs: usize) -> Vec<Rule> {
    let schema_x = Self::inherits(&self.nonterminals[lhs]);
    let mut rows = Vec::new();
    for a in self.symbols.iter() {
      for b in self.nonterminals.iter() {
        let pushed = Category::with_stack(b.name(), format!("{}{}", WILDCARD, a.name()));
        rows.push(Rule::new(schema_x.clone(), vec![a.clone(), pushed]));
      }
    }
    rows
  }

  fn pop_rows(&self, lhs: usize) -> Vec<Rule> {
    let x = &self.nonterminals[lhs];
    let popping =
      |a: &Category| Category::with_stack(x.name(), format!("{}{}", WILDCARD, a.name()));

    let mut rows = self
      .symbols
      .iter()
      .map(|a| Rule::epsilon(popping(a)))
      .collect::<Vec<_>>();
    for a in self.symbols.iter() {
      for b in self.nonterminals.iter() {
        rows.push(Rule::new(popping(a), vec![Self::inherits(b)]));
      }
    }
    rows
  }

  pub fn symbols(&self) -> &[Category] {
    &self.symbols
  }

  pub fn nonterminals(&self) -> &[Category] {
    &self.nonterminals
  }

  /// Total number of rules
  pub fn len(&self) -> usize {
    self
      .rows
      .iter()
      .flat_map(|blocks| blocks.iter())
      .map(|block| block.len())
      .sum()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  /// Rows in the block of one class and left-hand nonterminal
  pub fn rows(&self, class: StackOp, lhs: usize) -> usize {
    self.rows[class.index()]
      .get(lhs)
      .map(|block| block.len())
      .unwrap_or(0)
  }

  pub fn rule(&self, at: Coordinate) -> &Rule {
    &self.rows[at.class.index()][at.lhs][at.rhs]
  }

  pub fn get(&self, at: Coordinate) -> Option<&Rule> {
    self.rows[at.class.index()]
      .get(at.lhs)
      .and_then(|block| block.get(at.rhs))
  }

  /// Where a rule lives, by its categories. None if it isn't in the space.
  pub fn coordinate(&self, rule: &Rule) -> Option<Coordinate> {
    self
      .coordinates
      .get(&(rule.lhs.clone(), rule.rhs.clone()))
      .copied()
  }

  pub fn coordinates(&self) -> impl Iterator<Item = Coordinate> + '_ {
    StackOp::ALL.into_iter().flat_map(move |class| {
      self.rows[class.index()]
        .iter()
        .enumerate()
        .flat_map(move |(lhs, block)| {
          (0..block.len()).map(move |rhs| Coordinate { class, lhs, rhs })
        })
    })
  }
}

/// A grammar hypothesis as a set of rule-space coordinates. Cheap to copy,
/// compare and hash, unlike the grammar it stands for.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Hypothesis(BTreeSet<Coordinate>);

impl Hypothesis {
  pub fn new() -> Self {
    Default::default()
  }

  pub fn insert(&mut self, at: Coordinate) -> bool {
    self.0.insert(at)
  }

  pub fn remove(&mut self, at: &Coordinate) -> bool {
    self.0.remove(at)
  }

  pub fn contains(&self, at: &Coordinate) -> bool {
    self.0.contains(at)
  }

  pub fn len(&self) -> usize {
    self.0.len()
  }

  pub fn is_empty(&self) -> bool {
    self.0.is_empty()
  }

  pub fn iter(&self) -> impl Iterator<Item = &Coordinate> {
    self.0.iter()
  }

  pub fn rules<'a>(&'a self, space: &'a RuleSpace) -> impl Iterator<Item = &'a Rule> + 'a {
    self.0.iter().map(move |at| space.rule(*at))
  }

  /// The schema grammar this hypothesis stands for, with rule ids in
  /// coordinate order
  pub fn to_schema(&self, space: &RuleSpace) -> Result<SchemaGrammar> {
    SchemaGrammar::from_rules(self.rules(space).map(|r| r.copy_structure()))
  }

  /// Renames nonterminals to `X1, X2, ..` in the order they're reached from
  /// the start category, so hypotheses that differ only in naming compare
  /// equal. Unreachable nonterminals are numbered after, in rule order.
  pub fn canonicalize(&self, space: &RuleSpace) -> Hypothesis {
    let rules = self.rules(space).collect::<Vec<_>>();
    let mut order: Vec<&Category> = Vec::new();

    let mut queue = VecDeque::from([&space.start]);
    while let Some(lhs) = queue.pop_front() {
      for rule in rules.iter().filter(|r| r.lhs.name() == lhs.name()) {
        for x in rule.rhs.iter().flat_map(|c| space.mentioned(c)) {
          if !order.contains(&x) {
            order.push(x);
            queue.push_back(x);
          }
        }
      }
    }
    for rule in rules.iter() {
      let lhs = space.mentioned(&rule.lhs);
      for x in lhs.into_iter().chain(rule.rhs.iter().flat_map(|c| space.mentioned(c))) {
        if !order.contains(&x) {
          order.push(x);
        }
      }
    }

    let names = order
      .iter()
      .zip(space.nonterminals.iter())
      .map(|(old, new)| (old.name().to_string(), new.name().to_string()))
      .collect::<HashMap<_, _>>();

    rules
      .iter()
      .map(|rule| {
        space
          .coordinate(&rule.renamed(&names))
          .expect("rule space is closed under renaming nonterminals")
      })
      .collect()
  }
}

impl FromIterator<Coordinate> for Hypothesis {
  fn from_iter<I: IntoIterator<Item = Coordinate>>(iter: I) -> Self {
    Self(iter.into_iter().collect())
  }
}

impl fmt::Display for Hypothesis {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let coordinates = self.0.iter().map(|c| c.to_string()).collect::<Vec<_>>();
    write!(f, "{{{}}}", coordinates.join(", "))
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::compile::compile;

  fn pos() -> HashSet<String> {
    ["N", "V"].iter().map(|s| s.to_string()).collect()
  }

  fn space(k: usize) -> RuleSpace {
    let config = Config {
      max_nonterminals: k,
      ..Config::default()
    };
    RuleSpace::new(&pos(), &config)
  }

  fn at(space: &RuleSpace, rule: &str) -> Coordinate {
    let schema: SchemaGrammar = rule.parse().unwrap();
    let rule = schema.rules().next().unwrap();
    space
      .coordinate(rule)
      .unwrap_or_else(|| panic!("{} not in rule space", rule))
  }

  #[test]
  fn test_layout() {
    let space = space(2);
    // N V X1 X2
    let s = 4;
    assert_eq!(space.symbols().len(), s);
    assert_eq!(space.rows(StackOp::Constant, 0), 1 + s + s * s);
    assert_eq!(space.rows(StackOp::Push, 1), s * 2);
    assert_eq!(space.rows(StackOp::Pop, 0), s + s * 2);
    assert_eq!(space.rows(StackOp::Pop, 2), 0);
    assert_eq!(space.len(), 2 * ((1 + s + s * s) + s * 2 + (s + s * 2)));

    let first = Coordinate {
      class: StackOp::Constant,
      lhs: 1,
      rhs: 0,
    };
    assert_eq!(space.rule(first).to_string(), "START -> X2");
    assert_eq!(at(&space, "X1[*] -> N X2[*]").class, StackOp::Constant);
    assert_eq!(at(&space, "X1[*] -> X2[*] V").class, StackOp::Constant);
    assert_eq!(at(&space, "X1[*] -> N X2[*N]").class, StackOp::Push);
    assert_eq!(at(&space, "X2[*X1] ->").class, StackOp::Pop);
    assert_eq!(at(&space, "X2[*V] -> X1[*]").class, StackOp::Pop);
  }

  #[test]
  fn test_bijection() {
    let space = space(3);
    let mut seen = HashSet::new();
    for c in space.coordinates() {
      let rule = space.rule(c);
      assert!(rule.validate().is_ok(), "{} is malformed", rule);
      assert_eq!(space.coordinate(rule), Some(c));
      assert_eq!(space.get(c).map(|r| r.to_string()), Some(rule.to_string()));
      assert!(seen.insert(rule.to_string()), "{} listed twice", rule);
    }
    assert_eq!(seen.len(), space.len());
    assert!(space.get(Coordinate { class: StackOp::Push, lhs: 9, rhs: 0 }).is_none());
  }

  #[test]
  fn test_hypothesis_compiles() {
    let space = space(2);
    let h: Hypothesis = [
      "START -> X1",
      "X1[*] -> N X2[*N]",
      "X2[*] -> V X1[*]",
      "X1[*N] ->",
      "X1[*] -> N",
    ]
    .iter()
    .map(|r| at(&space, r))
    .collect();
    assert_eq!(h.len(), 5);

    let schema = h.to_schema(&space).unwrap();
    assert_eq!(schema.len(), 5);
    let g = compile(&schema, &pos(), &Config::default()).unwrap();
    assert!(g.rules().any(|r| r.to_string() == "X2[N] -> V X1[N]"));
    assert!(g.rules().any(|r| r.to_string() == "X1[N] ->"));
  }

  #[test]
  fn test_canonicalize() {
    let space = space(3);
    let h: Hypothesis = ["START -> X3", "X3[*] -> N X2[*N]", "X2[*] -> V", "X2[*N] -> X2[*]"]
      .iter()
      .map(|r| at(&space, r))
      .collect();
    let canonical = h.canonicalize(&space);
    let rules = canonical
      .rules(&space)
      .map(|r| r.to_string())
      .collect::<BTreeSet<_>>();
    let expected = ["START -> X1", "X1[*] -> N X2[*N]", "X2[*] -> V", "X2[*N] -> X2[*]"]
      .iter()
      .map(|s| s.to_string())
      .collect::<BTreeSet<_>>();
    assert_eq!(rules, expected);
    assert_eq!(canonical.canonicalize(&space), canonical);

    let renamed: Hypothesis = ["START -> X2", "X2[*] -> N X3[*N]", "X3[*] -> V", "X3[*N] -> X3[*]"]
      .iter()
      .map(|r| at(&space, r))
      .collect();
    assert_ne!(renamed, h);
    assert_eq!(renamed.canonicalize(&space), canonical);
  }

  #[test]
  fn test_rule_space_is_sync() {
    fn assert_send_sync<T: Send + Sync>() {}
    assert_send_sync::<RuleSpace>();
    assert_send_sync::<Hypothesis>();
  }
}
