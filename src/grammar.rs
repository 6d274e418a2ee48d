use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;

use crate::category::{Category, SEPARATOR, WILDCARD};
use crate::rules::{Rule, RuleId};
use crate::utils::{Error, Result};

/// Rules as written, before stack wildcards are expanded. Indexed by the base
/// name of the left-hand category.
#[derive(Debug, Clone, Default)]
pub struct SchemaGrammar {
  rules: Vec<Rule>,
  by_base: HashMap<String, Vec<RuleId>>,
}

impl SchemaGrammar {
  pub fn new() -> Self {
    Default::default()
  }

  pub fn from_rules<I>(rules: I) -> Result<Self>
  where
    I: IntoIterator<Item = Rule>,
  {
    let mut g = Self::new();
    for rule in rules {
      g.insert(rule)?;
    }
    Ok(g)
  }

  /// Validates a rule and gives it the next sequence number
  pub fn insert(&mut self, mut rule: Rule) -> Result<RuleId> {
    rule.validate()?;
    for c in std::iter::once(&rule.lhs).chain(rule.rhs.iter()) {
      check_stack_text(c)?;
    }

    let id = RuleId(self.rules.len() as u32);
    rule.id = id;
    self
      .by_base
      .entry(rule.lhs.name().to_string())
      .or_default()
      .push(id);
    self.rules.push(rule);
    Ok(id)
  }

  pub fn len(&self) -> usize {
    self.rules.len()
  }

  pub fn is_empty(&self) -> bool {
    self.rules.is_empty()
  }

  pub fn rule(&self, id: RuleId) -> &Rule {
    &self.rules[id.index()]
  }

  pub fn rules(&self) -> impl Iterator<Item = &Rule> {
    self.rules.iter()
  }

  pub fn rules_for_base<'a>(&'a self, name: &str) -> impl Iterator<Item = &'a Rule> + 'a {
    self
      .by_base
      .get(name)
      .into_iter()
      .flatten()
      .map(move |id| &self.rules[id.index()])
  }

  /// Copy of this grammar with categories and stack symbols renamed
  pub fn renamed(&self, names: &HashMap<String, String>) -> Result<Self> {
    Self::from_rules(self.rules.iter().map(|r| r.renamed(names).copy_structure()))
  }
}

/// Stack symbols are joined by the separator, so they can't contain it, and a
/// category carries at most one wildcard.
fn check_stack_text(c: &Category) -> Result<()> {
  let stack = c.stack();
  if stack.is_empty() {
    return Ok(());
  }

  let bad_char = stack
    .chars()
    .any(|ch| ch == '[' || ch == ']' || ch.is_whitespace());
  let wildcards = stack.matches(WILDCARD).count();
  let empty_symbol = stack
    .split(SEPARATOR)
    .any(|s| s.is_empty() || (s.contains(WILDCARD) && s.len() > 1 && !s.starts_with(WILDCARD)));

  if bad_char || wildcards > 1 || empty_symbol {
    Err(Error::Malformed(format!("bad stack annotation on {}", c)))
  } else {
    Ok(())
  }
}

impl fmt::Display for SchemaGrammar {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    for rule in self.rules.iter() {
      writeln!(f, "{}", rule)?;
    }
    Ok(())
  }
}

/// The wildcard-free rules reachable from the start category.
///
/// Built once per hypothesis by [`crate::compile::compile`], then only read,
/// except for rule removal while pruning or during incremental updates. Every
/// field is plain owned data, so a compiled grammar can be shared between
/// threads parsing different sentences.
#[derive(Debug, Clone)]
pub struct StaticGrammar {
  start: Category,
  gamma: RuleId,
  rules: Vec<Rule>,
  live: Vec<bool>,
  by_lhs: HashMap<Category, Vec<RuleId>>,
  expanded: HashSet<Category>,
  pos: HashSet<String>,
}

impl StaticGrammar {
  /// An empty grammar holding only the synthetic `gamma -> start` rule
  pub fn new(start: Category, gamma: &str, pos: HashSet<String>) -> Self {
    let mut g = Self {
      start: start.clone(),
      gamma: RuleId(0),
      rules: Vec::new(),
      live: Vec::new(),
      by_lhs: HashMap::new(),
      expanded: HashSet::new(),
      pos,
    };
    g.gamma = g.insert(Rule::new(Category::new(gamma), vec![start]));
    g
  }

  pub fn start(&self) -> &Category {
    &self.start
  }

  pub fn gamma_rule(&self) -> &Rule {
    &self.rules[self.gamma.index()]
  }

  pub fn parts_of_speech(&self) -> &HashSet<String> {
    &self.pos
  }

  /// Terminals are bare part-of-speech categories
  pub fn is_pos(&self, c: &Category) -> bool {
    c.is_stack_empty() && self.pos.contains(c.name())
  }

  pub fn is_nonterminal(&self, c: &Category) -> bool {
    !c.is_epsilon() && !self.is_pos(c)
  }

  /// Adds a rule, giving it the next sequence number of this grammar
  pub fn insert(&mut self, mut rule: Rule) -> RuleId {
    let id = RuleId(self.rules.len() as u32);
    rule.id = id;
    self.by_lhs.entry(rule.lhs.clone()).or_default().push(id);
    self.rules.push(rule);
    self.live.push(true);
    id
  }

  pub fn contains_production(&self, lhs: &Category, rhs: &[Category]) -> bool {
    self.rules_for(lhs).any(|r| r.rhs == rhs)
  }

  /// Takes a rule out of the grammar. The rule keeps its id and can be put
  /// back with [`StaticGrammar::restore`].
  pub fn remove(&mut self, id: RuleId) -> bool {
    if id == self.gamma || !self.is_live(id) {
      return false;
    }
    self.live[id.index()] = false;
    if let Some(ids) = self.by_lhs.get_mut(&self.rules[id.index()].lhs) {
      ids.retain(|other| *other != id);
    }
    true
  }

  pub fn restore(&mut self, id: RuleId) -> bool {
    if self.is_live(id) || id.index() >= self.rules.len() {
      return false;
    }
    self.live[id.index()] = true;
    let ids = self
      .by_lhs
      .entry(self.rules[id.index()].lhs.clone())
      .or_default();
    // keep insertion order so rule lookups stay deterministic
    let at = ids.binary_search(&id).unwrap_or_else(|at| at);
    ids.insert(at, id);
    true
  }

  /// Undoes the latest [`StaticGrammar::insert`], as if it never happened
  pub fn retract(&mut self, id: RuleId) {
    assert_eq!(
      id.index() + 1,
      self.rules.len(),
      "only the latest rule can be retracted"
    );
    self.remove(id);
    self.rules.pop();
    self.live.pop();
  }

  pub fn is_live(&self, id: RuleId) -> bool {
    self.live.get(id.index()).copied().unwrap_or(false)
  }

  /// Any rule ever inserted, live or removed
  pub fn rule(&self, id: RuleId) -> &Rule {
    &self.rules[id.index()]
  }

  /// Live rules, not counting the synthetic gamma rule
  pub fn rules(&self) -> impl Iterator<Item = &Rule> {
    self
      .rules
      .iter()
      .filter(move |r| r.id != self.gamma && self.live[r.id.index()])
  }

  pub fn len(&self) -> usize {
    self.rules().count()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  pub fn rules_for<'a>(&'a self, lhs: &Category) -> impl Iterator<Item = &'a Rule> + 'a {
    self
      .by_lhs
      .get(lhs)
      .into_iter()
      .flatten()
      .map(move |id| &self.rules[id.index()])
  }

  pub fn mark_expanded(&mut self, c: Category) {
    self.expanded.insert(c);
  }

  pub fn is_expanded(&self, c: &Category) -> bool {
    self.expanded.contains(c)
  }

  /// Left-hand categories with at least one live rule
  pub fn left_hand_sides(&self) -> BTreeSet<&Category> {
    self.rules().map(|r| &r.lhs).collect()
  }

  fn rule_is_nullable(nullables: &HashSet<Category>, rule: &Rule) -> bool {
    rule.is_epsilon() || rule.rhs.iter().all(|c| nullables.contains(c))
  }

  /// Categories that can derive the empty string
  pub fn nullables(&self) -> HashSet<Category> {
    let mut nullables: HashSet<Category> = HashSet::new();

    let mut last_length = 1;
    while last_length != nullables.len() {
      last_length = nullables.len();
      for r in self.rules() {
        if !nullables.contains(&r.lhs) && Self::rule_is_nullable(&nullables, r) {
          nullables.insert(r.lhs.clone());
        }
      }
    }

    nullables
  }

  /// Unit edges `A -> B`, including binary rules whose other child is nullable
  fn unit_graph(&self) -> HashMap<&Category, Vec<&Category>> {
    let nullables = self.nullables();
    let mut graph: HashMap<&Category, Vec<&Category>> = HashMap::new();

    for r in self.rules() {
      let edges = graph.entry(&r.lhs).or_default();
      if r.is_unary() {
        edges.push(&r.rhs[0]);
      } else if r.is_binary() {
        if nullables.contains(&r.rhs[1]) {
          edges.push(&r.rhs[0]);
        }
        if nullables.contains(&r.rhs[0]) {
          edges.push(&r.rhs[1]);
        }
      }
    }

    graph
  }

  /// True if some category can rewrite to itself without consuming input,
  /// which gives it infinitely many derivations.
  pub fn contains_cyclic_unit_production(&self) -> bool {
    #[derive(Clone, Copy, PartialEq)]
    enum Mark {
      Open,
      Done,
    }

    let graph = self.unit_graph();
    let mut marks: HashMap<&Category, Mark> = HashMap::new();

    let mut roots = graph.keys().copied().collect::<Vec<_>>();
    roots.sort();

    for root in roots {
      if marks.contains_key(root) {
        continue;
      }
      // iterative dfs, (node, next edge to try)
      let mut stack = vec![(root, 0)];
      marks.insert(root, Mark::Open);
      while let Some((node, edge)) = stack.pop() {
        let edges = graph.get(node).map(|v| v.as_slice()).unwrap_or(&[]);
        if edge == edges.len() {
          marks.insert(node, Mark::Done);
          continue;
        }
        stack.push((node, edge + 1));
        let next = edges[edge];
        match marks.get(next) {
          Some(Mark::Open) => return true,
          Some(Mark::Done) => {}
          None => {
            marks.insert(next, Mark::Open);
            stack.push((next, 0));
          }
        }
      }
    }

    false
  }

  /// Removes every live rule for which `keep` is false. Returns what was removed.
  pub fn prune<F>(&mut self, keep: F) -> Vec<RuleId>
  where
    F: Fn(&Rule) -> bool,
  {
    let doomed = self
      .rules()
      .filter(|r| !keep(r))
      .map(|r| r.id)
      .collect::<Vec<_>>();
    for id in doomed.iter() {
      self.remove(*id);
    }
    doomed
  }

  /// Removes rules that mention a nonterminal with no rules of its own, until
  /// nothing changes. Such rules can never complete.
  pub fn prune_unproductive(&mut self) -> Vec<RuleId> {
    let mut removed = Vec::new();
    loop {
      let lhs = self.left_hand_sides();
      let doomed = self
        .rules()
        .filter(|r| {
          r.rhs
            .iter()
            .any(|c| self.is_nonterminal(c) && !lhs.contains(c))
        })
        .map(|r| r.id)
        .collect::<Vec<_>>();
      if doomed.is_empty() {
        return removed;
      }
      for id in doomed {
        self.remove(id);
        removed.push(id);
      }
    }
  }
}

impl fmt::Display for StaticGrammar {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    writeln!(f, "# start: {}", self.start)?;
    let mut pos = self.pos.iter().collect::<Vec<_>>();
    pos.sort();
    write!(f, "# parts of speech:")?;
    for p in pos {
      write!(f, " {}", p)?;
    }
    writeln!(f)?;
    for rule in self.rules() {
      writeln!(f, "{}", rule)?;
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

  fn grammar(rules: &[(&str, &[&str])]) -> StaticGrammar {
    let pos = ["a", "b"].iter().map(|s| s.to_string()).collect();
    let mut g = StaticGrammar::new(cat("START"), "Gamma", pos);
    for (lhs, rhs) in rules {
      let rule = if rhs.is_empty() {
        Rule::epsilon(cat(lhs))
      } else {
        Rule::new(cat(lhs), rhs.iter().map(|c| cat(c)).collect())
      };
      g.insert(rule);
    }
    g
  }

  #[test]
  fn test_schema_insert_assigns_ids() {
    let mut g = SchemaGrammar::new();
    let a = g
      .insert(Rule::new(cat("S"), vec![cat("NP"), cat("VP")]))
      .unwrap();
    let b = g
      .insert(Rule::new(Category::with_stack("S", "*"), vec![cat("a")]))
      .unwrap();
    assert_eq!((a, b), (RuleId(0), RuleId(1)));
    assert_eq!(g.rules_for_base("S").count(), 2);
    assert_eq!(g.rules_for_base("NP").count(), 0);
  }

  #[test]
  fn test_schema_rejects_bad_stacks() {
    let mut g = SchemaGrammar::new();
    let bad = Rule::new(Category::with_stack("S", "*.*"), vec![cat("a")]);
    assert!(matches!(g.insert(bad), Err(Error::Malformed(_))));
    let bad = Rule::new(Category::with_stack("S", "NP..VP"), vec![cat("a")]);
    assert!(matches!(g.insert(bad), Err(Error::Malformed(_))));
    assert!(g.is_empty());
  }

  #[test]
  fn test_gamma_rule() {
    let g = grammar(&[("START", &["a"])]);
    assert_eq!(g.gamma_rule().to_string(), "Gamma -> START");
    assert_eq!(g.len(), 1);
    assert_eq!(g.rules().count(), 1);
  }

  #[test]
  fn test_remove_and_restore_keep_order() {
    let mut g = grammar(&[("A", &["a"]), ("A", &["b"]), ("A", &["a", "b"])]);
    let ids = g.rules_for(&cat("A")).map(|r| r.id).collect::<Vec<_>>();
    assert!(g.remove(ids[1]));
    assert!(!g.remove(ids[1]));
    assert_eq!(g.rules_for(&cat("A")).count(), 2);
    assert!(g.restore(ids[1]));
    assert_eq!(
      g.rules_for(&cat("A")).map(|r| r.id).collect::<Vec<_>>(),
      ids
    );
  }

  #[test]
  fn test_retract() {
    let mut g = grammar(&[("A", &["a"])]);
    let id = g.insert(Rule::new(cat("A"), vec![cat("b")]));
    g.retract(id);
    assert_eq!(g.rules_for(&cat("A")).count(), 1);
    assert_eq!(g.insert(Rule::new(cat("B"), vec![cat("b")])), id);
  }

  #[test]
  fn test_nullables() {
    let g = grammar(&[("A", &[]), ("B", &["A", "A"]), ("C", &["B", "a"])]);
    let n = g.nullables();
    assert!(n.contains(&cat("A")));
    assert!(n.contains(&cat("B")));
    assert!(!n.contains(&cat("C")));
  }

  #[test]
  fn test_direct_unit_cycle() {
    let g = grammar(&[("START", &["A"]), ("A", &["B"]), ("B", &["A"]), ("B", &["a"])]);
    assert!(g.contains_cyclic_unit_production());
  }

  #[test]
  fn test_nullable_mediated_cycle() {
    // A -> A N with N nullable is a unit cycle A -> A
    let g = grammar(&[("START", &["A"]), ("A", &["A", "N"]), ("A", &["a"]), ("N", &[])]);
    assert!(g.contains_cyclic_unit_production());
  }

  #[test]
  fn test_acyclic() {
    let g = grammar(&[
      ("START", &["A"]),
      ("A", &["B", "a"]),
      ("B", &["A", "b"]),
      ("A", &["a"]),
      ("B", &["b"]),
    ]);
    assert!(!g.contains_cyclic_unit_production());

    let g = grammar(&[("START", &["A", "A"]), ("A", &["a"])]);
    assert!(!g.contains_cyclic_unit_production());
  }

  #[test]
  fn test_left_hand_sides_and_pruning() {
    let mut g = grammar(&[("START", &["A", "B"]), ("START", &["A"]), ("A", &["a"])]);
    assert_eq!(g.left_hand_sides().len(), 2);

    let removed = g.prune_unproductive();
    assert_eq!(removed.len(), 1);
    assert_eq!(g.rules_for(&cat("START")).count(), 1);

    let removed = g.prune(|r| r.lhs != cat("A"));
    assert_eq!(removed.len(), 1);
    // START -> A now dangles
    assert_eq!(g.prune_unproductive().len(), 1);
    assert!(g.is_empty());
  }

  #[test]
  fn test_static_grammar_is_sync() {
    fn assert_send_sync<T: Send + Sync>() {}
    assert_send_sync::<StaticGrammar>();
  }
}
