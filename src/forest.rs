use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;

use crate::category::Category;
use crate::earley::{Chart, StateId};
use crate::grammar::StaticGrammar;
use crate::rules::RuleId;
use crate::syntree::{Constituent, SynTree, Word};
use crate::utils::combinations;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub u32);

impl NodeId {
  fn index(self) -> usize {
    self.0 as usize
  }
}

/// One way of building a node: the static rule used, the schema rule it was
/// compiled from, and the child nodes, one per non-empty right-hand category.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Packed {
  pub rule: RuleId,
  pub origin: Option<RuleId>,
  pub children: Vec<NodeId>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum NodeKind {
  /// A part of speech covering one position. Generated forests have no words.
  Leaf { word: Option<String> },
  /// The empty constituent
  Empty,
  /// A nonterminal, with every derivation of it over this span
  Branch(Vec<Packed>),
}

/// Every derivation of one category over one span
#[derive(Debug, Clone)]
pub struct ForestNode {
  pub category: Category,
  pub span: (usize, usize),
  pub kind: NodeKind,
}

impl ForestNode {
  pub fn alternatives(&self) -> &[Packed] {
    match &self.kind {
      NodeKind::Branch(alternatives) => alternatives,
      _ => &[],
    }
  }

  pub fn is_leaf(&self) -> bool {
    matches!(self.kind, NodeKind::Leaf { .. })
  }

  pub fn word(&self) -> Option<&str> {
    match &self.kind {
      NodeKind::Leaf { word } => word.as_deref(),
      _ => None,
    }
  }
}

/// Nodes are the same node if they cover the same span with the same category;
/// their alternatives aren't compared.
impl PartialEq for ForestNode {
  fn eq(&self, other: &Self) -> bool {
    self.category == other.category && self.span == other.span
  }
}

impl Eq for ForestNode {}

/// A shared packed forest: each (category, span) is one node, however many
/// trees go through it, so exponentially many trees fit in polynomial space.
#[derive(Debug, Clone, Default)]
pub struct Forest {
  nodes: Vec<ForestNode>,
  index: HashMap<(Category, usize, usize), NodeId>,
  roots: Vec<NodeId>,
}

impl Forest {
  /// Reads the forest out of a chart. The roots are the start-category
  /// children of the completed gamma states; a chart that didn't parse gives
  /// an empty forest.
  pub fn from_chart(chart: &Chart, g: &StaticGrammar) -> Self {
    let mut forest = Self::default();
    for id in chart.accepted(g) {
      let state = chart.state(id);
      let root = forest.build_node(chart, g, g.start(), state.origin, state.end);
      if !forest.roots.contains(&root) {
        forest.roots.push(root);
      }
    }
    forest
  }

  pub fn roots(&self) -> &[NodeId] {
    &self.roots
  }

  pub fn node(&self, id: NodeId) -> &ForestNode {
    &self.nodes[id.index()]
  }

  pub fn nodes(&self) -> impl Iterator<Item = (NodeId, &ForestNode)> {
    self
      .nodes
      .iter()
      .enumerate()
      .map(|(idx, n)| (NodeId(idx as u32), n))
  }

  pub fn find(&self, category: &Category, start: usize, end: usize) -> Option<NodeId> {
    self.index.get(&(category.clone(), start, end)).copied()
  }

  /// Number of nodes
  pub fn len(&self) -> usize {
    self.nodes.len()
  }

  /// True if nothing parsed
  pub fn is_empty(&self) -> bool {
    self.roots.is_empty()
  }

  fn build_node(
    &mut self,
    chart: &Chart,
    g: &StaticGrammar,
    category: &Category,
    start: usize,
    end: usize,
  ) -> NodeId {
    let key = (category.clone(), start, end);
    if let Some(id) = self.index.get(&key) {
      return *id;
    }

    // registered before the children are built, so a derivation cycle
    // points back at this node instead of recursing forever
    let id = NodeId(self.nodes.len() as u32);
    self.nodes.push(ForestNode {
      category: category.clone(),
      span: (start, end),
      kind: NodeKind::Branch(Vec::new()),
    });
    self.index.insert(key, id);

    let kind = if category.is_epsilon() {
      NodeKind::Empty
    } else if g.is_pos(category) {
      NodeKind::Leaf {
        word: chart.word(start).map(str::to_string),
      }
    } else {
      let mut alternatives = Vec::new();
      for state in chart.completed(category, start, end) {
        let rule = g.rule(chart.state(state).lr0.rule);
        for children in self.child_sequences(chart, g, state) {
          let packed = Packed {
            rule: rule.id,
            origin: rule.origin,
            children,
          };
          if !alternatives.contains(&packed) {
            alternatives.push(packed);
          }
        }
      }
      NodeKind::Branch(alternatives)
    };

    self.nodes[id.index()].kind = kind;
    id
  }

  /// Every distinct sequence of child nodes for the categories left of the dot
  fn child_sequences(
    &mut self,
    chart: &Chart,
    g: &StaticGrammar,
    state: StateId,
  ) -> Vec<Vec<NodeId>> {
    let (lr0, end) = {
      let s = chart.state(state);
      (s.lr0, s.end)
    };
    if lr0.pos == 0 {
      return vec![Vec::new()];
    }

    let category = &g.rule(lr0.rule).rhs[lr0.pos - 1];
    let mut sequences = Vec::new();
    for derivation in chart.state(state).derivations().to_vec() {
      let Some(predecessor) = derivation.predecessor else {
        continue;
      };
      let child = match derivation.reductor {
        Some(reductor) => {
          let r = chart.state(reductor);
          self.build_node(chart, g, category, r.origin, r.end)
        }
        // scanned, or stepped over epsilon
        None => {
          let from = chart.state(predecessor).end;
          self.build_node(chart, g, category, from, end)
        }
      };
      for mut seq in self.child_sequences(chart, g, predecessor) {
        seq.push(child);
        if !sequences.contains(&seq) {
          sequences.push(seq);
        }
      }
    }
    sequences
  }

  /// Number of distinct trees, saturating at `u128::MAX`
  pub fn count_trees(&self) -> u128 {
    let mut memo = HashMap::new();
    let mut open = HashSet::new();
    self
      .roots
      .iter()
      .fold(0u128, |acc, root| {
        acc.saturating_add(self.count_node(*root, &mut memo, &mut open))
      })
  }

  fn count_node(
    &self,
    id: NodeId,
    memo: &mut HashMap<NodeId, u128>,
    open: &mut HashSet<NodeId>,
  ) -> u128 {
    if let Some(n) = memo.get(&id) {
      return *n;
    }
    // a node reached again through its own descendants adds nothing new
    if !open.insert(id) {
      return 0;
    }

    let n = match &self.node(id).kind {
      NodeKind::Leaf { .. } | NodeKind::Empty => 1,
      NodeKind::Branch(alternatives) => alternatives.iter().fold(0u128, |acc, alt| {
        let product = alt.children.iter().fold(1u128, |p, child| {
          p.saturating_mul(self.count_node(*child, memo, open))
        });
        acc.saturating_add(product)
      }),
    };

    open.remove(&id);
    memo.insert(id, n);
    n
  }

  /// Number of trees no taller than `depth`, counting parts of speech and
  /// epsilon as height 0 and each rule application as one level.
  pub fn count_trees_within(&self, depth: usize) -> u128 {
    let mut memo = HashMap::new();
    self.roots.iter().fold(0u128, |acc, root| {
      acc.saturating_add(self.count_within(*root, depth, &mut memo))
    })
  }

  /// Like [`Forest::count_trees_within`], split by the length of the sentence
  /// each root covers. Mostly useful on generated forests, which have one root
  /// per length.
  pub fn counts_by_length_within(&self, depth: usize) -> BTreeMap<usize, u128> {
    let mut memo = HashMap::new();
    let mut counts = BTreeMap::new();
    for root in self.roots.iter() {
      let (start, end) = self.node(*root).span;
      let n = self.count_within(*root, depth, &mut memo);
      if n > 0 {
        let entry = counts.entry(end - start).or_insert(0u128);
        *entry = entry.saturating_add(n);
      }
    }
    counts
  }

  fn count_within(
    &self,
    id: NodeId,
    depth: usize,
    memo: &mut HashMap<(NodeId, usize), u128>,
  ) -> u128 {
    let node = self.node(id);
    let alternatives = match &node.kind {
      NodeKind::Leaf { .. } | NodeKind::Empty => return 1,
      NodeKind::Branch(_) if depth == 0 => return 0,
      NodeKind::Branch(alternatives) => alternatives,
    };
    if let Some(n) = memo.get(&(id, depth)) {
      return *n;
    }

    let n = alternatives.iter().fold(0u128, |acc, alt| {
      let product = alt.children.iter().fold(1u128, |p, child| {
        if p == 0 {
          0
        } else {
          p.saturating_mul(self.count_within(*child, depth - 1, memo))
        }
      });
      acc.saturating_add(product)
    });

    memo.insert((id, depth), n);
    n
  }

  /// How many packed alternatives reachable from the roots use each static
  /// rule. Rules missing from the map aren't used by any parse.
  pub fn rule_usage(&self) -> HashMap<RuleId, usize> {
    let mut usage = HashMap::new();
    for alt in self.reachable_alternatives() {
      *usage.entry(alt.rule).or_insert(0) += 1;
    }
    usage
  }

  /// Like [`Forest::rule_usage`], keyed by the schema rule each static rule
  /// was compiled from
  pub fn schema_usage(&self) -> HashMap<RuleId, usize> {
    let mut usage = HashMap::new();
    for alt in self.reachable_alternatives() {
      if let Some(origin) = alt.origin {
        *usage.entry(origin).or_insert(0) += 1;
      }
    }
    usage
  }

  fn reachable_alternatives(&self) -> Vec<&Packed> {
    let mut seen = HashSet::new();
    let mut stack = self.roots.clone();
    let mut alternatives = Vec::new();
    while let Some(id) = stack.pop() {
      if !seen.insert(id) {
        continue;
      }
      for alt in self.node(id).alternatives() {
        alternatives.push(alt);
        stack.extend(alt.children.iter().copied());
      }
    }
    alternatives
  }

  /// Every tree in the forest. Exponential in the ambiguity of the input, so
  /// prefer the counting methods when only the number matters.
  pub fn trees(&self) -> Vec<SynTree<Category, String>> {
    let mut open = HashSet::new();
    self
      .roots
      .iter()
      .flat_map(|root| self.make_trees(*root, &mut open))
      .collect()
  }

  fn make_trees(&self, id: NodeId, open: &mut HashSet<NodeId>) -> Vec<SynTree<Category, String>> {
    let node = self.node(id);
    let alternatives = match &node.kind {
      NodeKind::Empty => return Vec::new(),
      NodeKind::Leaf { word } => {
        let value = word.clone().unwrap_or_else(|| node.category.to_string());
        return vec![SynTree::Leaf(Word {
          value,
          span: node.span,
        })];
      }
      NodeKind::Branch(alternatives) => alternatives,
    };
    if !open.insert(id) {
      return Vec::new();
    }

    let mut trees = Vec::new();
    for alt in alternatives {
      // empty constituents don't show up as children
      let child_sets = alt
        .children
        .iter()
        .filter(|child| self.node(**child).kind != NodeKind::Empty)
        .map(|child| self.make_trees(*child, open))
        .collect::<Vec<_>>();

      let cons = Constituent {
        value: node.category.clone(),
        span: node.span,
      };
      if child_sets.is_empty() {
        trees.push(SynTree::Branch(cons, Vec::new()));
      } else {
        trees.extend(
          combinations(&child_sets)
            .into_iter()
            .map(|children| SynTree::Branch(cons.clone(), children)),
        );
      }
    }

    open.remove(&id);
    trees
  }
}

impl fmt::Display for Forest {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let mut order = (0..self.nodes.len()).collect::<Vec<_>>();
    order.sort_by(|a, b| {
      let (a, b) = (&self.nodes[*a], &self.nodes[*b]);
      (a.span, &a.category).cmp(&(b.span, &b.category))
    });

    for idx in order {
      let node = &self.nodes[idx];
      let root = if self.roots.contains(&NodeId(idx as u32)) {
        " (root)"
      } else {
        ""
      };
      writeln!(f, "{}..{}: {}{}", node.span.0, node.span.1, node.category, root)?;
      for alt in node.alternatives() {
        write!(f, "  {} =>", alt.rule)?;
        for child in alt.children.iter() {
          let child = self.node(*child);
          write!(f, " {}[{}..{}]", child.category, child.span.0, child.span.1)?;
        }
        writeln!(f)?;
      }
    }
    Ok(())
  }
}
