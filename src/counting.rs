use std::collections::{BTreeMap, HashMap};

use tracing::debug;

use crate::category::Category;
use crate::grammar::StaticGrammar;
use crate::rules::{Rule, RuleId};

/// Derivations per sentence length
pub type Counts = BTreeMap<usize, u128>;

#[derive(Debug, Clone)]
struct Entry {
  counts: Counts,
  /// Some derivation was cut off by the depth bound
  truncated: bool,
  /// Tallest derivation that was counted
  height: usize,
}

impl Entry {
  fn leaf(len: usize) -> Self {
    Self {
      counts: Counts::from([(len, 1)]),
      truncated: false,
      height: 0,
    }
  }

  /// True if this entry holds exactly the counts for `depth`
  fn answers(&self, depth: usize) -> bool {
    !self.truncated && self.height <= depth
  }
}

/// Counts the derivations of a compiled grammar by sentence length, with no
/// derivation taller than a depth bound. Parts of speech and epsilon are height
/// 0, and each rule application adds one.
///
/// Results are cached per (category, depth) and (rule, depth). A result
/// computed for another depth is reused when nothing was cut off by its bound
/// and its tallest derivation fits the one asked for, in which case the two
/// counts are the same. The cache belongs to one counter and so to one grammar.
#[derive(Debug)]
pub struct Counter<'g> {
  g: &'g StaticGrammar,
  max_length: Option<usize>,
  categories: HashMap<Category, BTreeMap<usize, Entry>>,
  rules: HashMap<RuleId, BTreeMap<usize, Entry>>,
  hits: usize,
}

impl<'g> Counter<'g> {
  pub fn new(g: &'g StaticGrammar) -> Self {
    Self {
      g,
      max_length: None,
      categories: HashMap::new(),
      rules: HashMap::new(),
      hits: 0,
    }
  }

  /// Ignores sentences longer than `max_length`, which keeps the maps small
  pub fn with_max_length(mut self, max_length: usize) -> Self {
    self.max_length = Some(max_length);
    self
  }

  /// How many queries were answered from the cache
  pub fn hits(&self) -> usize {
    self.hits
  }

  /// Derivations of the start category
  pub fn count_start(&mut self, depth: usize) -> Counts {
    let start = self.g.start().clone();
    let counts = self.count(&start, depth);
    debug!(
      depth,
      lengths = counts.len(),
      cached = self.categories.len() + self.rules.len(),
      hits = self.hits,
      "counted derivations"
    );
    counts
  }

  pub fn count(&mut self, category: &Category, depth: usize) -> Counts {
    self.category_entry(category, depth).counts
  }

  pub fn count_rule(&mut self, rule: RuleId, depth: usize) -> Counts {
    self.rule_entry(rule, depth).counts
  }

  fn cached(cache: &BTreeMap<usize, Entry>, depth: usize) -> Option<&Entry> {
    cache
      .get(&depth)
      .or_else(|| cache.values().find(|e| e.answers(depth)))
  }

  fn category_entry(&mut self, category: &Category, depth: usize) -> Entry {
    if category.is_epsilon() {
      return Entry::leaf(0);
    }
    if self.g.is_pos(category) {
      return Entry::leaf(1);
    }
    if let Some(entry) = self
      .categories
      .get(category)
      .and_then(|cache| Self::cached(cache, depth))
    {
      self.hits += 1;
      return entry.clone();
    }

    let g = self.g;
    let entry = if depth == 0 {
      Entry {
        counts: Counts::new(),
        truncated: g.rules_for(category).next().is_some(),
        height: 0,
      }
    } else {
      let mut total = Entry {
        counts: Counts::new(),
        truncated: false,
        height: 0,
      };
      for rule in g.rules_for(category) {
        let entry = self.rule_entry(rule.id, depth);
        merge(&mut total.counts, &entry.counts);
        total.truncated |= entry.truncated;
        if !entry.counts.is_empty() {
          total.height = total.height.max(entry.height);
        }
      }
      total
    };

    self
      .categories
      .entry(category.clone())
      .or_default()
      .insert(depth, entry.clone());
    entry
  }

  fn rule_entry(&mut self, id: RuleId, depth: usize) -> Entry {
    if let Some(entry) = self.rules.get(&id).and_then(|cache| Self::cached(cache, depth)) {
      self.hits += 1;
      return entry.clone();
    }

    let g = self.g;
    let rule: &Rule = g.rule(id);
    let entry = if depth == 0 {
      Entry {
        counts: Counts::new(),
        truncated: true,
        height: 0,
      }
    } else {
      let mut counts = Counts::from([(0, 1)]);
      let mut truncated = false;
      let mut height = 0;
      for child in rule.rhs.iter() {
        let entry = self.category_entry(child, depth - 1);
        counts = self.product(&counts, &entry.counts);
        truncated |= entry.truncated;
        height = height.max(entry.height);
      }
      Entry {
        counts,
        truncated,
        height: height + 1,
      }
    };

    self.rules.entry(id).or_default().insert(depth, entry.clone());
    entry
  }

  /// Lengths add, counts multiply
  fn product(&self, left: &Counts, right: &Counts) -> Counts {
    let mut out = Counts::new();
    for (l_len, l_count) in left.iter() {
      for (r_len, r_count) in right.iter() {
        let len = l_len + r_len;
        if self.max_length.is_some_and(|max| len > max) {
          continue;
        }
        let slot = out.entry(len).or_insert(0u128);
        *slot = slot.saturating_add(l_count.saturating_mul(*r_count));
      }
    }
    out
  }
}

fn merge(into: &mut Counts, from: &Counts) {
  for (len, n) in from.iter() {
    let slot = into.entry(*len).or_insert(0u128);
    *slot = slot.saturating_add(*n);
  }
}

/// Derivations of the start category per length, no taller than `depth`
pub fn count_derivations(g: &StaticGrammar, depth: usize, max_length: Option<usize>) -> Counts {
  let mut counter = Counter::new(g);
  if let Some(max) = max_length {
    counter = counter.with_max_length(max);
  }
  counter.count_start(depth)
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::compile::compile;
  use crate::config::Config;
  use crate::earley::generate_chart;
  use crate::forest::Forest;
  use crate::grammar::SchemaGrammar;
  use proptest::prelude::*;
  use std::collections::HashSet;

  fn grammar(src: &str, pos: &[&str]) -> StaticGrammar {
    let schema: SchemaGrammar = src.parse().unwrap();
    let pos: HashSet<String> = pos.iter().map(|s| s.to_string()).collect();
    compile(&schema, &pos, &Config::default()).unwrap()
  }

  fn counts(pairs: &[(usize, u128)]) -> Counts {
    pairs.iter().copied().collect()
  }

  #[test]
  fn test_binary_recursion() {
    let g = grammar("START -> S\nS -> S S\nS -> x", &["x"]);
    let mut counter = Counter::new(&g);
    let s = Category::new("S");
    assert_eq!(counter.count(&s, 0), counts(&[]));
    assert_eq!(counter.count(&s, 1), counts(&[(1, 1)]));
    assert_eq!(counter.count(&s, 2), counts(&[(1, 1), (2, 1)]));
    assert_eq!(
      counter.count(&s, 3),
      counts(&[(1, 1), (2, 1), (3, 2), (4, 1)])
    );
    // the start rule adds a level
    assert_eq!(counter.count_start(3), counts(&[(1, 1), (2, 1)]));
  }

  #[test]
  fn test_terminals_and_epsilon() {
    let g = grammar(
      "START -> A B
       A -> a
       A -> a a
       B ->
       B -> b",
      &["a", "b"],
    );
    let mut counter = Counter::new(&g);
    assert_eq!(counter.count(&Category::new("a"), 0), counts(&[(1, 1)]));
    assert_eq!(counter.count(&Category::new("B"), 1), counts(&[(0, 1), (1, 1)]));
    assert_eq!(
      counter.count_start(2),
      counts(&[(1, 1), (2, 2), (3, 1)])
    );
  }

  #[test]
  fn test_max_length() {
    let g = grammar("START -> S\nS -> S S\nS -> x", &["x"]);
    let all = count_derivations(&g, 5, None);
    let capped = count_derivations(&g, 5, Some(3));
    assert!(all.keys().any(|len| *len > 3));
    assert!(capped.keys().all(|len| *len <= 3));
    for (len, n) in capped.iter() {
      assert_eq!(all[len], *n);
    }
  }

  #[test]
  fn test_deep_cache_reused_only_when_exact() {
    let g = grammar("START -> S\nS -> S S\nS -> x", &["x"]);
    let mut warm = Counter::new(&g);
    warm.count_start(6);
    for depth in 0..6 {
      assert_eq!(warm.count_start(depth), count_derivations(&g, depth, None), "depth {}", depth);
    }

    // a finite grammar is never cut off, so one deep count answers everything
    let g = grammar("START -> NP VP\nNP -> d n\nVP -> v NP", &["d", "n", "v"]);
    let mut counter = Counter::new(&g);
    assert_eq!(counter.count_start(10), counts(&[(5, 1)]));
    let hits = counter.hits();
    assert_eq!(counter.count_start(3), counts(&[(5, 1)]));
    assert_eq!(counter.hits(), hits + 1);
    assert_eq!(counter.count_start(2), counts(&[]));
  }

  #[test]
  fn test_saturates() {
    let g = grammar("START -> S\nS -> S S\nS -> x\nS -> y\nS -> z", &["x", "y", "z"]);
    // 256 words from three parts of speech is more than 3^81 ways
    let counts = count_derivations(&g, 10, None);
    assert_eq!(counts.keys().last(), Some(&256));
    assert_eq!(counts[&256], u128::MAX);
    assert_eq!(counts[&1], 3);
  }

  proptest! {
    #[test]
    fn counts_match_generated_forest(depth in 1usize..6) {
      let g = grammar(
        "START -> S
         START -> S T
         S -> S T
         S -> x
         T -> y
         T -> T S",
        &["x", "y"],
      );
      let chart = generate_chart(&g, 6, &Config::default()).unwrap();
      let forest = Forest::from_chart(&chart, &g);
      let expected = forest.counts_by_length_within(depth);
      let counted = count_derivations(&g, depth, Some(6));
      prop_assert_eq!(counted, expected);
    }
  }
}
