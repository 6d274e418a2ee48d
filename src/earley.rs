use std::cmp::Reverse;
use std::collections::{BTreeSet, BinaryHeap, HashMap, HashSet, VecDeque};
use std::fmt;

use tracing::{debug, trace, warn};

use crate::category::Category;
use crate::config::Config;
use crate::grammar::StaticGrammar;
use crate::rules::RuleId;
use crate::utils::{CancelFlag, Error, Result};
use crate::vocabulary::Vocabulary;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LR0 {
  pub rule: RuleId,
  pub pos: usize,
}

impl LR0 {
  pub fn new(rule: RuleId) -> Self {
    Self { rule, pos: 0 }
  }

  pub fn is_active(&self, g: &StaticGrammar) -> bool {
    self.pos < g.rule(self.rule).len()
  }

  pub fn advance(&self) -> Self {
    Self {
      rule: self.rule,
      pos: self.pos + 1,
    }
  }

  pub fn next_category<'g>(&self, g: &'g StaticGrammar) -> Option<&'g Category> {
    g.rule(self.rule).rhs.get(self.pos)
  }

  pub fn display<'a>(&self, g: &'a StaticGrammar) -> LR0Display<'a> {
    LR0Display { lr0: *self, g }
  }
}

pub struct LR0Display<'a> {
  lr0: LR0,
  g: &'a StaticGrammar,
}

impl fmt::Display for LR0Display<'_> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let rule = self.g.rule(self.lr0.rule);
    write!(f, "{} →", rule.lhs)?;
    for idx in 0..rule.len() {
      if idx == self.lr0.pos {
        write!(f, " ・")?;
      }
      write!(f, " {}", rule.rhs[idx])?;
    }
    if self.lr0.pos >= rule.len() {
      write!(f, " ・")?;
    }
    Ok(())
  }
}

/// Handle of a state in the chart's arena
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StateId(pub u32);

impl StateId {
  fn index(self) -> usize {
    self.0 as usize
  }
}

/// One way a state was produced: advancing `predecessor` over the completed
/// `reductor`. A scan or an epsilon step has no reductor, a prediction has
/// neither.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Derivation {
  pub predecessor: Option<StateId>,
  pub reductor: Option<StateId>,
}

impl Derivation {
  pub const PREDICTED: Derivation = Derivation {
    predecessor: None,
    reductor: None,
  };

  fn links(&self) -> impl Iterator<Item = StateId> {
    self.predecessor.into_iter().chain(self.reductor)
  }
}

/// A dotted rule spanning `origin..end`. A state with several derivations is
/// ambiguous; the derivations are its packed alternatives.
#[derive(Debug, Clone, PartialEq)]
pub struct State {
  pub lr0: LR0,
  pub origin: usize,
  pub end: usize,
  derivations: Vec<Derivation>,
  /// States with a derivation that goes through this one
  parents: Vec<StateId>,
  removed: bool,
}

impl State {
  pub fn derivations(&self) -> &[Derivation] {
    &self.derivations
  }

  pub fn is_removed(&self) -> bool {
    self.removed
  }
}

/// States ending at one input position, with the lookups the parser needs
#[derive(Debug, Clone, Default, PartialEq)]
struct Column {
  states: Vec<StateId>,
  lookup: HashMap<(LR0, usize), StateId>,
  /// Active states ending here, by the category after the dot
  expecting: HashMap<Category, Vec<StateId>>,
  /// Completed states *starting* here, by left-hand category
  reductors: HashMap<Category, Vec<StateId>>,
  predicted: HashSet<Category>,
}

/// Work waiting in one column. Completed states come out first, latest origin
/// first and FIFO among equal origins, then predictions and scans in order.
#[derive(Debug, Default)]
struct Agenda {
  completed: BinaryHeap<(usize, Reverse<u64>, StateId)>,
  active: VecDeque<StateId>,
  seq: u64,
}

impl Agenda {
  fn push_completed(&mut self, origin: usize, id: StateId) {
    self.seq += 1;
    self.completed.push((origin, Reverse(self.seq), id));
  }

  fn push_active(&mut self, id: StateId) {
    self.active.push_back(id);
  }

  fn pop(&mut self) -> Option<StateId> {
    match self.completed.pop() {
      Some((_, _, id)) => Some(id),
      None => self.active.pop_front(),
    }
  }

  fn clear(&mut self) {
    self.completed.clear();
    self.active.clear();
  }
}

/// How many columns a chart has and which of them can end a sentence
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnLayout {
  /// A sentence of this many tokens; only the last column is final
  Sentence(usize),
  /// Every length up to this bound; every column is final
  Open(usize),
}

impl ColumnLayout {
  fn columns(&self) -> usize {
    match self {
      Self::Sentence(n) | Self::Open(n) => n + 1,
    }
  }

  fn is_final(&self, k: usize) -> bool {
    match self {
      Self::Sentence(n) => k == *n,
      Self::Open(n) => k <= *n,
    }
  }
}

/// A sentence position, with the parts of speech the vocabulary allows there
#[derive(Debug, Clone, PartialEq)]
pub struct Token {
  pub word: String,
  pub categories: Vec<Category>,
}

/// Which part of speech may be scanned at a position
#[derive(Debug, Clone, PartialEq)]
pub enum CategorySource {
  /// Only the parts of speech of the word at that position
  Lexicon(Vec<Token>),
  /// Any part of speech, used when generating
  AnyPos,
}

impl CategorySource {
  fn allows(&self, k: usize, c: &Category) -> bool {
    match self {
      Self::Lexicon(tokens) => tokens
        .get(k)
        .map(|t| t.categories.contains(c))
        .unwrap_or(false),
      Self::AnyPos => true,
    }
  }
}

/// Everything needed to put the chart back the way it was when a transaction
/// started, recorded as the chart changes.
#[derive(Debug)]
enum Undo {
  Lookup { column: usize, key: (LR0, usize) },
  Unlookup { column: usize, key: (LR0, usize), id: StateId },
  Expecting { column: usize, category: Category },
  Unexpecting { column: usize, category: Category, at: usize, id: StateId },
  Reductor { column: usize, category: Category },
  Unreductor { column: usize, category: Category, at: usize, id: StateId },
  Predicted { column: usize, category: Category },
  Unpredicted { column: usize, category: Category },
  ColumnState { column: usize },
  ByRule { rule: RuleId },
  Derivation { state: StateId },
  Underivation { state: StateId, at: usize, derivation: Derivation },
  Parent { state: StateId },
  Removed { state: StateId },
}

#[derive(Debug)]
struct Journal {
  states: usize,
  entries: Vec<Undo>,
}

/// An Earley chart over a compiled grammar.
///
/// States live in an arena and point at each other by [`StateId`], so the
/// predecessor/reductor/parent graph has no ownership cycles. The chart can be
/// updated in place when a rule is added to or removed from the grammar, and
/// those updates can be grouped in a transaction that is accepted or rolled
/// back.
#[derive(Debug)]
pub struct Chart {
  states: Vec<State>,
  columns: Vec<Column>,
  agendas: Vec<Agenda>,
  by_rule: HashMap<RuleId, Vec<StateId>>,
  layout: ColumnLayout,
  source: CategorySource,
  limit: usize,
  work: usize,
  cancel: Option<CancelFlag>,
  journal: Option<Journal>,
}

impl PartialEq for Chart {
  fn eq(&self, other: &Self) -> bool {
    self.states == other.states
      && self.columns == other.columns
      && self.by_rule == other.by_rule
      && self.layout == other.layout
      && self.source == other.source
  }
}

impl Chart {
  pub fn new(layout: ColumnLayout, source: CategorySource, config: &Config) -> Self {
    let columns = layout.columns();
    Self {
      states: Vec::new(),
      columns: vec![Column::default(); columns],
      agendas: (0..columns).map(|_| Agenda::default()).collect(),
      by_rule: HashMap::new(),
      layout,
      source,
      limit: config.max_states_per_column,
      work: 0,
      cancel: None,
      journal: None,
    }
  }

  /// A chart for one sentence, scanning the parts of speech the vocabulary gives
  pub fn for_sentence(tokens: &[&str], vocabulary: &Vocabulary, config: &Config) -> Self {
    let tokens = tokens
      .iter()
      .map(|w| {
        if !vocabulary.contains(w) {
          debug!(word = %w, "word not in vocabulary");
        }
        Token {
          word: w.to_string(),
          categories: vocabulary.categories(w).to_vec(),
        }
      })
      .collect::<Vec<_>>();
    Self::new(
      ColumnLayout::Sentence(tokens.len()),
      CategorySource::Lexicon(tokens),
      config,
    )
  }

  /// A chart deriving every sentence of up to `max_length` parts of speech
  pub fn for_generation(max_length: usize, config: &Config) -> Self {
    Self::new(ColumnLayout::Open(max_length), CategorySource::AnyPos, config)
  }

  pub fn with_cancel(mut self, flag: CancelFlag) -> Self {
    self.cancel = Some(flag);
    self
  }

  /// Seeds the chart with `gamma -> ・start` and runs it to completion
  pub fn build(&mut self, g: &StaticGrammar) -> Result<()> {
    assert!(self.states.is_empty(), "chart was already built");
    self.add_state(g, LR0::new(g.gamma_rule().id), 0, 0, Derivation::PREDICTED);
    let result = self.run(g, 0);

    debug!(
      columns = self.len(),
      states = self.states.len(),
      parsed = self.is_parsed(g),
      "built chart"
    );
    result
  }

  pub fn len(&self) -> usize {
    self.columns.len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  pub fn layout(&self) -> ColumnLayout {
    self.layout
  }

  pub fn state(&self, id: StateId) -> &State {
    &self.states[id.index()]
  }

  /// The word scanned at position `k`, if this chart parses a sentence
  pub fn word(&self, k: usize) -> Option<&str> {
    match &self.source {
      CategorySource::Lexicon(tokens) => tokens.get(k).map(|t| t.word.as_str()),
      CategorySource::AnyPos => None,
    }
  }

  pub fn final_columns(&self) -> impl Iterator<Item = usize> + '_ {
    (0..self.len()).filter(move |k| self.layout.is_final(*k))
  }

  /// Completed, live states of `lhs` spanning `origin..end`
  pub fn completed(&self, lhs: &Category, origin: usize, end: usize) -> Vec<StateId> {
    self.columns[origin]
      .reductors
      .get(lhs)
      .into_iter()
      .flatten()
      .copied()
      .filter(|id| self.state(*id).end == end)
      .collect()
  }

  /// Completed gamma states at final columns: one per successful parse length
  pub fn accepted(&self, g: &StaticGrammar) -> Vec<StateId> {
    let gamma = &g.gamma_rule().lhs;
    self
      .final_columns()
      .flat_map(|k| self.completed(gamma, 0, k))
      .collect()
  }

  pub fn is_parsed(&self, g: &StaticGrammar) -> bool {
    !self.accepted(g).is_empty()
  }

  /// (rule, dot, origin, end) of every live state, sorted
  pub fn live_states(&self) -> Vec<(RuleId, usize, usize, usize)> {
    let mut v = self
      .states
      .iter()
      .filter(|s| !s.removed)
      .map(|s| (s.lr0.rule, s.lr0.pos, s.origin, s.end))
      .collect::<Vec<_>>();
    v.sort();
    v
  }

  pub fn display<'a>(&'a self, g: &'a StaticGrammar) -> ChartDisplay<'a> {
    ChartDisplay { chart: self, g }
  }

  fn run(&mut self, g: &StaticGrammar, from: usize) -> Result<()> {
    for k in from..self.len() {
      if self.cancel.as_ref().is_some_and(|c| c.is_cancelled()) {
        self.clear_agendas();
        return Err(Error::Cancelled);
      }

      self.work = 0;
      while let Some(id) = self.agendas[k].pop() {
        if self.state(id).removed {
          continue;
        }
        self.work += 1;
        self.process(g, id, k);

        if self.work > self.limit {
          warn!(column = k, limit = self.limit, "abandoning runaway parse");
          self.clear_agendas();
          return Err(Error::UnboundedDerivation {
            column: k,
            limit: self.limit,
          });
        }
      }
      trace!(column = k, work = self.work, "column done");
    }
    Ok(())
  }

  fn clear_agendas(&mut self) {
    for agenda in self.agendas.iter_mut() {
      agenda.clear();
    }
  }

  fn process(&mut self, g: &StaticGrammar, id: StateId, k: usize) {
    let (lr0, origin) = {
      let state = self.state(id);
      (state.lr0, state.origin)
    };

    match lr0.next_category(g) {
      None => self.completer(g, id, k),
      Some(c) if c.is_epsilon() => {
        let derivation = Derivation {
          predecessor: Some(id),
          reductor: None,
        };
        self.add_state(g, lr0.advance(), origin, k, derivation);
      }
      Some(c) if g.is_pos(c) => self.scanner(g, id, k, c),
      Some(c) => self.predictor(g, id, k, c),
    }
  }

  fn completer(&mut self, g: &StaticGrammar, id: StateId, k: usize) {
    let (lr0, origin) = {
      let state = self.state(id);
      (state.lr0, state.origin)
    };
    assert!(!lr0.is_active(g), "tried to complete active state");

    // advance everything at the origin that was waiting for this category
    let lhs = &g.rule(lr0.rule).lhs;
    let waiting = self.columns[origin]
      .expecting
      .get(lhs)
      .cloned()
      .unwrap_or_default();
    for other in waiting {
      let (other_lr0, other_origin) = {
        let state = self.state(other);
        (state.lr0, state.origin)
      };
      let derivation = Derivation {
        predecessor: Some(other),
        reductor: Some(id),
      };
      self.add_state(g, other_lr0.advance(), other_origin, k, derivation);
    }
  }

  fn predictor(&mut self, g: &StaticGrammar, id: StateId, k: usize, needed: &Category) {
    if !self.columns[k].predicted.contains(needed) {
      self.columns[k].predicted.insert(needed.clone());
      self.log(Undo::Predicted {
        column: k,
        category: needed.clone(),
      });
      for rule in g.rules_for(needed) {
        self.add_state(g, LR0::new(rule.id), k, k, Derivation::PREDICTED);
      }
    }

    // constituents that already completed from here, either nullable ones or
    // ones found before this state existed, still have to advance it
    let (lr0, origin) = {
      let state = self.state(id);
      (state.lr0, state.origin)
    };
    let done = self.columns[k]
      .reductors
      .get(needed)
      .cloned()
      .unwrap_or_default();
    for reductor in done {
      let end = self.state(reductor).end;
      let derivation = Derivation {
        predecessor: Some(id),
        reductor: Some(reductor),
      };
      self.add_state(g, lr0.advance(), origin, end, derivation);
    }
  }

  fn scanner(&mut self, g: &StaticGrammar, id: StateId, k: usize, needed: &Category) {
    if k + 1 < self.len() && self.source.allows(k, needed) {
      let (lr0, origin) = {
        let state = self.state(id);
        (state.lr0, state.origin)
      };
      let derivation = Derivation {
        predecessor: Some(id),
        reductor: None,
      };
      self.add_state(g, lr0.advance(), origin, k + 1, derivation);
    }
  }

  /// Adds a state, or packs a new derivation into the existing one
  fn add_state(
    &mut self,
    g: &StaticGrammar,
    lr0: LR0,
    origin: usize,
    end: usize,
    derivation: Derivation,
  ) -> StateId {
    self.work += 1;

    if let Some(&id) = self.columns[end].lookup.get(&(lr0, origin)) {
      if !self.state(id).derivations.contains(&derivation) {
        self.states[id.index()].derivations.push(derivation);
        self.log(Undo::Derivation { state: id });
        self.link_parents(id, derivation);
      }
      return id;
    }

    let id = StateId(self.states.len() as u32);
    self.states.push(State {
      lr0,
      origin,
      end,
      derivations: vec![derivation],
      parents: Vec::new(),
      removed: false,
    });
    self.link_parents(id, derivation);

    self.columns[end].lookup.insert((lr0, origin), id);
    self.log(Undo::Lookup {
      column: end,
      key: (lr0, origin),
    });
    self.columns[end].states.push(id);
    self.log(Undo::ColumnState { column: end });
    self.by_rule.entry(lr0.rule).or_default().push(id);
    self.log(Undo::ByRule { rule: lr0.rule });

    match lr0.next_category(g) {
      None => {
        let lhs = g.rule(lr0.rule).lhs.clone();
        self.columns[origin]
          .reductors
          .entry(lhs.clone())
          .or_default()
          .push(id);
        self.log(Undo::Reductor {
          column: origin,
          category: lhs,
        });
        self.agendas[end].push_completed(origin, id);
      }
      Some(c) => {
        if !c.is_epsilon() {
          self.columns[end]
            .expecting
            .entry(c.clone())
            .or_default()
            .push(id);
          self.log(Undo::Expecting {
            column: end,
            category: c.clone(),
          });
        }
        self.agendas[end].push_active(id);
      }
    }

    id
  }

  fn link_parents(&mut self, id: StateId, derivation: Derivation) {
    for link in derivation.links() {
      self.states[link.index()].parents.push(id);
      self.log(Undo::Parent { state: link });
    }
  }

  fn log(&mut self, undo: Undo) {
    if let Some(journal) = self.journal.as_mut() {
      journal.entries.push(undo);
    }
  }

  /// Adds the states a newly inserted rule gives rise to. The rule must
  /// already be live in `g`.
  ///
  /// This runs the parser again and can fail like a fresh parse, leaving the
  /// chart half built, so it only happens inside a transaction that the
  /// caller rejects on error.
  pub fn insert_rule(&mut self, g: &StaticGrammar, rule: RuleId) -> Result<()> {
    assert!(self.in_transaction(), "rule inserted outside a transaction");
    assert!(g.is_live(rule), "inserting a rule the grammar doesn't have");
    let lhs = g.rule(rule).lhs.clone();

    let mut first = None;
    for k in 0..self.len() {
      if self.columns[k].predicted.contains(&lhs) {
        self.add_state(g, LR0::new(rule), k, k, Derivation::PREDICTED);
        first.get_or_insert(k);
      }
    }

    match first {
      Some(k) => self.run(g, k),
      None => Ok(()),
    }
  }

  /// Deletes every state built on `rule`, everything derived only from those,
  /// and predictions nothing is waiting for anymore. Outside a transaction the
  /// deleted states are reclaimed straight away, which renumbers the rest.
  pub fn remove_rule(&mut self, g: &StaticGrammar, rule: RuleId) {
    let doomed = self.by_rule.get(&rule).cloned().unwrap_or_default();
    let mut review = BTreeSet::new();
    for id in doomed {
      self.mark_deleted(g, id, &mut review);
    }

    // deletions only cascade rightwards, so one pass in column order settles it
    while let Some(k) = review.pop_first() {
      self.unpredict(g, k, &mut review);
    }

    if !self.in_transaction() {
      self.compact();
    }
  }

  /// Flags a state removed, and any state left without a derivation because
  /// of it. Columns that lose an expectation are queued for review.
  fn mark_deleted(&mut self, g: &StaticGrammar, root: StateId, review: &mut BTreeSet<usize>) {
    let mut work = vec![root];
    while let Some(id) = work.pop() {
      if self.state(id).removed {
        continue;
      }
      self.states[id.index()].removed = true;
      self.log(Undo::Removed { state: id });
      self.unindex(g, id, review);

      let parents = self.state(id).parents.clone();
      for parent in parents {
        if self.state(parent).removed {
          continue;
        }
        for at in (0..self.state(parent).derivations.len()).rev() {
          let derivation = self.state(parent).derivations[at];
          if derivation.links().any(|link| link == id) {
            self.states[parent.index()].derivations.remove(at);
            self.log(Undo::Underivation {
              state: parent,
              at,
              derivation,
            });
          }
        }
        if self.state(parent).derivations.is_empty() {
          work.push(parent);
        }
      }
    }
  }

  fn unindex(&mut self, g: &StaticGrammar, id: StateId, review: &mut BTreeSet<usize>) {
    let (lr0, origin, end) = {
      let state = self.state(id);
      (state.lr0, state.origin, state.end)
    };

    let removed = self.columns[end].lookup.remove(&(lr0, origin));
    assert_eq!(removed, Some(id), "chart lookup out of sync");
    self.log(Undo::Unlookup {
      column: end,
      key: (lr0, origin),
      id,
    });

    match lr0.next_category(g) {
      None => {
        let lhs = g.rule(lr0.rule).lhs.clone();
        let at = remove_from_index(&mut self.columns[origin].reductors, &lhs, id);
        self.log(Undo::Unreductor {
          column: origin,
          category: lhs,
          at,
          id,
        });
      }
      Some(c) if !c.is_epsilon() => {
        let at = remove_from_index(&mut self.columns[end].expecting, c, id);
        self.log(Undo::Unexpecting {
          column: end,
          category: c.clone(),
          at,
          id,
        });
        if g.is_nonterminal(c) {
          review.insert(end);
        }
      }
      Some(_) => {}
    }
  }

  /// Drops predictions at column `k` that no surviving state asks for.
  ///
  /// A category is still wanted if a state reaching into `k` from an earlier
  /// column expects it, or if a state predicted at `k` for a wanted category
  /// expects it.
  fn unpredict(&mut self, g: &StaticGrammar, k: usize, review: &mut BTreeSet<usize>) {
    let gamma = g.gamma_rule().id;
    let mut wanted: HashSet<Category> = HashSet::new();
    let mut frontier = Vec::new();
    let mut local: HashMap<Category, Vec<StateId>> = HashMap::new();

    for &id in self.columns[k].states.iter() {
      let state = self.state(id);
      if state.removed {
        continue;
      }
      if state.origin < k || state.lr0.rule == gamma {
        if let Some(c) = state.lr0.next_category(g) {
          if g.is_nonterminal(c) && wanted.insert(c.clone()) {
            frontier.push(c.clone());
          }
        }
      } else {
        local
          .entry(g.rule(state.lr0.rule).lhs.clone())
          .or_default()
          .push(id);
      }
    }

    while let Some(c) = frontier.pop() {
      for id in local.get(&c).into_iter().flatten() {
        if let Some(next) = self.state(*id).lr0.next_category(g) {
          if g.is_nonterminal(next) && wanted.insert(next.clone()) {
            frontier.push(next.clone());
          }
        }
      }
    }

    let mut stale = self.columns[k]
      .predicted
      .iter()
      .filter(|c| !wanted.contains(*c))
      .cloned()
      .collect::<Vec<_>>();
    stale.sort();

    for category in stale {
      trace!(column = k, %category, "unpredicting");
      self.columns[k].predicted.remove(&category);
      self.log(Undo::Unpredicted {
        column: k,
        category: category.clone(),
      });
      let predictions = local
        .get(&category)
        .into_iter()
        .flatten()
        .copied()
        .filter(|id| self.state(*id).lr0.pos == 0)
        .collect::<Vec<_>>();
      for id in predictions {
        self.mark_deleted(g, id, review);
      }
    }
  }

  /// Starts recording changes so they can be rolled back
  pub fn begin(&mut self) {
    assert!(self.journal.is_none(), "transaction already open");
    self.journal = Some(Journal {
      states: self.states.len(),
      entries: Vec::new(),
    });
  }

  pub fn in_transaction(&self) -> bool {
    self.journal.is_some()
  }

  /// Keeps everything changed since [`Chart::begin`]. States removed during
  /// the transaction are reclaimed, so ids held from before may be stale.
  pub fn accept(&mut self) {
    assert!(self.journal.take().is_some(), "no transaction to accept");
    self.compact();
  }

  /// Drops removed states from the arena and renumbers the survivors. The
  /// journal refers to states by id, so this never runs in a transaction.
  fn compact(&mut self) {
    assert!(self.journal.is_none(), "compacting inside a transaction");
    if self.states.iter().all(|s| !s.removed) {
      return;
    }
    self.clear_agendas();

    let mut renumbered = vec![None; self.states.len()];
    let mut next = 0;
    for (old, state) in self.states.iter().enumerate() {
      if !state.removed {
        renumbered[old] = Some(StateId(next));
        next += 1;
      }
    }
    let live = |id: StateId| renumbered[id.index()];
    let moved = |id: StateId| live(id).expect("live state linked to a removed one");

    let before = self.states.len();
    let states = std::mem::take(&mut self.states);
    self.states = states
      .into_iter()
      .filter(|s| !s.removed)
      .map(|mut s| {
        for derivation in s.derivations.iter_mut() {
          derivation.predecessor = derivation.predecessor.map(moved);
          derivation.reductor = derivation.reductor.map(moved);
        }
        s.parents = s.parents.iter().filter_map(|id| live(*id)).collect();
        s
      })
      .collect();

    for column in self.columns.iter_mut() {
      column.states = column.states.iter().filter_map(|id| live(*id)).collect();
      for id in column.lookup.values_mut() {
        *id = moved(*id);
      }
      for ids in column.expecting.values_mut().chain(column.reductors.values_mut()) {
        for id in ids.iter_mut() {
          *id = moved(*id);
        }
      }
    }
    for ids in self.by_rule.values_mut() {
      *ids = ids.iter().filter_map(|id| live(*id)).collect();
    }
    self.by_rule.retain(|_, ids| !ids.is_empty());

    debug!(before, after = self.states.len(), "compacted chart");
  }

  /// Undoes everything changed since [`Chart::begin`]
  pub fn reject(&mut self) {
    let journal = self.journal.take().expect("no transaction to reject");
    self.clear_agendas();

    for undo in journal.entries.into_iter().rev() {
      match undo {
        Undo::Lookup { column, key } => {
          self.columns[column].lookup.remove(&key);
        }
        Undo::Unlookup { column, key, id } => {
          self.columns[column].lookup.insert(key, id);
        }
        Undo::Expecting { column, category } => {
          pop_from_index(&mut self.columns[column].expecting, &category);
        }
        Undo::Unexpecting {
          column,
          category,
          at,
          id,
        } => {
          self.columns[column]
            .expecting
            .entry(category)
            .or_default()
            .insert(at, id);
        }
        Undo::Reductor { column, category } => {
          pop_from_index(&mut self.columns[column].reductors, &category);
        }
        Undo::Unreductor {
          column,
          category,
          at,
          id,
        } => {
          self.columns[column]
            .reductors
            .entry(category)
            .or_default()
            .insert(at, id);
        }
        Undo::Predicted { column, category } => {
          self.columns[column].predicted.remove(&category);
        }
        Undo::Unpredicted { column, category } => {
          self.columns[column].predicted.insert(category);
        }
        Undo::ColumnState { column } => {
          self.columns[column].states.pop();
        }
        Undo::ByRule { rule } => {
          pop_from_index(&mut self.by_rule, &rule);
        }
        Undo::Derivation { state } => {
          self.states[state.index()].derivations.pop();
        }
        Undo::Underivation {
          state,
          at,
          derivation,
        } => {
          self.states[state.index()].derivations.insert(at, derivation);
        }
        Undo::Parent { state } => {
          self.states[state.index()].parents.pop();
        }
        Undo::Removed { state } => {
          self.states[state.index()].removed = false;
        }
      }
    }

    self.states.truncate(journal.states);
  }
}

fn remove_from_index<K>(index: &mut HashMap<K, Vec<StateId>>, key: &K, id: StateId) -> usize
where
  K: std::hash::Hash + Eq,
{
  let ids = index.get_mut(key).expect("chart index out of sync");
  let at = ids
    .iter()
    .position(|other| *other == id)
    .expect("chart index out of sync");
  ids.remove(at);
  if ids.is_empty() {
    index.remove(key);
  }
  at
}

fn pop_from_index<K>(index: &mut HashMap<K, Vec<StateId>>, key: &K)
where
  K: std::hash::Hash + Eq,
{
  let ids = index.get_mut(key).expect("chart index out of sync");
  ids.pop();
  if ids.is_empty() {
    index.remove(key);
  }
}

pub struct ChartDisplay<'a> {
  chart: &'a Chart,
  g: &'a StaticGrammar,
}

impl fmt::Display for ChartDisplay<'_> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    for (k, column) in self.chart.columns.iter().enumerate() {
      writeln!(f, "State {}:", k)?;
      for id in column.states.iter() {
        let state = self.chart.state(*id);
        if !state.removed {
          writeln!(
            f,
            "  {}..{}: {}",
            state.origin,
            k,
            state.lr0.display(self.g)
          )?;
        }
      }
    }
    Ok(())
  }
}

fn build_chart(mut chart: Chart, g: &StaticGrammar, cancel: Option<&CancelFlag>) -> Result<Chart> {
  if let Some(flag) = cancel {
    chart = chart.with_cancel(flag.clone());
  }
  chart.build(g)?;
  Ok(chart)
}

/// Builds the chart for one sentence
pub fn parse_chart(
  g: &StaticGrammar,
  tokens: &[&str],
  vocabulary: &Vocabulary,
  config: &Config,
) -> Result<Chart> {
  build_chart(Chart::for_sentence(tokens, vocabulary, config), g, None)
}

/// Like [`parse_chart`], stopping with [`Error::Cancelled`] once `cancel` is
/// set. The chart keeps the flag, so later rule insertions stop too.
pub fn parse_chart_with_cancel(
  g: &StaticGrammar,
  tokens: &[&str],
  vocabulary: &Vocabulary,
  config: &Config,
  cancel: &CancelFlag,
) -> Result<Chart> {
  build_chart(Chart::for_sentence(tokens, vocabulary, config), g, Some(cancel))
}

/// Builds the chart deriving every sentence of up to `max_length` words
pub fn generate_chart(g: &StaticGrammar, max_length: usize, config: &Config) -> Result<Chart> {
  build_chart(Chart::for_generation(max_length, config), g, None)
}

pub fn generate_chart_with_cancel(
  g: &StaticGrammar,
  max_length: usize,
  config: &Config,
  cancel: &CancelFlag,
) -> Result<Chart> {
  build_chart(Chart::for_generation(max_length, config), g, Some(cancel))
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::compile::compile;
  use crate::grammar::SchemaGrammar;
  use crate::rules::Rule;
  use proptest::prelude::*;

  const KISSED: &str = r#"
    START -> NP VP
    NP -> Det N
    VP -> V NP
  "#;

  const LEXICON: &str = r#"
    Det: the
    N: man woman
    V: kissed
  "#;

  fn setup(src: &str, lexicon: &str) -> (StaticGrammar, Vocabulary) {
    let vocabulary: Vocabulary = lexicon.parse().unwrap();
    let schema: SchemaGrammar = src.parse().unwrap();
    let g = compile(&schema, &vocabulary.parts_of_speech(), &Config::default()).unwrap();
    (g, vocabulary)
  }

  fn words(s: &str) -> Vec<&str> {
    s.split(' ').collect()
  }

  fn rule_id(g: &StaticGrammar, text: &str) -> RuleId {
    g.rules()
      .find(|r| r.to_string() == text)
      .unwrap_or_else(|| panic!("no rule {}", text))
      .id
  }

  #[test]
  fn test_agenda_order() {
    let mut agenda = Agenda::default();
    agenda.push_active(StateId(10));
    agenda.push_completed(0, StateId(1));
    agenda.push_completed(2, StateId(2));
    agenda.push_completed(1, StateId(3));
    agenda.push_completed(2, StateId(4));

    let order = std::iter::from_fn(|| agenda.pop()).collect::<Vec<_>>();
    assert_eq!(
      order,
      vec![StateId(2), StateId(4), StateId(3), StateId(1), StateId(10)]
    );
  }

  #[test]
  fn test_parse_chart() {
    let (g, v) = setup(KISSED, LEXICON);
    let sentence = words("the man kissed the woman");
    let chart = parse_chart(&g, &sentence, &v, &Config::default()).unwrap();
    assert!(chart.is_parsed(&g));
    assert_eq!(chart.accepted(&g).len(), 1);
    println!("{}", chart.display(&g));
  }

  #[test]
  fn test_failed_parse_is_not_an_error() {
    let (g, v) = setup(KISSED, LEXICON);
    let config = Config::default();

    let chart = parse_chart(&g, &words("the man kissed"), &v, &config).unwrap();
    assert!(!chart.is_parsed(&g));

    let chart = parse_chart(&g, &words("the dog kissed the woman"), &v, &config).unwrap();
    assert!(!chart.is_parsed(&g));
  }

  #[test]
  fn test_nullable_completion() {
    // B completes empty at every position, after A is already waiting for it
    let (g, v) = setup(
      "START -> A B
       A -> a
       B -> C C
       C ->",
      "a: a",
    );
    let chart = parse_chart(&g, &["a"], &v, &Config::default()).unwrap();
    assert!(chart.is_parsed(&g));
  }

  #[test]
  fn test_generation_accepts_every_length() {
    let (g, _) = setup(
      "START -> A
       A -> a
       A -> a A",
      "a: a",
    );
    let chart = generate_chart(&g, 4, &Config::default()).unwrap();
    assert_eq!(chart.final_columns().count(), 5);
    // one sentence of each length 1..=4
    assert_eq!(chart.accepted(&g).len(), 4);
    assert_eq!(chart.word(0), None);
  }

  #[test]
  fn test_runaway_generation_aborts() {
    let (g, _) = setup(
      "START -> X1
       X1 -> X1 X1
       X1 -> a",
      "a: a",
    );
    let config = Config {
      max_states_per_column: 30,
      ..Config::default()
    };
    let err = generate_chart(&g, 10, &config).unwrap_err();
    assert!(matches!(err, Error::UnboundedDerivation { limit: 30, .. }));
    assert!(err.rejects_hypothesis());
  }

  #[test]
  fn test_self_embedding_without_base_case_stays_small() {
    // every X1 prediction at a column is shared, so nothing runs away
    let (g, _) = setup("START -> X1\nX1 -> X1 X1", "a: a");
    let chart = generate_chart(&g, 10, &Config::default()).unwrap();
    assert_eq!(chart.live_states().len(), 3);
    assert!(!chart.is_parsed(&g));
    assert!(crate::forest::Forest::from_chart(&chart, &g).is_empty());
  }

  #[test]
  fn test_cancel_generation() {
    let (g, _) = setup("START -> A\nA -> a\nA -> a A", "a: a");
    let flag = CancelFlag::new();
    let config = Config::default();
    assert!(generate_chart_with_cancel(&g, 4, &config, &flag).is_ok());
    flag.cancel();
    let err = generate_chart_with_cancel(&g, 4, &config, &flag).unwrap_err();
    assert!(matches!(err, Error::Cancelled));
    assert!(!err.rejects_hypothesis());
  }

  #[test]
  fn test_cancel_between_columns() {
    let (g, v) = setup(KISSED, LEXICON);
    let flag = CancelFlag::new();
    flag.cancel();
    let sentence = words("the man kissed the woman");
    let mut chart = Chart::for_sentence(&sentence, &v, &Config::default()).with_cancel(flag);
    assert!(matches!(chart.build(&g), Err(Error::Cancelled)));
  }

  #[test]
  fn test_insert_matches_fresh_parse() {
    let (mut g, v) = setup(
      "START -> NP VP
       NP -> Det N
       VP -> V NP
       VP -> V",
      LEXICON,
    );
    let sentence = words("the man kissed the woman");
    let config = Config::default();

    let mut chart = parse_chart(&g, &sentence, &v, &config).unwrap();
    let before = chart.live_states();

    chart.begin();
    let id = g.insert(Rule::new(Category::new("NP"), vec![Category::new("N")]));
    chart.insert_rule(&g, id).unwrap();
    chart.accept();

    let fresh = parse_chart(&g, &sentence, &v, &config).unwrap();
    assert_eq!(chart.live_states(), fresh.live_states());

    g.remove(id);
    chart.remove_rule(&g, id);
    assert_eq!(chart.live_states(), before);
  }

  #[test]
  #[should_panic(expected = "outside a transaction")]
  fn test_insert_needs_transaction() {
    let (mut g, v) = setup(KISSED, LEXICON);
    let mut chart = parse_chart(&g, &words("the man"), &v, &Config::default()).unwrap();
    let id = g.insert(Rule::new(Category::new("NP"), vec![Category::new("N")]));
    let _ = chart.insert_rule(&g, id);
  }

  #[test]
  fn test_accepted_removals_are_reclaimed() {
    let (mut g, v) = setup(KISSED, LEXICON);
    let sentence = words("the man kissed the woman");
    let config = Config::default();
    let mut chart = parse_chart(&g, &sentence, &v, &config).unwrap();
    let before = chart.live_states();
    let size = chart.states.len();

    let id = g.insert(Rule::new(Category::new("NP"), vec![Category::new("N")]));
    g.remove(id);
    for _ in 0..200 {
      chart.begin();
      g.restore(id);
      chart.insert_rule(&g, id).unwrap();
      chart.accept();

      chart.begin();
      g.remove(id);
      chart.remove_rule(&g, id);
      chart.accept();
    }

    assert_eq!(chart.live_states(), before);
    assert_eq!(chart.states.len(), size);
    assert_eq!(chart.columns.iter().map(|c| c.states.len()).sum::<usize>(), size);
    assert_eq!(chart.by_rule.values().map(|ids| ids.len()).sum::<usize>(), size);

    // renumbered indexes still drive incremental updates correctly
    chart.begin();
    g.restore(id);
    chart.insert_rule(&g, id).unwrap();
    let fresh = parse_chart(&g, &sentence, &v, &config).unwrap();
    assert_eq!(chart.live_states(), fresh.live_states());
    chart.reject();
    g.remove(id);
    assert_eq!(chart.live_states(), before);
    assert!(chart.is_parsed(&g));
  }

  #[test]
  fn test_remove_matches_fresh_parse() {
    let (mut g, v) = setup(KISSED, LEXICON);
    let sentence = words("the man kissed the woman");
    let config = Config::default();
    let mut chart = parse_chart(&g, &sentence, &v, &config).unwrap();

    let vp = rule_id(&g, "VP -> V NP");
    g.remove(vp);
    chart.remove_rule(&g, vp);
    assert!(!chart.is_parsed(&g));

    let fresh = parse_chart(&g, &sentence, &v, &config).unwrap();
    assert_eq!(chart.live_states(), fresh.live_states());
  }

  #[test]
  fn test_reject_restores_chart() {
    let (mut g, v) = setup(KISSED, LEXICON);
    let config = Config::default();
    let mut chart = parse_chart(&g, &words("the man kissed the woman"), &v, &config).unwrap();
    let pristine = parse_chart(&g, &words("the man kissed the woman"), &v, &config).unwrap();
    assert_eq!(chart, pristine);

    let vp = rule_id(&g, "VP -> V NP");
    chart.begin();
    g.remove(vp);
    chart.remove_rule(&g, vp);
    assert!(!chart.is_parsed(&g));
    assert_ne!(chart, pristine);

    chart.reject();
    g.restore(vp);
    assert!(!chart.in_transaction());
    assert_eq!(chart, pristine);
    assert!(chart.is_parsed(&g));
  }

  #[test]
  fn test_reject_insert_restores_chart() {
    let (mut g, v) = setup(KISSED, LEXICON);
    let config = Config::default();
    let sentence = words("the man kissed the woman");
    let mut chart = parse_chart(&g, &sentence, &v, &config).unwrap();
    let pristine = parse_chart(&g, &sentence, &v, &config).unwrap();

    chart.begin();
    let id = g.insert(Rule::new(Category::new("VP"), vec![Category::new("V")]));
    chart.insert_rule(&g, id).unwrap();
    assert_ne!(chart, pristine);
    chart.reject();
    g.remove(id);
    assert_eq!(chart, pristine);
  }

  #[test]
  fn test_accept_keeps_changes() {
    let (mut g, v) = setup(KISSED, LEXICON);
    let sentence = words("the man kissed the woman");
    let mut chart = parse_chart(&g, &sentence, &v, &Config::default()).unwrap();
    let vp = rule_id(&g, "VP -> V NP");
    chart.begin();
    g.remove(vp);
    chart.remove_rule(&g, vp);
    chart.accept();
    assert!(!chart.in_transaction());
    assert!(!chart.is_parsed(&g));
  }

  #[test]
  fn test_left_recursion_unpredicts() {
    // A predicts itself; removing the only way in must still clear it
    let (mut g, v) = setup(
      "START -> B
       START -> A
       A -> A a
       A -> a
       B -> a",
      "a: a",
    );
    let config = Config::default();
    let sentence = ["a", "a"];
    let mut chart = parse_chart(&g, &sentence, &v, &config).unwrap();
    assert!(chart.is_parsed(&g));

    let way_in = rule_id(&g, "START -> A");
    g.remove(way_in);
    chart.remove_rule(&g, way_in);

    let fresh = parse_chart(&g, &sentence, &v, &config).unwrap();
    assert_eq!(chart.live_states(), fresh.live_states());
    assert!(!chart.is_parsed(&g));
  }

  proptest! {
    #[test]
    fn removing_then_rejecting_any_rule_is_a_no_op(pick in 0usize..6, len in 1usize..5) {
      let (mut g, _) = setup(
        "START -> A
         START -> A B
         A -> a
         A -> A B
         B -> b
         B -> A",
        "a: a\nb: b",
      );
      let config = Config::default();
      let mut chart = generate_chart(&g, len, &config).unwrap();
      let pristine = generate_chart(&g, len, &config).unwrap();

      let ids = g.rules().map(|r| r.id).collect::<Vec<_>>();
      let id = ids[pick % ids.len()];
      chart.begin();
      g.remove(id);
      chart.remove_rule(&g, id);
      chart.reject();
      g.restore(id);
      prop_assert!(chart == pristine);
    }
  }
}
