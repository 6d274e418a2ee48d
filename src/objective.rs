use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::Path;
use std::str::FromStr;

use tracing::{debug, trace};

use crate::compile::compile;
use crate::config::Config;
use crate::counting::{count_derivations, Counts};
use crate::earley::{parse_chart, parse_chart_with_cancel, Chart};
use crate::forest::Forest;
use crate::grammar::StaticGrammar;
use crate::rules::{Rule, RuleId};
use crate::rulespace::{Hypothesis, RuleSpace};
use crate::utils::{CancelFlag, Error, Result};
use crate::vocabulary::Vocabulary;

/// Tokenized sentences, one per line in source form. Blank lines and lines
/// starting with `#` are skipped.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Corpus {
  sentences: Vec<Vec<String>>,
}

impl Corpus {
  pub fn new() -> Self {
    Default::default()
  }

  pub fn push(&mut self, sentence: &str) {
    let tokens = sentence
      .split_whitespace()
      .map(str::to_string)
      .collect::<Vec<_>>();
    if !tokens.is_empty() {
      self.sentences.push(tokens);
    }
  }

  pub fn len(&self) -> usize {
    self.sentences.len()
  }

  pub fn is_empty(&self) -> bool {
    self.sentences.is_empty()
  }

  pub fn sentences(&self) -> impl Iterator<Item = &[String]> {
    self.sentences.iter().map(|s| s.as_slice())
  }

  /// Each different sentence once, with how many times it occurs
  pub fn distinct(&self) -> BTreeMap<&[String], usize> {
    let mut distinct = BTreeMap::new();
    for sentence in self.sentences() {
      *distinct.entry(sentence).or_insert(0) += 1;
    }
    distinct
  }

  pub fn read_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
    fs::read_to_string(path)?.parse()
  }
}

impl FromStr for Corpus {
  type Err = Error;

  fn from_str(s: &str) -> Result<Self> {
    let mut corpus = Self::new();
    for line in s.lines().map(str::trim) {
      if !line.starts_with('#') {
        corpus.push(line);
      }
    }
    Ok(corpus)
  }
}

/// How well a grammar explains a corpus
#[derive(Debug, Clone, PartialEq)]
pub struct Score {
  /// Trees found in the corpus, per sentence length, each sentence counted once
  pub observed: Counts,
  /// Derivations the grammar has, per sentence length seen in the corpus
  pub possible: Counts,
  /// Sentences, counting repeats, with no parse at all
  pub unexplained: usize,
  pub sentences: usize,
  /// Packed alternatives using each static rule, summed over the corpus
  pub usage: HashMap<RuleId, usize>,
  /// Like `usage`, keyed by the schema rule each static rule came from
  pub schema_usage: HashMap<RuleId, usize>,
  pub probability: f64,
}

impl Score {
  /// Combines one forest per distinct sentence. Every length present in the
  /// corpus contributes `min(observed, possible)` over `possible`, and the
  /// share of sentences that didn't parse is taken off the result.
  fn tally<'a, I>(g: &StaticGrammar, parses: I, config: &Config) -> Self
  where
    I: IntoIterator<Item = (usize, usize, &'a Forest)>,
  {
    let mut lengths = Vec::new();
    let mut observed = Counts::new();
    let mut unexplained = 0;
    let mut sentences = 0;
    let mut usage = HashMap::new();
    let mut schema_usage = HashMap::new();

    for (len, occurrences, forest) in parses {
      sentences += occurrences;
      lengths.push(len);
      if forest.is_empty() {
        unexplained += occurrences;
        continue;
      }

      let trees = forest.count_trees_within(config.count_depth);
      let slot = observed.entry(len).or_insert(0u128);
      *slot = slot.saturating_add(trees);
      for (rule, n) in forest.rule_usage() {
        *usage.entry(rule).or_insert(0) += n;
      }
      for (rule, n) in forest.schema_usage() {
        *schema_usage.entry(rule).or_insert(0) += n;
      }
    }

    lengths.sort_unstable();
    lengths.dedup();
    let longest = lengths.last().copied().unwrap_or(0);
    let all = count_derivations(g, config.count_depth, Some(longest));
    let possible = lengths
      .iter()
      .filter_map(|len| all.get(len).map(|n| (*len, *n)))
      .collect::<Counts>();

    let mut explained = 0f64;
    let mut total = 0f64;
    for (len, n) in possible.iter() {
      let seen = observed.get(len).copied().unwrap_or(0);
      explained += seen.min(*n) as f64;
      total += *n as f64;
    }

    let ratio = if total > 0.0 { explained / total } else { 0.0 };
    let missed = if sentences > 0 {
      unexplained as f64 / sentences as f64
    } else {
      0.0
    };
    let probability = (ratio - missed).max(0.0);
    assert!(
      (0.0..=1.0).contains(&probability),
      "probability {} out of range",
      probability
    );

    debug!(
      sentences,
      unexplained,
      explained,
      total,
      probability,
      "scored grammar"
    );

    Self {
      observed,
      possible,
      unexplained,
      sentences,
      usage,
      schema_usage,
      probability,
    }
  }
}

/// (sentence length, occurrences, chart) for every distinct sentence
fn parse_corpus(
  g: &StaticGrammar,
  corpus: &Corpus,
  vocabulary: &Vocabulary,
  config: &Config,
  cancel: Option<&CancelFlag>,
) -> Result<Vec<(usize, usize, Chart)>> {
  let mut charts = Vec::new();
  for (sentence, occurrences) in corpus.distinct() {
    let tokens = sentence.iter().map(String::as_str).collect::<Vec<_>>();
    let chart = match cancel {
      Some(flag) => parse_chart_with_cancel(g, &tokens, vocabulary, config, flag)?,
      None => parse_chart(g, &tokens, vocabulary, config)?,
    };
    charts.push((tokens.len(), occurrences, chart));
  }
  Ok(charts)
}

fn score_corpus(
  g: &StaticGrammar,
  corpus: &Corpus,
  vocabulary: &Vocabulary,
  config: &Config,
  cancel: Option<&CancelFlag>,
) -> Result<Score> {
  let parses = parse_corpus(g, corpus, vocabulary, config, cancel)?
    .into_iter()
    .map(|(len, n, chart)| (len, n, Forest::from_chart(&chart, g)))
    .collect::<Vec<_>>();
  Ok(Score::tally(
    g,
    parses.iter().map(|(len, n, forest)| (*len, *n, forest)),
    config,
  ))
}

/// Parses every distinct sentence of the corpus and scores the grammar
pub fn evaluate(
  g: &StaticGrammar,
  corpus: &Corpus,
  vocabulary: &Vocabulary,
  config: &Config,
) -> Result<Score> {
  score_corpus(g, corpus, vocabulary, config, None)
}

/// Like [`evaluate`], stopping with [`Error::Cancelled`] at the next chart
/// column after `cancel` is set
pub fn evaluate_with_cancel(
  g: &StaticGrammar,
  corpus: &Corpus,
  vocabulary: &Vocabulary,
  config: &Config,
  cancel: &CancelFlag,
) -> Result<Score> {
  score_corpus(g, corpus, vocabulary, config, Some(cancel))
}

fn compile_hypothesis(
  space: &RuleSpace,
  hypothesis: &Hypothesis,
  vocabulary: &Vocabulary,
  config: &Config,
) -> Result<StaticGrammar> {
  let schema = hypothesis.to_schema(space)?;
  compile(&schema, &vocabulary.parts_of_speech(), config)
}

fn hypothesis_probability(
  space: &RuleSpace,
  hypothesis: &Hypothesis,
  corpus: &Corpus,
  vocabulary: &Vocabulary,
  config: &Config,
  cancel: Option<&CancelFlag>,
) -> Result<f64> {
  let score = compile_hypothesis(space, hypothesis, vocabulary, config)
    .and_then(|g| score_corpus(&g, corpus, vocabulary, config, cancel));
  match score {
    Ok(score) => Ok(score.probability),
    Err(e) if e.rejects_hypothesis() => {
      debug!(%hypothesis, error = %e, "hypothesis rejected");
      Ok(0.0)
    }
    Err(e) => Err(e),
  }
}

/// The objective a grammar search maximizes. A malformed or runaway
/// hypothesis scores 0; other failures (cancellation, I/O) are passed on.
pub fn probability(
  space: &RuleSpace,
  hypothesis: &Hypothesis,
  corpus: &Corpus,
  vocabulary: &Vocabulary,
  config: &Config,
) -> Result<f64> {
  hypothesis_probability(space, hypothesis, corpus, vocabulary, config, None)
}

pub fn probability_with_cancel(
  space: &RuleSpace,
  hypothesis: &Hypothesis,
  corpus: &Corpus,
  vocabulary: &Vocabulary,
  config: &Config,
  cancel: &CancelFlag,
) -> Result<f64> {
  hypothesis_probability(space, hypothesis, corpus, vocabulary, config, Some(cancel))
}

/// The hypothesis without the rules no parse of the corpus uses
pub fn prune(
  space: &RuleSpace,
  hypothesis: &Hypothesis,
  corpus: &Corpus,
  vocabulary: &Vocabulary,
  config: &Config,
) -> Result<Hypothesis> {
  let g = compile_hypothesis(space, hypothesis, vocabulary, config)?;
  let score = evaluate(&g, corpus, vocabulary, config)?;

  // schema rule ids follow coordinate order
  Ok(
    hypothesis
      .iter()
      .enumerate()
      .filter(|(idx, _)| score.schema_usage.contains_key(&RuleId(*idx as u32)))
      .map(|(_, at)| *at)
      .collect(),
  )
}

#[derive(Debug, Clone, Copy)]
enum Change {
  Inserted(RuleId),
  Removed(RuleId),
}

/// A compiled grammar together with a chart for every distinct sentence of a
/// corpus, for trying out one rule change at a time without reparsing.
///
/// Changes happen inside a transaction: [`Session::begin`], any number of
/// [`Session::insert_rule`] / [`Session::remove_rule`], then
/// [`Session::accept`] or [`Session::reject`]. Rejecting puts the grammar and
/// every chart back exactly as they were. After an error the transaction must
/// be rejected.
///
/// A session opened with [`Session::new_with_cancel`] hands the flag to every
/// chart, so setting it stops both the initial parses and later insertions.
#[derive(Debug)]
pub struct Session {
  grammar: StaticGrammar,
  /// (sentence length, occurrences, chart) per distinct sentence
  charts: Vec<(usize, usize, Chart)>,
  config: Config,
  changes: Option<Vec<Change>>,
}

impl Session {
  pub fn new(
    grammar: StaticGrammar,
    corpus: &Corpus,
    vocabulary: &Vocabulary,
    config: &Config,
  ) -> Result<Self> {
    Self::open(grammar, corpus, vocabulary, config, None)
  }

  pub fn new_with_cancel(
    grammar: StaticGrammar,
    corpus: &Corpus,
    vocabulary: &Vocabulary,
    config: &Config,
    cancel: &CancelFlag,
  ) -> Result<Self> {
    Self::open(grammar, corpus, vocabulary, config, Some(cancel))
  }

  fn open(
    grammar: StaticGrammar,
    corpus: &Corpus,
    vocabulary: &Vocabulary,
    config: &Config,
    cancel: Option<&CancelFlag>,
  ) -> Result<Self> {
    let charts = parse_corpus(&grammar, corpus, vocabulary, config, cancel)?;
    debug!(charts = charts.len(), "opened session");
    Ok(Self {
      grammar,
      charts,
      config: config.clone(),
      changes: None,
    })
  }

  pub fn grammar(&self) -> &StaticGrammar {
    &self.grammar
  }

  pub fn charts(&self) -> impl Iterator<Item = &Chart> {
    self.charts.iter().map(|(_, _, chart)| chart)
  }

  pub fn forests(&self) -> Vec<Forest> {
    self
      .charts()
      .map(|chart| Forest::from_chart(chart, &self.grammar))
      .collect()
  }

  pub fn score(&self) -> Score {
    let forests = self.forests();
    let parses = self
      .charts
      .iter()
      .zip(forests.iter())
      .map(|((len, occurrences, _), forest)| (*len, *occurrences, forest));
    Score::tally(&self.grammar, parses, &self.config)
  }

  pub fn in_transaction(&self) -> bool {
    self.changes.is_some()
  }

  pub fn begin(&mut self) {
    assert!(!self.in_transaction(), "transaction already open");
    for (_, _, chart) in self.charts.iter_mut() {
      chart.begin();
    }
    self.changes = Some(Vec::new());
  }

  fn record(&mut self, change: Change) {
    self
      .changes
      .as_mut()
      .expect("grammar changed outside a transaction")
      .push(change);
  }

  /// Adds a concrete rule to the grammar and to every chart. A rule that
  /// would make the grammar cyclic is refused as malformed.
  pub fn insert_rule(&mut self, rule: Rule) -> Result<RuleId> {
    assert!(self.in_transaction(), "grammar changed outside a transaction");
    rule.validate()?;
    if rule.is_schema() {
      return Err(Error::Malformed(format!("{} has a wildcard", rule)));
    }

    let id = self.grammar.insert(rule);
    if self.grammar.contains_cyclic_unit_production() {
      self.grammar.retract(id);
      return Err(Error::Malformed("cyclic unit production".into()));
    }
    self.record(Change::Inserted(id));
    trace!(rule = %self.grammar.rule(id), "inserting rule");

    for (_, _, chart) in self.charts.iter_mut() {
      chart.insert_rule(&self.grammar, id)?;
    }
    Ok(id)
  }

  /// Takes a rule out of the grammar and every chart. False if it wasn't live.
  pub fn remove_rule(&mut self, id: RuleId) -> bool {
    assert!(self.in_transaction(), "grammar changed outside a transaction");
    if !self.grammar.remove(id) {
      return false;
    }
    self.record(Change::Removed(id));
    trace!(rule = %self.grammar.rule(id), "removing rule");

    for (_, _, chart) in self.charts.iter_mut() {
      chart.remove_rule(&self.grammar, id);
    }
    true
  }

  /// Removes every rule no parse uses. Returns what was removed.
  pub fn prune_unused(&mut self) -> Vec<RuleId> {
    let usage = self.score().usage;
    let unused = self
      .grammar
      .rules()
      .filter(|r| !usage.contains_key(&r.id))
      .map(|r| r.id)
      .collect::<Vec<_>>();
    for id in unused.iter() {
      self.remove_rule(*id);
    }
    unused
  }

  pub fn accept(&mut self) {
    assert!(self.changes.take().is_some(), "no transaction to accept");
    for (_, _, chart) in self.charts.iter_mut() {
      chart.accept();
    }
  }

  pub fn reject(&mut self) {
    let changes = self.changes.take().expect("no transaction to reject");
    for (_, _, chart) in self.charts.iter_mut() {
      chart.reject();
    }
    for change in changes.into_iter().rev() {
      match change {
        Change::Inserted(id) => self.grammar.retract(id),
        Change::Removed(id) => {
          self.grammar.restore(id);
        }
      }
    }
  }
}
