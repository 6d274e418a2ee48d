#[macro_use]
extern crate lazy_static;

pub mod category;
pub mod compile;
pub mod config;
pub mod counting;
pub mod earley;
pub mod forest;
pub mod grammar;
pub mod objective;
pub mod parse_grammar;
pub mod rules;
pub mod rulespace;
pub mod syntree;
pub mod utils;
pub mod vocabulary;

use crate::earley::{generate_chart, parse_chart};
use crate::syntree::SynTree;

pub use crate::category::Category;
pub use crate::compile::compile;
pub use crate::config::Config;
pub use crate::counting::{count_derivations, Counter, Counts};
pub use crate::earley::Chart;
pub use crate::forest::Forest;
pub use crate::grammar::{SchemaGrammar, StaticGrammar};
pub use crate::objective::{
  evaluate, evaluate_with_cancel, probability, probability_with_cancel, Corpus, Score, Session,
};
pub use crate::rules::{Rule, RuleId, StackOp};
pub use crate::rulespace::{Coordinate, Hypothesis, RuleSpace};
pub use crate::utils::{CancelFlag, Error, Result};
pub use crate::vocabulary::Vocabulary;

impl StaticGrammar {
  pub fn parse_forest(
    &self,
    sentence: &[&str],
    vocabulary: &Vocabulary,
    config: &Config,
  ) -> Result<Forest> {
    let chart = parse_chart(self, sentence, vocabulary, config)?;
    Ok(Forest::from_chart(&chart, self))
  }

  /// Every tree for the sentence, labelled with categories and words
  pub fn parse(
    &self,
    sentence: &[&str],
    vocabulary: &Vocabulary,
    config: &Config,
  ) -> Result<Vec<SynTree<Category, String>>> {
    Ok(self.parse_forest(sentence, vocabulary, config)?.trees())
  }

  /// The forest of every derivation of up to `max_length` parts of speech
  pub fn generate(&self, max_length: usize, config: &Config) -> Result<Forest> {
    let chart = generate_chart(self, max_length, config)?;
    Ok(Forest::from_chart(&chart, self))
  }
}

#[test]
fn test_stack_agreement() {
  // a fronted object is carried down the stack to the gap it fills
  let schema: SchemaGrammar = r#"
    START[*] -> NP S[*NP]
    S[*] -> NP VP[*]
    VP[*] -> V NP[*]
    NP[*NP] ->
    NP -> Det N
  "#
  .parse()
  .unwrap();
  let vocabulary: Vocabulary = "Det: the a\nN: man woman\nV: kissed".parse().unwrap();
  let config = Config::default();
  let g = compile(&schema, &vocabulary.parts_of_speech(), &config).unwrap();

  let parse = |s: &str| {
    let words = s.split_whitespace().collect::<Vec<_>>();
    g.parse(&words, &vocabulary, &config).unwrap()
  };

  assert_eq!(parse("the woman the man kissed").len(), 1);
  assert_eq!(parse("the woman the man kissed the woman").len(), 0);
  assert_eq!(parse("the man kissed the woman").len(), 0);
  assert_eq!(parse("the woman kissed").len(), 0);

  let every = g.generate(5, &config).unwrap();
  assert_eq!(every.counts_by_length_within(config.count_depth).get(&5), Some(&1));
}
