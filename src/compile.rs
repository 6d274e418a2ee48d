use std::collections::{HashSet, VecDeque};

use tracing::{debug, trace};

use crate::category::Category;
use crate::config::Config;
use crate::grammar::{SchemaGrammar, StaticGrammar};
use crate::rules::Rule;
use crate::utils::{Error, Result};

/// Outcome of unifying one schema rule with one concrete category
#[derive(Debug, PartialEq)]
enum Unified {
  /// The rule applies, with these concrete children
  Rhs(Vec<Category>),
  /// The left-hand side doesn't match the category
  NoMatch,
  /// The left-hand side matches, but the instance would be ill-formed
  Rejected(&'static str),
}

/// Expands a schema grammar into the static rules reachable from the start
/// category, breadth first.
///
/// Every generated category has a stack of at most `config.max_stack_depth`
/// symbols, which keeps the category space finite, so this always terminates.
/// Fails with [`Error::Malformed`] if the result contains a cyclic unit
/// production.
pub fn compile(
  schema: &SchemaGrammar,
  pos: &HashSet<String>,
  config: &Config,
) -> Result<StaticGrammar> {
  let start = Category::new(config.start.clone());
  let mut g = StaticGrammar::new(start.clone(), &config.gamma, pos.clone());

  let mut queue = VecDeque::new();
  let mut seen = HashSet::new();
  seen.insert(start.clone());
  queue.push_back(start);

  while let Some(category) = queue.pop_front() {
    if g.is_expanded(&category) {
      continue;
    }

    for schema_rule in schema.rules_for_base(category.name()) {
      let rhs = match unify(schema_rule, &category, &g, config.max_stack_depth) {
        Unified::Rhs(rhs) => rhs,
        Unified::NoMatch => continue,
        Unified::Rejected(why) => {
          trace!(rule = %schema_rule, %category, why, "schema instance rejected");
          continue;
        }
      };

      for c in rhs.iter() {
        if g.is_nonterminal(c) && seen.insert(c.clone()) {
          queue.push_back(c.clone());
        }
      }

      if !g.contains_production(&category, &rhs) {
        let mut rule = Rule::new(category.clone(), rhs);
        rule.origin = Some(schema_rule.id);
        g.insert(rule);
      }
    }

    g.mark_expanded(category);
  }

  debug!(
    schema_rules = schema.len(),
    static_rules = g.len(),
    categories = seen.len(),
    "compiled grammar"
  );

  if g.contains_cyclic_unit_production() {
    return Err(Error::Malformed("cyclic unit production".into()));
  }

  Ok(g)
}

fn unify(rule: &Rule, category: &Category, g: &StaticGrammar, max_depth: usize) -> Unified {
  if rule.lhs.name() != category.name() {
    return Unified::NoMatch;
  }

  let pattern = match rule.lhs.pattern() {
    Some(pattern) => pattern,
    None if rule.lhs == *category => {
      // no wildcard: nothing to hand down
      return Unified::Rhs(rule.rhs.clone());
    }
    None => return Unified::NoMatch,
  };

  let captured = match pattern.capture(category.stack()) {
    Some(captured) => captured,
    None => return Unified::NoMatch,
  };
  let captured_depth = category.depth() - pattern.depth();

  if !captured.is_empty() && rule.heir().is_none() {
    return Unified::Rejected("stack has no child to go to");
  }

  let mut rhs = Vec::with_capacity(rule.rhs.len());
  for c in rule.rhs.iter() {
    let child = match c.pattern() {
      Some(p) => {
        let depth = captured_depth + p.depth();
        if depth > max_depth {
          return Unified::Rejected("stack too deep");
        }
        Category::with_stack(c.name(), p.substitute(captured))
      }
      None => c.clone(),
    };

    if child.depth() > 0 && g.parts_of_speech().contains(child.name()) {
      return Unified::Rejected("stack on a part of speech");
    }
    rhs.push(child);
  }

  Unified::Rhs(rhs)
}

#[cfg(test)]
mod tests {
  use super::*;
  use proptest::prelude::*;

  fn pos(names: &[&str]) -> HashSet<String> {
    names.iter().map(|s| s.to_string()).collect()
  }

  fn schema(src: &str) -> SchemaGrammar {
    src.parse().unwrap()
  }

  fn rule_strings(g: &StaticGrammar) -> Vec<String> {
    let mut v = g.rules().map(|r| r.to_string()).collect::<Vec<_>>();
    v.sort();
    v
  }

  #[test]
  fn test_plain_grammar_compiles_to_itself() {
    let s = schema(
      "START -> NP VP
       NP -> Det N
       VP -> V NP",
    );
    let g = compile(&s, &pos(&["Det", "N", "V"]), &Config::default()).unwrap();
    assert_eq!(
      rule_strings(&g),
      vec!["NP -> Det N", "START -> NP VP", "VP -> V NP"]
    );
    assert!(g.is_expanded(&Category::new("VP")));
    assert!(!g.is_expanded(&Category::new("Det")));
  }

  #[test]
  fn test_unreachable_rules_are_dropped() {
    let s = schema(
      "START -> A
       A -> a
       B -> b",
    );
    let g = compile(&s, &pos(&["a", "b"]), &Config::default()).unwrap();
    assert_eq!(rule_strings(&g), vec!["A -> a", "START -> A"]);
  }

  #[test]
  fn test_movement_grammar() {
    let s = schema(
      "START[*] -> NP S[*NP]
       START[*] -> S[*]
       S[*] -> NP VP[*]
       VP[*] -> V NP[*]
       NP[*] -> Det N
       NP[*NP] -> ",
    );
    let g = compile(&s, &pos(&["Det", "N", "V"]), &Config::default()).unwrap();
    let rules = rule_strings(&g);

    assert!(rules.contains(&"START -> NP S[NP]".to_string()));
    assert!(rules.contains(&"S[NP] -> NP VP[NP]".to_string()));
    assert!(rules.contains(&"VP[NP] -> V NP[NP]".to_string()));
    assert!(rules.contains(&"NP[NP] ->".to_string()));
    // NP[NP] -> Det N would drop the stack on the floor
    assert!(!rules.contains(&"NP[NP] -> Det N".to_string()));
    // a pop needs something to pop
    assert!(!rules.contains(&"NP ->".to_string()));

    assert!(g.rules().all(|rule| rule.origin.is_some()));
  }

  #[test]
  fn test_depth_bound() {
    // every A pushes another x, forever
    let s = schema(
      "START[*] -> A[*]
       A[*] -> a A[*x]
       A[*x] -> a A[*]
       A[*] -> a",
    );
    for depth in 0..5 {
      let config = Config {
        max_stack_depth: depth,
        ..Config::default()
      };
      let g = compile(&s, &pos(&["a"]), &config).unwrap();
      let deepest = g
        .rules()
        .flat_map(|r| r.rhs.iter())
        .map(|c| c.depth())
        .max()
        .unwrap();
      assert_eq!(deepest, depth);
      // A, A[x], ... A[x.x.x]
      assert_eq!(g.left_hand_sides().len(), depth + 2);
    }
  }

  #[test]
  fn test_no_stacks_on_parts_of_speech() {
    let s = schema(
      "START[*] -> B[*x]
       B[*] -> a[*]",
    );
    let g = compile(&s, &pos(&["a"]), &Config::default()).unwrap();
    assert_eq!(rule_strings(&g), vec!["START -> B[x]"]);
  }

  #[test]
  fn test_cyclic_grammar_is_malformed() {
    let s = schema(
      "START -> A
       A -> B
       B -> A
       B -> b",
    );
    let err = compile(&s, &pos(&["b"]), &Config::default()).unwrap_err();
    assert!(err.rejects_hypothesis());
  }

  #[test]
  fn test_duplicate_instances_are_merged() {
    let s = schema(
      "START[*] -> A
       START -> A
       A -> a",
    );
    let g = compile(&s, &pos(&["a"]), &Config::default()).unwrap();
    assert_eq!(rule_strings(&g), vec!["A -> a", "START -> A"]);
  }

  fn arbitrary_schema() -> impl Strategy<Value = String> {
    let name = prop::sample::select(vec!["START", "A", "B", "a"]);
    let stack = prop::sample::select(vec!["", "[*]", "[*A]", "[*B]"]);
    let category = (name, stack).prop_map(|(n, s)| format!("{}{}", n, s));
    let rule = (category.clone(), prop::collection::vec(category, 1..=2))
      .prop_map(|(lhs, rhs)| format!("{} -> {}", lhs, rhs.join(" ")));
    prop::collection::vec(rule, 1..8).prop_map(|rules| rules.join("\n"))
  }

  proptest! {
    #[test]
    fn compilation_terminates_within_depth(src in arbitrary_schema(), depth in 0usize..4) {
      // most random grammars break some schema rule; only valid ones get compiled
      if let Ok(s) = src.parse::<SchemaGrammar>() {
        let config = Config { max_stack_depth: depth, ..Config::default() };
        match compile(&s, &pos(&["a"]), &config) {
          Ok(g) => {
            for rule in g.rules() {
              for c in rule.rhs.iter() {
                prop_assert!(c.depth() <= depth, "{} too deep", rule);
              }
            }
          }
          Err(e) => prop_assert!(e.rejects_hypothesis()),
        }
      }
    }
  }
}
