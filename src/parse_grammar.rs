/// Simple recursive-descent parsing of grammar files
use regex::Regex;
use std::fmt;
use std::fs;
use std::path::Path;
use std::str::FromStr;

use crate::category::Category;
use crate::grammar::SchemaGrammar;
use crate::rules::Rule;
use crate::utils::{Error, Result};

/// Parses a str into a schema grammar, one rule per line.
/// Errors if the grammar doesn't parse or a rule is malformed
impl FromStr for SchemaGrammar {
  type Err = Error;

  fn from_str(s: &str) -> Result<Self> {
    let rules = parse_rules(s)?;
    if rules.is_empty() {
      return Err("empty ruleset".into());
    }

    let mut g = SchemaGrammar::new();
    for (line, rule) in rules {
      g.insert(rule).map_err(|e| match e {
        Error::Malformed(msg) => Error::Malformed(format!("line {}: {}", line, msg)),
        e => e,
      })?;
    }
    Ok(g)
  }
}

impl SchemaGrammar {
  pub fn read_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
    fs::read_to_string(path)?.parse()
  }
}

type Infallible<'a, T> = (T, &'a str);
pub(crate) type ParseResult<'a, T> = Result<(T, &'a str)>;

/// helper macro for initializing a regex with lazy_static!
macro_rules! regex_static {
  ($name:ident, $pattern:expr) => {
    lazy_static! {
      static ref $name: Regex = Regex::new($pattern).unwrap();
    }
  };
}

/// Prefixes a syntax error with where it happened
pub(crate) fn within(what: impl fmt::Display) -> impl Fn(Error) -> Error {
  move |e| match e {
    Error::Syntax(msg) => Error::Syntax(format!("{}: {}", what, msg)),
    e => e,
  }
}

/// Try to consume a regex, returning None if it doesn't match
fn optional_re<'a>(re: &'static Regex, s: &'a str) -> Infallible<'a, Option<&'a str>> {
  if let Some(m) = re.find(s) {
    if m.start() > 0 {
      return (None, s);
    }
    let (_, rest) = s.split_at(m.end());
    (Some(m.as_str()), rest)
  } else {
    (None, s)
  }
}

/// Try to consume a regex, failing if it doesn't match
fn needed_re<'a>(re: &'static Regex, s: &'a str) -> ParseResult<'a, &'a str> {
  if let (Some(c), rest) = optional_re(re, s) {
    Ok((c, rest))
  } else {
    Err(format!("couldn't match {} at '{}'", re, s).into())
  }
}

/// Try to consume a char, returning None if it doesn't match
pub(crate) fn optional_char(c: char, s: &str) -> Infallible<'_, Option<char>> {
  match s.strip_prefix(c) {
    Some(rest) => (Some(c), rest),
    None => (None, s),
  }
}

/// Try to consume a char, failing if it doesn't match
fn needed_char(c: char, s: &str) -> ParseResult<'_, char> {
  if let (Some(c), rest) = optional_char(c, s) {
    Ok((c, rest))
  } else {
    Err(format!("couldn't match {} at '{}'", c, s).into())
  }
}

/// Skips spaces and tabs. Rules never span lines.
pub(crate) fn skip_whitespace(s: &str) -> &str {
  regex_static!(WHITESPACE, r"[ \t]+");
  optional_re(&*WHITESPACE, s).1
}

/// Tries to parse a name made of letters, numbers, - and _
pub(crate) fn parse_name(s: &str) -> ParseResult<'_, &str> {
  regex_static!(NAME, r"[a-zA-Z0-9\-_']+");
  needed_re(&*NAME, s).map_err(within("name"))
}

/// Parses a `[stack]` annotation, which may be empty
fn parse_stack(s: &str) -> ParseResult<'_, &str> {
  regex_static!(STACK, r"[a-zA-Z0-9\-_'\*\.]*");
  let (_, s) = needed_char('[', s)?;
  let s = skip_whitespace(s);
  let (stack, s) = needed_re(&*STACK, s)?;
  let s = skip_whitespace(s);
  let (_, s) = needed_char(']', s)?;
  Ok((stack, s))
}

fn parse_category(s: &str) -> ParseResult<'_, Category> {
  let (name, s) = parse_name(s).map_err(within("category"))?;
  if s.starts_with('[') {
    let (stack, s) = parse_stack(s).map_err(within(format!("stack of {}", name)))?;
    Ok((Category::with_stack(name, stack), s))
  } else {
    Ok((Category::new(name), s))
  }
}

/// Category, arrow, zero to two categories. No categories means epsilon.
fn parse_rule(s: &str) -> Result<Rule> {
  #![allow(clippy::trivial_regex)]
  regex_static!(ARROW, "->");

  let s = skip_whitespace(s);
  let (lhs, s) = parse_category(s).map_err(within("rule lhs"))?;
  let s = skip_whitespace(s);
  let (_, s) = needed_re(&*ARROW, s).map_err(within("rule arrow"))?;

  let mut rhs = Vec::new();
  let mut rem = s;
  loop {
    rem = skip_whitespace(rem);
    if rem.is_empty() {
      break;
    }
    let (c, s) = parse_category(rem).map_err(within("rule rhs"))?;
    rhs.push(c);
    rem = s;
  }

  if rhs.is_empty() {
    Ok(Rule::epsilon(lhs))
  } else {
    Ok(Rule::new(lhs, rhs))
  }
}

/// Rules paired with their 1-based line number, skipping blanks and `#` comments
fn parse_rules(s: &str) -> Result<Vec<(usize, Rule)>> {
  let mut rules = Vec::new();
  for (idx, line) in s.lines().enumerate() {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
      continue;
    }
    let rule = parse_rule(line).map_err(within(format!("line {}", idx + 1)))?;
    rules.push((idx + 1, rule));
  }
  Ok(rules)
}
