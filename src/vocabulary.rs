use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs;
use std::path::Path;
use std::str::FromStr;

use crate::category::Category;
use crate::parse_grammar::{optional_char, parse_name, skip_whitespace, within};
use crate::utils::{Error, Result};

/// Lexicon from words to the parts of speech they can take.
///
/// Source format is one part of speech per line followed by its words:
///
/// ```text
/// # determiners
/// Det: the a
/// N: man woman
/// ```
#[derive(Debug, Clone, Default)]
pub struct Vocabulary {
  words: HashMap<String, Vec<Category>>,
  by_pos: BTreeMap<String, Vec<String>>,
}

impl Vocabulary {
  pub fn new() -> Self {
    Default::default()
  }

  pub fn insert(&mut self, pos: &str, word: &str) {
    let categories = self.words.entry(word.to_string()).or_default();
    let category = Category::new(pos);
    if !categories.contains(&category) {
      categories.push(category);
      self
        .by_pos
        .entry(pos.to_string())
        .or_default()
        .push(word.to_string());
    }
  }

  /// Parts of speech a word can have, empty if it's unknown
  pub fn categories(&self, word: &str) -> &[Category] {
    self.words.get(word).map(|v| v.as_slice()).unwrap_or(&[])
  }

  pub fn contains(&self, word: &str) -> bool {
    self.words.contains_key(word)
  }

  pub fn parts_of_speech(&self) -> HashSet<String> {
    self.by_pos.keys().cloned().collect()
  }

  pub fn words_for(&self, pos: &str) -> &[String] {
    self.by_pos.get(pos).map(|v| v.as_slice()).unwrap_or(&[])
  }

  pub fn read_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
    fs::read_to_string(path)?.parse()
  }
}

impl FromStr for Vocabulary {
  type Err = Error;

  fn from_str(s: &str) -> Result<Self> {
    let mut vocabulary = Self::new();
    for (idx, line) in s.lines().enumerate() {
      let line = line.trim();
      if line.is_empty() || line.starts_with('#') {
        continue;
      }
      let here = within(format!("line {}", idx + 1));

      let (pos, rest) = parse_name(line).map_err(&here)?;
      let rest = skip_whitespace(rest);
      let (colon, rest) = optional_char(':', rest);
      if colon.is_none() {
        return Err(here(format!("expected ':' after {}", pos).into()));
      }

      let mut rem = skip_whitespace(rest);
      while !rem.is_empty() {
        let (word, s) = parse_name(rem).map_err(&here)?;
        vocabulary.insert(pos, word);
        rem = skip_whitespace(s);
      }
    }
    Ok(vocabulary)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_parse_vocabulary() {
    let v: Vocabulary = r#"
      # toy lexicon
      Det: the
      N: man woman
      V: kissed
      N: kissed
    "#
    .parse()
    .unwrap();

    assert_eq!(v.categories("the"), &[Category::new("Det")]);
    assert_eq!(v.categories("kissed").len(), 2);
    assert!(v.categories("dog").is_empty());
    assert!(!v.contains("dog"));
    assert_eq!(v.words_for("N"), &["man", "woman", "kissed"]);
    assert_eq!(v.parts_of_speech().len(), 3);
  }

  #[test]
  fn test_duplicate_entries_are_ignored() {
    let v: Vocabulary = "Det: the the\nDet: the".parse().unwrap();
    assert_eq!(v.categories("the").len(), 1);
    assert_eq!(v.words_for("Det").len(), 1);
  }

  #[test]
  fn test_parse_error_has_line() {
    let err = "Det: the\nN man".parse::<Vocabulary>().unwrap_err();
    match err {
      Error::Syntax(msg) => assert!(msg.starts_with("line 2"), "{}", msg),
      e => panic!("unexpected error {:?}", e),
    }
  }
}
