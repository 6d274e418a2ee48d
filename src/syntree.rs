use std::fmt;

/// An interior node of a tree: a category over a span of words
#[derive(Debug, PartialEq, Clone)]
pub struct Constituent<T> {
  pub value: T,
  pub span: (usize, usize),
}

impl<T> fmt::Display for Constituent<T>
where
  T: fmt::Display,
{
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}..{}: {}", self.span.0, self.span.1, self.value)
  }
}

#[derive(Debug, PartialEq, Clone)]
pub struct Word<U> {
  pub value: U,
  pub span: (usize, usize),
}

impl<U> fmt::Display for Word<U>
where
  U: fmt::Display,
{
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}..{}: {}", self.span.0, self.span.1, self.value)
  }
}

#[derive(Debug, PartialEq, Clone)]
pub enum SynTree<T, U> {
  Branch(Constituent<T>, Vec<SynTree<T, U>>),
  Leaf(Word<U>),
}

impl<T, U> SynTree<T, U> {
  pub fn is_leaf(&self) -> bool {
    matches!(self, Self::Leaf(_))
  }

  pub fn is_branch(&self) -> bool {
    matches!(self, Self::Branch(_, _))
  }

  pub fn get_leaf(&self) -> Option<&Word<U>> {
    match self {
      Self::Leaf(w) => Some(w),
      _ => None,
    }
  }

  pub fn get_branch(&self) -> Option<(&Constituent<T>, &Vec<SynTree<T, U>>)> {
    match self {
      Self::Branch(c, cs) => Some((c, cs)),
      _ => None,
    }
  }

  pub fn span(&self) -> (usize, usize) {
    match self {
      Self::Branch(c, _) => c.span,
      Self::Leaf(w) => w.span,
    }
  }

  /// The words at the bottom of the tree, left to right
  pub fn leaves(&self) -> Vec<&U> {
    match self {
      Self::Leaf(w) => vec![&w.value],
      Self::Branch(_, children) => children.iter().flat_map(|c| c.leaves()).collect(),
    }
  }

  /// Rule applications on the longest path down; a lone word is height 0
  pub fn height(&self) -> usize {
    match self {
      Self::Leaf(_) => 0,
      Self::Branch(_, children) => 1 + children.iter().map(|c| c.height()).max().unwrap_or(0),
    }
  }

  pub fn map<V, W>(
    &self,
    map_branch: &impl Fn(&T) -> V,
    map_leaf: &impl Fn(&U) -> W,
  ) -> SynTree<V, W> {
    match self {
      Self::Branch(t, children) => SynTree::Branch(
        Constituent {
          span: t.span,
          value: map_branch(&t.value),
        },
        children.iter().map(|c| c.map(map_branch, map_leaf)).collect(),
      ),
      Self::Leaf(u) => SynTree::Leaf(Word {
        span: u.span,
        value: map_leaf(&u.value),
      }),
    }
  }
}

/// Bracketed, `(NP the man)`. The alternate form `{:#}` puts each child on its
/// own indented line and shows spans.
impl<T, U> fmt::Display for SynTree<T, U>
where
  T: fmt::Display,
  U: fmt::Display,
{
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    if f.alternate() {
      match self {
        Self::Leaf(w) => write!(f, "{}", w),
        Self::Branch(c, children) => {
          write!(f, "({}", c)?;
          for child in children.iter() {
            let fmt = format!("{:#}", child);
            for line in fmt.lines() {
              write!(f, "\n  {}", line)?;
            }
          }
          write!(f, ")")
        }
      }
    } else {
      match self {
        Self::Leaf(w) => write!(f, "{}", w.value),
        Self::Branch(c, children) => {
          write!(f, "({}", c.value)?;
          for child in children.iter() {
            write!(f, " {}", child)?;
          }
          write!(f, ")")
        }
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn leaf(value: &str, at: usize) -> SynTree<String, String> {
    SynTree::Leaf(Word {
      value: value.to_string(),
      span: (at, at + 1),
    })
  }

  fn branch(value: &str, children: Vec<SynTree<String, String>>) -> SynTree<String, String> {
    let span = (
      children.first().map(|c| c.span().0).unwrap_or(0),
      children.last().map(|c| c.span().1).unwrap_or(0),
    );
    SynTree::Branch(
      Constituent {
        value: value.to_string(),
        span,
      },
      children,
    )
  }

  #[test]
  fn test_display() {
    let t = branch("S", vec![branch("NP", vec![leaf("he", 0)]), leaf("left", 1)]);
    assert_eq!(t.to_string(), "(S (NP he) left)");
    assert_eq!(format!("{:#}", t), "(0..2: S\n  (0..1: NP\n    0..1: he)\n  1..2: left)");
  }

  #[test]
  fn test_leaves_and_height() {
    let t = branch(
      "S",
      vec![branch("NP", vec![leaf("he", 0)]), branch("VP", vec![leaf("left", 1)])],
    );
    assert_eq!(t.leaves(), vec!["he", "left"]);
    assert_eq!(t.height(), 2);
    assert_eq!(t.span(), (0, 2));
    assert!(t.is_branch());

    let upper = t.map(&|c: &String| c.to_uppercase(), &|w: &String| w.len());
    assert_eq!(upper.to_string(), "(S (NP 2) (VP 4))");
  }
}
