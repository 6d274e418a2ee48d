use std::fs;
use std::io;
use std::io::Write;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing::debug;
use tracing_subscriber::EnvFilter;

use lig::earley::parse_chart;
use lig::{
  compile, count_derivations, evaluate, Config, Corpus, Forest, SchemaGrammar, StaticGrammar,
  Vocabulary,
};

/// Compile, parse and count Linear Indexed Grammars
#[derive(Parser, Debug)]
#[command(name = "lig", version)]
struct Cli {
  /// Settings file (TOML); flags below override it
  #[arg(long, global = true)]
  config: Option<PathBuf>,

  /// Deepest stack a compiled category may carry
  #[arg(long, global = true)]
  max_stack_depth: Option<usize>,

  /// Work a single chart column may do before giving up
  #[arg(long, global = true)]
  max_states: Option<usize>,

  /// Tallest derivation counted
  #[arg(long, global = true)]
  count_depth: Option<usize>,

  #[command(subcommand)]
  command: Command,
}

/// The grammar and the lexicon its parts of speech come from
#[derive(Args, Debug)]
struct GrammarFiles {
  /// Schema grammar file
  grammar: PathBuf,
  /// Lexicon file, one `POS: word word ...` line per part of speech
  lexicon: PathBuf,
}

#[derive(Subcommand, Debug)]
enum Command {
  /// Read sentences from stdin and print their parses
  Parse {
    #[command(flatten)]
    files: GrammarFiles,
    /// Print the parse chart
    #[arg(short, long)]
    chart: bool,
  },
  /// Derive every part-of-speech sequence up to a length
  Generate {
    #[command(flatten)]
    files: GrammarFiles,
    #[arg(short, long, default_value_t = 5)]
    length: usize,
    /// Print each derivation, not just the counts
    #[arg(short, long)]
    trees: bool,
  },
  /// Count derivations per sentence length without building charts
  Count {
    #[command(flatten)]
    files: GrammarFiles,
    /// Longest sentence to report
    #[arg(short, long)]
    length: Option<usize>,
  },
  /// Score the grammar against a corpus, one sentence per line
  Score {
    #[command(flatten)]
    files: GrammarFiles,
    corpus: PathBuf,
  },
  /// Compile the grammar and print its static rules
  Check {
    #[command(flatten)]
    files: GrammarFiles,
  },
}

impl Cli {
  fn settings(&self) -> Result<Config> {
    let mut config = match &self.config {
      Some(path) => {
        let src = fs::read_to_string(path)
          .with_context(|| format!("reading {}", path.display()))?;
        toml::from_str(&src).with_context(|| format!("parsing {}", path.display()))?
      }
      None => Config::default(),
    };
    if let Some(depth) = self.max_stack_depth {
      config.max_stack_depth = depth;
    }
    if let Some(limit) = self.max_states {
      config.max_states_per_column = limit;
    }
    if let Some(depth) = self.count_depth {
      config.count_depth = depth;
    }
    debug!(?config, "effective settings");
    Ok(config)
  }
}

impl GrammarFiles {
  fn load(&self, config: &Config) -> Result<(StaticGrammar, Vocabulary)> {
    let schema = SchemaGrammar::read_from_file(&self.grammar)
      .with_context(|| format!("loading grammar {}", self.grammar.display()))?;
    let vocabulary = Vocabulary::read_from_file(&self.lexicon)
      .with_context(|| format!("loading lexicon {}", self.lexicon.display()))?;
    let g = compile(&schema, &vocabulary.parts_of_speech(), config)?;
    Ok((g, vocabulary))
  }
}

fn plural(n: usize) -> &'static str {
  if n == 1 { "" } else { "s" }
}

fn parse(
  g: &StaticGrammar,
  vocabulary: &Vocabulary,
  config: &Config,
  sentence: &str,
  print_chart: bool,
) -> Result<()> {
  let sentence = sentence.split_whitespace().collect::<Vec<_>>();
  let chart = parse_chart(g, &sentence, vocabulary, config)?;

  if print_chart {
    println!("chart:\n{}\n", chart.display(g));
  }

  let forest = Forest::from_chart(&chart, g);
  let trees = forest.trees();
  println!("Parsed {} tree{}", trees.len(), plural(trees.len()));
  for t in trees {
    println!("{:#}", t);
    println!();
  }

  Ok(())
}

fn repl(
  g: &StaticGrammar,
  vocabulary: &Vocabulary,
  config: &Config,
  print_chart: bool,
) -> Result<()> {
  let mut input = String::new();
  loop {
    print!("> ");
    io::stdout().flush()?;

    input.clear();
    if io::stdin().read_line(&mut input)? == 0 {
      // ctrl+d
      return Ok(());
    }
    input.make_ascii_lowercase();
    if input.trim().is_empty() {
      continue;
    }
    // a bad sentence shouldn't end the session
    if let Err(e) = parse(g, vocabulary, config, input.trim(), print_chart) {
      eprintln!("error: {}", e);
    }
  }
}

fn main() -> Result<()> {
  tracing_subscriber::fmt()
    .with_env_filter(
      EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
    )
    .with_writer(io::stderr)
    .init();

  let cli = Cli::parse();
  let config = cli.settings()?;

  match &cli.command {
    Command::Parse { files, chart } => {
      let (g, vocabulary) = files.load(&config)?;
      repl(&g, &vocabulary, &config, *chart)
    }
    Command::Generate {
      files,
      length,
      trees,
    } => {
      let (g, _) = files.load(&config)?;
      let forest = g.generate(*length, &config)?;
      for (len, n) in forest.counts_by_length_within(config.count_depth) {
        println!("{:>4}  {}", len, n);
      }
      if *trees {
        for t in forest.trees() {
          println!("{}", t);
        }
      }
      Ok(())
    }
    Command::Count { files, length } => {
      let (g, _) = files.load(&config)?;
      for (len, n) in count_derivations(&g, config.count_depth, *length) {
        println!("{:>4}  {}", len, n);
      }
      Ok(())
    }
    Command::Score { files, corpus } => {
      let (g, vocabulary) = files.load(&config)?;
      let corpus = Corpus::read_from_file(corpus)
        .with_context(|| format!("loading corpus {}", corpus.display()))?;
      let score = evaluate(&g, &corpus, &vocabulary, &config)?;
      println!("length  observed  possible");
      for (len, possible) in score.possible.iter() {
        let observed = score.observed.get(len).copied().unwrap_or(0);
        println!("{:>6}  {:>8}  {:>8}", len, observed, possible);
      }
      println!(
        "{} of {} sentence{} unexplained",
        score.unexplained,
        score.sentences,
        plural(score.sentences)
      );
      println!("probability {:.6}", score.probability);
      Ok(())
    }
    Command::Check { files } => {
      let (g, _) = files.load(&config)?;
      print!("{}", g);
      println!(
        "{} rule{}, {} nullable categor{}",
        g.len(),
        plural(g.len()),
        g.nullables().len(),
        if g.nullables().len() == 1 { "y" } else { "ies" }
      );
      Ok(())
    }
  }
}
