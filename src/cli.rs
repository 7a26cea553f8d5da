use std::{ffi::OsString, path::PathBuf};

use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;

#[derive(Debug, Parser)]
#[command(
    name = "ask",
    version,
    about = "Ask questions about the documentation in a repository"
)]
pub struct Cli {
    /// Override the XDG data directory
    #[arg(long, global = true)]
    pub data_dir: Option<PathBuf>,

    /// Repository path (defaults to the current directory)
    #[arg(short, long, global = true)]
    pub repo: Option<PathBuf>,

    /// Increase log verbosity (can be repeated: -v, -vv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Only log warnings and errors
    #[arg(short, long, global = true)]
    pub quiet: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Ask a question about the documentation (default command)
    Ask(AskArgs),
    /// Create (or rebuild) the index for the repository
    Create(CreateArgs),
    /// Show the sections most relevant to a question
    Search(SearchArgs),
    /// Remove all indexed data and caches
    Clean,
    /// Generate shell completions
    #[command(hide = true)]
    Completions(CompletionsArgs),
}

// -- Ask --

#[derive(Debug, Parser)]
pub struct AskArgs {
    /// The question to answer
    pub question: String,

    /// Minimum reranker score for a section to be used as a source
    #[arg(long)]
    pub min_score: Option<f32>,
}

// -- Create --

#[derive(Debug, Parser)]
pub struct CreateArgs {
    /// Glob matched against repository-relative paths (default: "**/*.md")
    #[arg(short, long)]
    pub glob: Option<String>,
}

// -- Search --

#[derive(Debug, Parser)]
pub struct SearchArgs {
    /// The question to search for
    pub question: String,

    /// Minimum reranker score threshold
    #[arg(long)]
    pub min_score: Option<f32>,

    /// Output results as JSON
    #[arg(long)]
    pub json: bool,
}

// -- Completions --

#[derive(Debug, Parser)]
pub struct CompletionsArgs {
    /// Shell to generate completions for
    #[arg(value_enum)]
    pub shell: Shell,
}

impl CompletionsArgs {
    /// Generate shell completions and print to stdout.
    pub fn generate(&self) {
        let mut cmd = Cli::command();
        clap_complete::generate(self.shell, &mut cmd, "ask", &mut std::io::stdout());
    }
}

/// Insert the `ask` subcommand when the first argument is neither a known
/// subcommand nor a flag, so `ask "how do I build?"` works.
pub fn with_default_command<I>(args: I) -> Vec<OsString>
where
    I: IntoIterator,
    I::Item: Into<OsString>,
{
    let mut args: Vec<OsString> = args.into_iter().map(Into::into).collect();

    let Some(first) = args.get(1).and_then(|a| a.to_str()) else {
        return args;
    };
    if first.starts_with('-') {
        return args;
    }

    let cmd = Cli::command();
    let known = first == "help"
        || cmd
            .get_subcommands()
            .any(|sub| sub.get_name() == first || sub.get_all_aliases().any(|a| a == first));
    if !known {
        args.insert(1, OsString::from("ask"));
    }
    args
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::*;

    fn parse(args: &[&str]) -> Cli {
        Cli::parse_from(with_default_command(args.iter().copied()))
    }

    #[test]
    fn bare_question_defaults_to_ask() {
        let cli = parse(&["ask", "how do I install?"]);
        match cli.command {
            Command::Ask(args) => {
                assert_eq!(args.question, "how do I install?");
                assert_eq!(args.min_score, None);
            }
            other => panic!("expected ask command, got {other:?}"),
        }
    }

    #[test]
    fn explicit_subcommands_are_kept() {
        assert!(matches!(parse(&["ask", "clean"]).command, Command::Clean));
        assert!(matches!(
            parse(&["ask", "create"]).command,
            Command::Create(CreateArgs { glob: None })
        ));
    }

    #[test]
    fn flags_first_are_not_rewritten() {
        let args = with_default_command(["ask", "--data-dir", "/tmp/x"]);
        assert_eq!(args.len(), 3);
        assert_eq!(args[1], "--data-dir");
    }

    #[test]
    fn parse_create_with_glob_and_repo() {
        let cli = parse(&["ask", "create", "-g", "docs/**/*.md", "-r", "/src/repo"]);
        assert_eq!(cli.repo, Some(PathBuf::from("/src/repo")));
        match cli.command {
            Command::Create(args) => {
                assert_eq!(args.glob.as_deref(), Some("docs/**/*.md"));
            }
            other => panic!("expected create command, got {other:?}"),
        }
    }

    #[test]
    fn parse_search_defaults() {
        let cli = parse(&["ask", "search", "hello"]);
        match cli.command {
            Command::Search(args) => {
                assert_eq!(args.question, "hello");
                assert_eq!(args.min_score, None);
                assert!(!args.json);
            }
            other => panic!("expected search command, got {other:?}"),
        }
    }

    #[test]
    fn parse_search_with_threshold() {
        let cli = parse(&["ask", "search", "hello", "--min-score", "0.4", "--json"]);
        match cli.command {
            Command::Search(args) => {
                assert_eq!(args.min_score, Some(0.4));
                assert!(args.json);
            }
            other => panic!("expected search command, got {other:?}"),
        }
    }

    #[test]
    fn cli_definition_is_valid() {
        Cli::command().debug_assert();
    }
}
