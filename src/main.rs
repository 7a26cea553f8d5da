use std::{
    error::Error as _,
    io::Write,
    path::{Path, PathBuf},
    process::ExitCode,
};

use ask_the_code::{
    DataDir,
    Error,
    Result,
    Settings,
    index::Indexer,
    llm,
    model_manager::{ModelManager, SharedModel},
    reranker::ColbertReranker,
    search::{self, DocSource, Retriever},
    store::{self, AnyStore},
    walker,
};
use clap::Parser;
use kdam::{BarExt, tqdm};
use tracing_subscriber::EnvFilter;

mod cli;

use cli::{AskArgs, Cli, Command, CreateArgs, SearchArgs};

fn init_tracing(verbose: u8, quiet: bool) {
    let filter = if let Ok(env) = std::env::var("ASK_LOG") {
        EnvFilter::new(env)
    } else if quiet {
        EnvFilter::new("warn")
    } else {
        match verbose {
            0 => EnvFilter::new("info"),
            1 => EnvFilter::new("debug"),
            _ => EnvFilter::new("trace"),
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .without_time()
        .init();
}

/// Exit quietly on Ctrl-C instead of dying mid-line.
///
/// Batches already upserted stay committed; the interrupted one is never
/// committed.
fn install_interrupt_handler() {
    std::thread::spawn(|| {
        let runtime = match tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
        {
            Ok(runtime) => runtime,
            Err(e) => {
                tracing::warn!("cannot install Ctrl-C handler: {e}");
                return;
            }
        };

        if runtime.block_on(tokio::signal::ctrl_c()).is_ok() {
            eprintln!("\nAborted.");
            std::process::exit(130);
        }
    });
}

fn main() -> ExitCode {
    let cli = Cli::parse_from(cli::with_default_command(std::env::args_os()));
    init_tracing(cli.verbose, cli.quiet);
    install_interrupt_handler();

    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            report(&e);
            ExitCode::FAILURE
        }
    }
}

fn report(err: &Error) {
    if let Error::CollectionNotFound { .. } = err {
        eprintln!("error: {err}, run `ask create` to create the collection");
        return;
    }

    eprintln!("error: {err}");
    let mut source = err.source();
    while let Some(cause) = source {
        eprintln!("  caused by: {cause}");
        source = cause.source();
    }
}

fn run(cli: Cli) -> Result<()> {
    if let Command::Completions(args) = &cli.command {
        args.generate();
        return Ok(());
    }

    let data_dir = DataDir::resolve(cli.data_dir.as_deref())?;

    match cli.command {
        Command::Completions(_) => Ok(()),
        Command::Clean => {
            data_dir.clean()?;
            eprintln!("Removed {}", data_dir.root().display());
            Ok(())
        }
        Command::Ask(args) => {
            let session = Session::open(&data_dir, cli.repo)?;
            cmd_ask(&session, &args)
        }
        Command::Create(args) => {
            let session = Session::open(&data_dir, cli.repo)?;
            cmd_create(&session, &args)
        }
        Command::Search(args) => {
            let session = Session::open(&data_dir, cli.repo)?;
            cmd_search(&session, &args)
        }
    }
}

/// Everything a repository-scoped command needs, resolved once.
struct Session {
    settings: Settings,
    root: PathBuf,
    model: SharedModel,
    store: AnyStore,
}

impl Session {
    fn open(data_dir: &DataDir, repo: Option<PathBuf>) -> Result<Self> {
        let settings = Settings::load(&data_dir.settings_file())?;
        let start = match repo {
            Some(path) => path,
            None => std::env::current_dir()?,
        };
        let root = walker::working_path(&start)?;
        let model = ModelManager::shared(&settings.reranker_model);
        let store = store::open_store(&settings, data_dir, &model)?;

        tracing::debug!(
            root = %root.display(),
            store = %settings.store,
            llm = %settings.llm,
            "session ready"
        );
        Ok(Self {
            settings,
            root,
            model,
            store,
        })
    }

    fn root(&self) -> &Path {
        &self.root
    }

    fn retrieve(&self, question: &str, min_score: Option<f32>) -> Result<Vec<DocSource>> {
        let reranker = ColbertReranker::shared(self.model.clone());
        let retriever = Retriever::new(
            &self.store,
            &reranker,
            store::collection_name(self.root()),
        );
        retriever.search(question, min_score.unwrap_or(self.settings.min_score))
    }
}

fn cmd_ask(session: &Session, args: &AskArgs) -> Result<()> {
    let sources = session.retrieve(&args.question, args.min_score)?;
    if sources.is_empty() {
        tracing::warn!("no relevant sections found; answering without sources");
    }

    let generator = llm::open_generator(&session.settings)?;
    let mut stdout = std::io::stdout().lock();
    for fragment in llm::answer(&generator, &sources, &args.question)? {
        stdout.write_all(fragment?.as_bytes())?;
        stdout.flush()?;
    }
    writeln!(stdout)?;
    Ok(())
}

fn cmd_create(session: &Session, args: &CreateArgs) -> Result<()> {
    let glob = args.glob.as_deref().unwrap_or(&session.settings.glob);
    let indexer = Indexer::new(&session.store, session.root(), glob);
    let progress = indexer.create()?;

    let mut pb = tqdm!(total = progress.total(), desc = "Indexing", leave = false);
    let mut files = 0;
    let mut sections = 0;
    for marker in progress {
        let marker = marker?;
        tracing::debug!(path = %marker.path, sections = marker.sections, "indexed");
        files += 1;
        sections += marker.sections;
        pb.update(1)?;
    }

    eprintln!(
        "Indexing complete: {files} file(s), {sections} section(s) in {}",
        indexer.collection()
    );
    Ok(())
}

fn cmd_search(session: &Session, args: &SearchArgs) -> Result<()> {
    let results = session.retrieve(&args.question, args.min_score)?;

    if args.json {
        println!("{}", search::format_json(&results, &args.question)?);
    } else {
        print!("{}", search::format_human(&results));
    }
    Ok(())
}
