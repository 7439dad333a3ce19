mod app;
mod autoapply;
mod config;
mod dom;
mod engine;
mod filter;
mod layout;
mod locate;
mod logging;
mod message;
mod page;
mod picker;
mod replace;
mod rules;
mod selector;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};

use crate::config::Config;
use crate::engine::Engine;
use crate::page::Page;
use crate::rules::{FileStorage, RuleStore};

#[derive(Parser)]
#[command(name = "retext", version, about = "Pick text on a page and replace it, per site")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// HTML or Markdown page to open
    page: Option<PathBuf>,

    /// Site identifier for the page (default: its canonical URL host)
    #[arg(long, global = true)]
    site: Option<String>,

    /// Rule storage file (default: from config)
    #[arg(long, global = true)]
    store: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Commands {
    /// Open the config file in $EDITOR
    Config,
    /// Print the page text with saved rules applied
    Apply {
        page: PathBuf,
        /// Page width used for wrapping
        #[arg(long, default_value_t = page::DEFAULT_WIDTH)]
        width: usize,
    },
    /// Send one JSON request to the page's engine and print the response
    Message { page: PathBuf, request: String },
    /// Manage saved rules
    Rules {
        #[command(subcommand)]
        command: RuleCommands,
    },
}

#[derive(Subcommand)]
enum RuleCommands {
    /// List rules with their indices
    List,
    /// Delete the rule at an index
    Delete { index: usize },
    /// Delete all rules (or only those of --site)
    Clear,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let cfg = config::load_config()?;
    if let Err(err) = logging::init_tracing(&cfg.log_level) {
        eprintln!("Logging disabled: {err:#}");
    }
    let store_path = resolve_store_path(cli.store.as_deref(), &cfg)?;

    if let Some(command) = cli.command {
        return match command {
            Commands::Config => config::open_config_in_editor(),
            Commands::Apply { page, width } => {
                let mut page = inject(&page, cli.site.as_deref())?;
                let mut engine = Engine::new(&page.site, Box::new(FileStorage::new(&store_path)));
                engine.init(&mut page.document)?;
                page.document.reflow(width.max(1));
                for line in layout::plain_lines(&page.document, page.document.layout()) {
                    println!("{line}");
                }
                Ok(())
            }
            Commands::Message { page, request } => {
                let request: message::Request = serde_json::from_str(&request)
                    .with_context(|| format!("Invalid request: {request}"))?;
                let mut page = inject(&page, cli.site.as_deref())?;
                let mut engine = Engine::new(&page.site, Box::new(FileStorage::new(&store_path)));
                engine.init(&mut page.document)?;
                let response = engine.handle_request(&mut page.document, request);
                println!("{}", serde_json::to_string(&response)?);
                Ok(())
            }
            Commands::Rules { command } => run_rules(command, cli.site.as_deref(), &store_path),
        };
    }

    let path = cli
        .page
        .ok_or_else(|| anyhow::anyhow!("No page provided. Try `retext <page.html>`."))?;
    let page = inject(&path, cli.site.as_deref())?;
    app::run_app(page, store_path, cfg)
}

fn resolve_store_path(flag: Option<&Path>, cfg: &Config) -> Result<PathBuf> {
    match (flag, &cfg.store_path) {
        (Some(path), _) => Ok(path.to_path_buf()),
        (None, Some(path)) => Ok(path.clone()),
        (None, None) => FileStorage::default_path(),
    }
}

/// Builds the content tree for a page, reporting failures the way the
/// viewer does.
fn inject(path: &Path, site: Option<&str>) -> Result<Page> {
    Page::load(path, site).map_err(|err| anyhow::anyhow!("Injection failed: {err:#}"))
}

fn run_rules(command: RuleCommands, site: Option<&str>, store_path: &Path) -> Result<()> {
    let mut store = RuleStore::new(Box::new(FileStorage::new(store_path)));
    store.load()?;
    match command {
        RuleCommands::List => {
            let rules: Vec<_> = match site {
                Some(site) => store.for_site(site).collect(),
                None => store.rules().iter().enumerate().collect(),
            };
            if rules.is_empty() {
                println!("No saved replacements.");
            }
            for (index, rule) in rules {
                let site = if rule.site.is_empty() { "(local)" } else { rule.site.as_str() };
                println!(
                    "{index}\t{site}\t{}\t\"{}\" -> \"{}\"",
                    rule.selector, rule.original, rule.replacement
                );
            }
        }
        RuleCommands::Delete { index } => match store.remove(index)? {
            Some(rule) => println!("Deleted \"{}\" -> \"{}\"", rule.original, rule.replacement),
            None => anyhow::bail!("No rule at index {index}"),
        },
        RuleCommands::Clear => {
            let removed = store.clear(site)?;
            println!("Deleted {removed} rule(s)");
        }
    }
    Ok(())
}
