use std::path::PathBuf;

use anyhow::{Context as _, bail};
use clap::{Parser, Subcommand};

use treemake::config::Context;
use treemake::provenance::Opinion;
use treemake::spec::GraphSpec;
use treemake::{Digest, Tree};

pub type Result<T> = anyhow::Result<T>;

#[derive(Parser)]
#[command(name = "treemake")]
#[command(about = "Incremental content-addressed builds", long_about = None)]
struct Cli {
    /// Project root; state lives under <root>/.treemake by default.
    #[arg(long, global = true, default_value = ".")]
    root: PathBuf,

    #[arg(long, global = true, env = "TREEMAKE_STORE")]
    store: Option<PathBuf>,

    #[arg(long, global = true, env = "TREEMAKE_LOG")]
    log: Option<PathBuf>,

    /// Acting user for recorded runs and opinions.
    #[arg(long, global = true)]
    user: Option<String>,

    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    cmd: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build targets of a graph file and restore them under the output directory.
    Make {
        #[arg(long)]
        graph: PathBuf,

        /// `task` or `task:output`; defaults to the graph file's targets.
        targets: Vec<String>,

        #[arg(short = 'o', long, default_value = "out")]
        out: PathBuf,
    },
    /// Print the tree of a file or directory without storing it.
    Describe { path: PathBuf },
    /// Store a file or directory and print its tree.
    Store { path: PathBuf },
    /// Restore a tree (as printed by `store`) at a new location.
    Restore { tree: String, dst: PathBuf },
    /// Rehash every stored blob.
    Fsck,
    /// List recorded results for a calc.
    Candidates { calc: String },
    Trust { calc: String, result: String },
    Distrust { calc: String, result: String },
    /// Remove your opinion on a result.
    Forget { calc: String, result: String },
}

fn context(cli: &Cli) -> Result<Context> {
    let mut ctx = Context::from_root(&cli.root)?;
    if let Some(store) = &cli.store {
        ctx = ctx.with_store(store);
    }
    if let Some(log) = &cli.log {
        ctx = ctx.with_log(log);
    }
    if let Some(user) = &cli.user {
        ctx = ctx.with_user(user.as_str())?;
    }
    Ok(ctx)
}

fn digest(raw: &str) -> Result<Digest> {
    Digest::parse(raw).with_context(|| format!("`{raw}` is not a digest"))
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut logger = env_logger::Builder::from_default_env();
    if cli.verbose {
        logger.filter_level(log::LevelFilter::Debug);
    }
    logger.init();

    let ctx = context(&cli)?;
    log::debug!("context: {ctx:?}");

    match &cli.cmd {
        Commands::Make {
            graph,
            targets,
            out,
        } => {
            let validated = GraphSpec::load(graph)?.validate_and_build()?;
            let requested = validated.select(targets)?;
            let mut env = ctx.local_env()?.deliver_to(ctx.root.join(out));
            let log = ctx.open_log()?;
            let report = treemake::make(&requested, &mut env, &log, &ctx.user)?;
            print_json(&report)?;
        }
        Commands::Describe { path } => {
            print_json(&ctx.open_storage()?.describe(path)?)?;
        }
        Commands::Store { path } => {
            print_json(&ctx.open_storage()?.store(path)?)?;
        }
        Commands::Restore { tree, dst } => {
            let tree: Tree = serde_json::from_str(tree).context("parsing tree")?;
            ctx.open_storage()?.restore(&tree, dst)?;
            println!("Restored {} to {}", tree.digest(), dst.display());
        }
        Commands::Fsck => {
            let corrupt = ctx.open_storage()?.fsck()?;
            if !corrupt.is_empty() {
                for digest in &corrupt {
                    println!("{digest}");
                }
                bail!("{} corrupt blob(s)", corrupt.len());
            }
            println!("All blobs intact");
        }
        Commands::Candidates { calc } => {
            print_json(&ctx.open_log()?.candidates(&digest(calc)?)?)?;
        }
        Commands::Trust { calc, result } | Commands::Distrust { calc, result } => {
            let opinion = match &cli.cmd {
                Commands::Trust { .. } => Opinion::Trust,
                _ => Opinion::Distrust,
            };
            ctx.open_log()?
                .set_opinion(&digest(calc)?, &digest(result)?, &ctx.user, opinion)?;
        }
        Commands::Forget { calc, result } => {
            ctx.open_log()?
                .clear_opinion(&digest(calc)?, &digest(result)?, &ctx.user)?;
        }
    }

    Ok(())
}
