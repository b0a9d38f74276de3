use std::path::Path;

use anyhow::{Context, bail};
use clap::{ArgAction, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use kudos::config::{Config, EngineConfig};
use kudos::consts::default_db_path;
use kudos::engine::reaction::ReactionEngine;
use kudos::engine::{Engine, Stores};
use kudos::model::{Aggregate, EntityRef, Scope};

#[derive(Parser)]
#[command(name = "kudos", version, about = "Weighted reaction counts that add up.")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    /// SQLite database path (use :memory: for ephemeral)
    #[arg(short, long, global = true)]
    db: Option<String>,

    /// Log more (-v info, -vv debug). RUST_LOG overrides.
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Command {
    /// Read or change engine settings
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
    #[command(flatten)]
    Engine(EngineCommand),
}

/// Commands that run against a started engine.
#[derive(Subcommand)]
enum EngineCommand {
    /// Manage reaction types
    Type {
        #[command(subcommand)]
        action: TypeAction,
    },
    /// Record a reaction, e.g. `kudos react User:1 Post:7 Like`
    React {
        reacter: EntityRef,
        reactant: EntityRef,
        type_name: String,
    },
    /// Remove a reaction
    Unreact {
        reacter: EntityRef,
        reactant: EntityRef,
        type_name: String,
    },
    /// Show a reactant's aggregates
    Show {
        reactant: EntityRef,
        /// Only this reaction type's scope
        #[arg(long = "type")]
        type_name: Option<String>,
    },
    /// Rebuild aggregates from stored reactions
    Recount {
        /// A single reactant; omit to recount every known reactant
        reactant: Option<EntityRef>,
        /// Limit a full recount to reactants with this type tag
        #[arg(long, conflicts_with = "reactant")]
        reactant_type: Option<String>,
        /// Only reactants flagged stale by a weight change
        #[arg(long, conflicts_with_all = ["reactant", "reactant_type", "dead_letters"])]
        stale: bool,
        /// Only reactants with dead-lettered updates, then resolve them
        #[arg(long, conflicts_with_all = ["reactant", "reactant_type"])]
        dead_letters: bool,
    },
    /// List aggregate updates that exhausted their retries
    DeadLetters,
}

#[derive(Subcommand)]
enum TypeAction {
    /// Register a reaction type
    Add {
        /// Type name, e.g. `Like`
        #[arg(required_unless_present = "defaults")]
        name: Option<String>,
        /// Contribution of one reaction to the weight total
        #[arg(short, long, default_value_t = 1, allow_hyphen_values = true)]
        weight: i64,
        /// Register without accepting new reactions
        #[arg(long)]
        inactive: bool,
        /// Register the default Like (+1) and Dislike (-1) types
        #[arg(long, conflicts_with_all = ["name", "inactive"])]
        defaults: bool,
    },
    /// Change a type's weight; affected reactants become stale
    Weight {
        name: String,
        #[arg(allow_hyphen_values = true)]
        weight: i64,
    },
    /// List registered types
    List,
}

#[derive(Subcommand)]
enum ConfigAction {
    Get { key: String },
    Set { key: String, value: String },
    Unset { key: String },
    List,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    let db = match cli.db {
        Some(db) => db,
        None => {
            let path = default_db_path().context("cannot determine home directory")?;
            if let Some(dir) = path.parent() {
                std::fs::create_dir_all(dir)
                    .with_context(|| format!("failed to create {}", dir.display()))?;
            }
            path.to_string_lossy().into_owned()
        }
    };

    let settings = Config::open(&db)?;
    let command = match cli.command {
        Command::Config { action } => return handle_config(&settings, &action),
        Command::Engine(command) => command,
    };

    let config = EngineConfig::load(&settings)?;
    let stores = Stores::sqlite(&db, &config).context("failed to open stores")?;
    let engine = ReactionEngine::start(stores, config);
    engine
        .recover()
        .await
        .context("failed to replay pending facts")?;

    let outcome = run(&engine, command, &db).await;
    engine.shutdown().await;
    outcome
}

fn init_tracing(verbose: u8) {
    let default = match verbose {
        0 => "kudos=warn",
        1 => "kudos=info",
        _ => "kudos=debug",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

async fn run(engine: &ReactionEngine, command: EngineCommand, db: &str) -> anyhow::Result<()> {
    match command {
        EngineCommand::Type { action } => handle_type(engine, action).await,
        EngineCommand::React {
            reacter,
            reactant,
            type_name,
        } => {
            let id = engine.react(&reacter, &reactant, &type_name).await?;
            engine.settle().await;
            println!("✓ {reacter} reacted {type_name} to {reactant} ({id})");
            print_aggregate(&reactant, &engine.get_aggregate(&reactant, &Scope::All).await?);
            Ok(())
        }
        EngineCommand::Unreact {
            reacter,
            reactant,
            type_name,
        } => {
            engine.unreact(&reacter, &reactant, &type_name).await?;
            engine.settle().await;
            println!("✓ {reacter} removed {type_name} from {reactant}");
            print_aggregate(&reactant, &engine.get_aggregate(&reactant, &Scope::All).await?);
            Ok(())
        }
        EngineCommand::Show {
            reactant,
            type_name,
        } => {
            engine.settle().await;
            let scopes = match type_name {
                Some(name) => vec![Scope::Type(name)],
                None => std::iter::once(Scope::All)
                    .chain(
                        engine
                            .list_types()
                            .await?
                            .into_iter()
                            .map(|t| Scope::Type(t.name)),
                    )
                    .collect(),
            };
            for scope in &scopes {
                let aggregate = engine.get_aggregate(&reactant, scope).await?;
                if scope == &Scope::All || aggregate.count > 0 {
                    print_aggregate(&reactant, &aggregate);
                }
            }
            Ok(())
        }
        EngineCommand::Recount {
            reactant,
            reactant_type,
            stale,
            dead_letters,
        } => {
            engine.settle().await;
            if stale {
                let n = engine.recount_stale().await?;
                println!("✓ recounted {n} stale reactant(s)");
            } else if dead_letters {
                let n = engine.recount_dead_letters().await?;
                println!("✓ recounted {n} reactant(s) with dead-lettered updates");
            } else if let Some(reactant) = reactant {
                engine.recount(&reactant).await?;
                print_aggregate(&reactant, &engine.get_aggregate(&reactant, &Scope::All).await?);
            } else {
                let n = engine.recount_all(reactant_type.as_deref()).await?;
                println!("✓ recounted {n} reactant(s) in {}", display_db(db));
            }
            Ok(())
        }
        EngineCommand::DeadLetters => {
            engine.settle().await;
            let letters = engine.dead_letters().await?;
            if letters.is_empty() {
                println!("no dead letters");
            }
            for letter in letters {
                println!(
                    "#{} {} {} {} ({} attempts, {}): {}",
                    letter.id,
                    letter.failed_at.format("%Y-%m-%d %H:%M:%S"),
                    letter.fact.reactant(),
                    letter.listener,
                    letter.attempts,
                    letter.fact.reaction.type_name,
                    letter.error
                );
            }
            Ok(())
        }
    }
}

async fn handle_type(engine: &ReactionEngine, action: TypeAction) -> anyhow::Result<()> {
    match action {
        TypeAction::Add {
            name,
            weight,
            inactive,
            defaults,
        } => {
            if defaults {
                let added = engine.register_defaults().await?;
                if added.is_empty() {
                    println!("default types already registered");
                }
                for t in added {
                    println!("✓ added {} (weight {})", t.name, t.weight);
                }
                return Ok(());
            }
            let Some(name) = name else {
                bail!("a type name is required unless --defaults is given");
            };
            let t = engine.register_type(&name, weight, !inactive).await?;
            println!(
                "✓ added {} (weight {}{})",
                t.name,
                t.weight,
                if t.active { "" } else { ", inactive" }
            );
        }
        TypeAction::Weight { name, weight } => {
            let stale = engine.set_type_weight(&name, weight).await?;
            println!("✓ {name} now weighs {weight}");
            if stale > 0 {
                println!("  {stale} reactant(s) are stale; run `kudos recount --stale`");
            }
        }
        TypeAction::List => {
            let types = engine.list_types().await?;
            if types.is_empty() {
                println!("no reaction types; try `kudos type add --defaults`");
            }
            for t in types {
                println!(
                    "  {:<16} {:>6}{}",
                    t.name,
                    t.weight,
                    if t.active { "" } else { "  (inactive)" }
                );
            }
        }
    }
    Ok(())
}

fn handle_config(settings: &Config, action: &ConfigAction) -> anyhow::Result<()> {
    match action {
        ConfigAction::Get { key } => match settings.get(key)? {
            Some(value) => println!("{value}"),
            None => println!("(default)"),
        },
        ConfigAction::Set { key, value } => {
            EngineConfig::update(settings, key, value)?;
            println!("✓ {key} = {value}");
        }
        ConfigAction::Unset { key } => {
            settings.remove(key)?;
            println!("✓ {key} reset to default");
        }
        ConfigAction::List => {
            for (key, value) in settings.list()? {
                println!("{key} = {value}");
            }
        }
    }
    Ok(())
}

fn print_aggregate(reactant: &EntityRef, aggregate: &Aggregate) {
    println!(
        "  {reactant} [{}] count={} weight={}{}",
        aggregate.scope,
        aggregate.count,
        aggregate.weight,
        if aggregate.stale { " (stale)" } else { "" }
    );
}

fn display_db(db: &str) -> String {
    if db == ":memory:" {
        "ephemeral store".to_string()
    } else {
        Path::new(db).display().to_string()
    }
}
