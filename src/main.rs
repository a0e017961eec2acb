use askflow::business::{BusinessAnswer, SchemaInfo};
use askflow::cli::{Cli, Commands, ConfigAction, ReloadTarget};
use askflow::config::{expand_tilde, Config};
use askflow::engine::{Answer, EngineStats, KnowledgeEngine, Query};
use askflow::error::{AskflowError, Result};
use askflow::lexicon::LEXICON_TEMPLATE;
use askflow::retrieval::CallerIdentity;
use serde::Serialize;
use std::path::{Path, PathBuf};

fn main() -> Result<()> {
    let cli = Cli::parse_args();

    init_logging(cli.verbose);

    let runtime = tokio::runtime::Runtime::new().map_err(|e| AskflowError::Io {
        source: e,
        context: "Failed to create tokio runtime".to_string(),
    })?;

    runtime.block_on(run(cli))
}

fn init_logging(verbose: bool) {
    use tracing_subscriber::{fmt, EnvFilter};

    let fallback = if verbose { "askflow=debug" } else { "askflow=info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));

    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}

async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Ask {
            question,
            session,
            user,
            department,
            domain,
            tier,
            json,
        } => {
            let engine = open_engine(cli.config, cli.profile).await?;

            let session = session.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
            let mut query =
                Query::new(question, session).with_caller(CallerIdentity::new(user, department));
            if let Some(domain) = domain {
                query = query.with_domain(domain.parse().map_err(AskflowError::Config)?);
            }
            if let Some(tier) = tier {
                query = query.with_tier(tier.parse().map_err(AskflowError::Config)?);
            }

            let answer = engine.ask(query).await?;
            if json {
                print_json(&answer)?;
            } else {
                print_answer(&answer);
            }
        }
        Commands::Business { question, json } => {
            let engine = open_engine(cli.config, cli.profile).await?;
            let analysis = engine.business_query(&question).await?;
            if json {
                print_json(&analysis)?;
            } else {
                print_business(&analysis);
            }
        }
        Commands::Schema { json } => {
            let engine = open_engine(cli.config, cli.profile).await?;
            let schema = engine.schema_info().await?;
            if json {
                print_json(&schema)?;
            } else {
                print_schema(&schema);
            }
        }
        Commands::Stats { json } => {
            let engine = open_engine(cli.config, cli.profile).await?;
            let stats = engine.quick_stats().await;
            if json {
                print_json(&stats)?;
            } else {
                print_stats(&stats);
            }
        }
        Commands::Reload { target } => {
            let config = load_config(cli.config, cli.profile)?;
            let engine = KnowledgeEngine::builder(config).build()?;

            if matches!(target, ReloadTarget::Index | ReloadTarget::All) {
                let report = engine.reload_index().await?;
                println!(
                    "✓ Index reloaded: {} documents, {} chunks",
                    report.documents, report.chunks
                );
            }
            if matches!(target, ReloadTarget::Business | ReloadTarget::All) {
                let report = engine.reload_business_data().await?;
                println!("✓ Business data reloaded: {} records", report.records);
            }
        }
        Commands::Config { action } => {
            cmd_config(cli.config, cli.profile, action)?;
        }
    }

    Ok(())
}

async fn open_engine(config_path: Option<PathBuf>, profile: Option<String>) -> Result<KnowledgeEngine> {
    let config = load_config(config_path, profile)?;
    let engine = KnowledgeEngine::builder(config).build()?;
    engine.initialize().await?;
    Ok(engine)
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let json = serde_json::to_string_pretty(value).map_err(|e| AskflowError::Json {
        source: e,
        context: "Failed to serialize output".to_string(),
    })?;
    println!("{}", json);
    Ok(())
}

fn print_answer(answer: &Answer) {
    println!("{}", answer.answer);

    if !answer.sources.is_empty() {
        println!("\nSources:");
        for (i, source) in answer.sources.iter().enumerate() {
            println!("  [{}] {} ({})", i + 1, source.doc_name, source.scope);
        }
    }

    if !answer.notes.is_empty() {
        println!("\nNotes:");
        for note in &answer.notes {
            println!("  - {}", note);
        }
    }

    println!(
        "\nDomain: {} | Tier: {} | Cache: {:?}",
        answer.source_type, answer.tier_used, answer.cache_origin
    );
}

fn print_business(analysis: &BusinessAnswer) {
    println!("{}", analysis.answer);

    if !analysis.notes.is_empty() {
        println!("\nNotes:");
        for note in &analysis.notes {
            println!("  - {}", note);
        }
    }

    println!(
        "\nMode: {:?} | Attempts: {} | Stages: {:?}",
        analysis.mode, analysis.attempts, analysis.stages
    );
    if let Some(plan) = &analysis.plan {
        println!("Plan: {}", plan.signature());
    }
}

fn print_schema(schema: &SchemaInfo) {
    println!("Business Dataset");
    println!("================");
    println!("{}", schema.describe());
}

fn print_stats(stats: &EngineStats) {
    println!("Askflow Stats");
    println!("=============");

    match &stats.dataset {
        Some(dataset) => {
            println!("\nBusiness data: {} records", dataset.total_records);
            println!("  Last 30 days:     {}", dataset.recent_30_days);
            println!("  Active workers:   {}", dataset.active_workers);
            println!("  Active customers: {}", dataset.active_customers);
            for (branch, count) in &dataset.by_branch {
                println!("  {}: {}", branch, count);
            }
        }
        None => println!("\nBusiness data: not loaded"),
    }

    match &stats.index {
        Some(index) => {
            println!(
                "\nIndex: {} documents, {} chunks ({} embedded)",
                index.documents, index.chunks, index.embedded_chunks
            );
            for (scope, counts) in &index.by_scope {
                println!("  {}: {} documents, {} chunks", scope, counts.documents, counts.chunks);
            }
        }
        None => println!("\nIndex: not loaded"),
    }

    let cache = &stats.cache;
    println!(
        "\nCache: {} (entries {}, hits {}, misses {}, coalesced {}, hit rate {:.1}%)",
        if cache.enabled { "enabled" } else { "disabled" },
        cache.entry_count,
        cache.hits,
        cache.misses,
        cache.coalesced,
        cache.hit_rate * 100.0
    );
}

fn cmd_config(config_path: Option<PathBuf>, profile: Option<String>, action: ConfigAction) -> Result<()> {
    match action {
        ConfigAction::Show { section } => {
            let config = load_config(config_path, profile)?;
            let value = serde_json::to_value(&config).map_err(|e| AskflowError::Json {
                source: e,
                context: "Failed to serialize config".to_string(),
            })?;

            match section {
                Some(section) => {
                    let part = value.get(&section).ok_or_else(|| {
                        AskflowError::Config(format!("Unknown configuration section: {}", section))
                    })?;
                    print_json(part)?;
                }
                None => print_json(&value)?,
            }
        }
        ConfigAction::Validate { file } => {
            let path = match file.or(config_path) {
                Some(path) => path,
                None => Config::default_path()?,
            };
            let config = Config::load(&path)?;
            println!("✓ Configuration is valid");
            println!("  Schema version: {}", config.meta.schema_version);
        }
        ConfigAction::Init { force } => {
            let path = match config_path {
                Some(path) => path,
                None => Config::default_path()?,
            };

            if path.exists() && !force {
                println!("Configuration file already exists at: {}", path.display());
                println!("Use --force to overwrite");
                return Ok(());
            }

            let config_dir = path
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or_else(|| PathBuf::from("."));
            std::fs::create_dir_all(&config_dir).map_err(|e| AskflowError::Io {
                source: e,
                context: format!("Failed to create config directory: {:?}", config_dir),
            })?;

            let lexicon_path = config_dir.join("lexicon.toml");
            write_template(&lexicon_path, LEXICON_TEMPLATE, force)?;

            let mut config = Config::default();
            config.storage.lexicon_file = Some(lexicon_path.clone());
            config.save(&path)?;

            let data_dir = expand_tilde(&config.storage.data_dir);
            println!("✓ Configuration initialized at: {}", path.display());
            println!("✓ Lexicon installed at: {}", lexicon_path.display());
            println!("  Place chunks.jsonl under {}/index", data_dir.display());
            println!("  Place clean_business.csv under {}/business", data_dir.display());
        }
        ConfigAction::Path => {
            let path = match config_path {
                Some(path) => path,
                None => Config::default_path()?,
            };
            println!("{}", path.display());
        }
    }

    Ok(())
}

fn load_config(config_path: Option<PathBuf>, profile: Option<String>) -> Result<Config> {
    let path = match config_path {
        Some(path) => path,
        None => Config::default_path()?,
    };

    if !path.exists() {
        tracing::warn!("Config file not found, using defaults. Run 'askflow config init' to create one.");
        let mut config = Config::default();
        config.apply_env_overrides();
        if let Some(profile) = profile {
            config.apply_profile(&profile)?;
        }
        return Ok(config);
    }

    match profile {
        Some(profile) => Config::load_with_profile(&path, &profile),
        None => Config::load(&path),
    }
}

fn write_template(path: &Path, content: &str, force: bool) -> Result<()> {
    if path.exists() && !force {
        return Ok(());
    }
    std::fs::write(path, content).map_err(|e| AskflowError::Io {
        source: e,
        context: format!("Failed to write {:?}", path),
    })
}
