use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Args, CommandFactory, Parser, Subcommand};
use mwapi_core::{CacheStore, CachedRequest, ClientConfig, Error, Params, Site, load_config};
use serde_json::Value;

const DEFAULT_CONFIG_PATH: &str = "mwapi.toml";

#[derive(Debug, Parser)]
#[command(name = "mwapi", version, about = "Command-line client for the MediaWiki Action API")]
struct Cli {
    #[arg(long, global = true, value_name = "PATH", help = "Config file (default: mwapi.toml)")]
    config: Option<PathBuf>,
    #[arg(long, global = true, value_name = "URL", help = "api.php URL (WIKI_API_URL wins)")]
    api_url: Option<String>,
    #[arg(
        long,
        global = true,
        value_name = "MINUTES",
        help = "Serve `query` from the response cache when younger than this"
    )]
    cache_ttl_minutes: Option<u64>,
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    #[command(about = "Send one request built from KEY=VALUE pairs and print the JSON reply")]
    Query(QueryArgs),
    #[command(about = "Follow continuation over a list module and print one item per line")]
    List(ListArgs),
    #[command(about = "Fetch page properties, merged across continuation")]
    Pages(PagesArgs),
    #[command(about = "Print module schemas from action=paraminfo")]
    Paraminfo(ParaminfoArgs),
    Cache(CacheArgs),
}

#[derive(Debug, Args)]
struct QueryArgs {
    #[arg(value_name = "KEY=VALUE", required = true)]
    params: Vec<String>,
}

#[derive(Debug, Args)]
struct ListArgs {
    module: String,
    #[arg(long, help = "Stop after this many items (0 or less: no limit)")]
    limit: Option<i64>,
    #[arg(long, value_delimiter = ',', help = "Namespace ids, comma separated")]
    namespace: Vec<i32>,
    #[arg(long, help = "Items requested per round trip")]
    increment: Option<usize>,
    #[arg(value_name = "KEY=VALUE", help = "Extra request parameters")]
    params: Vec<String>,
}

#[derive(Debug, Args)]
struct PagesArgs {
    #[arg(long, required = true, value_delimiter = ',', help = "Property modules, comma separated")]
    prop: Vec<String>,
    #[arg(long, required = true, num_args = 1.., help = "Page titles")]
    titles: Vec<String>,
    #[arg(long, help = "Stop after this many pages")]
    limit: Option<i64>,
}

#[derive(Debug, Args)]
struct ParaminfoArgs {
    #[arg(required = true)]
    modules: Vec<String>,
}

#[derive(Debug, Args)]
struct CacheArgs {
    #[command(subcommand)]
    command: CacheSubcommand,
}

#[derive(Debug, Subcommand)]
enum CacheSubcommand {
    Stats,
    Prune {
        #[arg(long, default_value_t = 24)]
        max_age_hours: u64,
    },
    Clear,
}

fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    env_logger::init();

    let cli = Cli::parse();
    let config = load_cli_config(&cli)?;

    match cli.command {
        Some(Commands::Query(args)) => run_query(config, cli.cache_ttl_minutes, args),
        Some(Commands::List(args)) => run_list(config, args),
        Some(Commands::Pages(args)) => run_pages(config, args),
        Some(Commands::Paraminfo(args)) => run_paraminfo(config, args),
        Some(Commands::Cache(CacheArgs { command })) => {
            let store = CacheStore::new(config.cache_dir());
            match command {
                CacheSubcommand::Stats => run_cache_stats(&store),
                CacheSubcommand::Prune { max_age_hours } => run_cache_prune(&store, max_age_hours),
                CacheSubcommand::Clear => run_cache_clear(&store),
            }
        }
        None => {
            let mut command = Cli::command();
            command.print_help()?;
            println!();
            Ok(())
        }
    }
}

fn load_cli_config(cli: &Cli) -> Result<ClientConfig> {
    let path = cli
        .config
        .clone()
        .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH));
    let mut config = load_config(&path)
        .with_context(|| format!("failed to load config {}", normalize_path(&path)))?;
    if let Some(api_url) = &cli.api_url {
        config.wiki.api_url = Some(api_url.clone());
    }
    if let Some(minutes) = cli.cache_ttl_minutes {
        config.cache.ttl_minutes = Some(minutes);
    }
    Ok(config)
}

fn open_site(config: ClientConfig) -> Result<Site> {
    Site::new(config).context("failed to create MediaWiki session")
}

fn run_query(config: ClientConfig, cache_ttl_minutes: Option<u64>, args: QueryArgs) -> Result<()> {
    let params = parse_pairs(&args.params)?;
    let ttl = config.cache_ttl();
    let mut site = open_site(config)?;
    let payload = match cache_ttl_minutes {
        Some(_) => {
            let mut request = CachedRequest::new(ttl, params);
            let payload = request.submit(&mut site)?;
            if let Some(cache_time) = request.cache_time {
                log::info!("served from cache written at {cache_time}");
            }
            payload
        }
        None => site.submit(params)?,
    };
    print_json(&payload)
}

fn run_list(config: ClientConfig, args: ListArgs) -> Result<()> {
    let params = parse_pairs(&args.params)?;
    let mut site = open_site(config)?;
    let mut generator = site
        .list_generator(&args.module, params)
        .with_context(|| format!("failed to prepare list={}", args.module))?;
    if let Some(limit) = args.limit {
        generator.set_maximum_items(limit);
    }
    if let Some(increment) = args.increment {
        generator.set_query_increment(increment);
    }
    if !args.namespace.is_empty() {
        generator.set_namespace(&args.namespace)?;
    }

    let mut count = 0usize;
    for item in generator {
        println!("{}", serde_json::to_string(&item?)?);
        count += 1;
    }
    eprintln!("items: {count}");
    Ok(())
}

fn run_pages(config: ClientConfig, args: PagesArgs) -> Result<()> {
    let mut site = open_site(config)?;
    let modules = args.prop.iter().map(String::as_str).collect::<Vec<_>>();
    let mut generator = site
        .property_generator(&modules, Params::new().with("titles", args.titles))
        .with_context(|| format!("failed to prepare prop={}", args.prop.join("|")))?;
    if let Some(limit) = args.limit {
        generator.set_maximum_items(limit);
    }
    for page in generator {
        println!("{}", serde_json::to_string(&page?)?);
    }
    Ok(())
}

fn run_paraminfo(config: ClientConfig, args: ParaminfoArgs) -> Result<()> {
    let mut site = open_site(config)?;
    let modules = args.modules.iter().map(String::as_str).collect::<Vec<_>>();
    site.paraminfo_fetch(&modules)
        .context("failed to load module schemas")?;

    let mut missing = Vec::new();
    for module in &modules {
        match site.paraminfo().get(module) {
            Ok(info) => println!("{}", serde_json::to_string_pretty(info)?),
            Err(Error::NotFound(_)) => missing.push(*module),
            Err(error) => return Err(error.into()),
        }
    }
    if !missing.is_empty() {
        bail!("unknown modules: {}", missing.join(", "));
    }
    Ok(())
}

fn run_cache_stats(store: &CacheStore) -> Result<()> {
    let stats = store.stats()?;
    println!("cache stats");
    println!("dir: {}", normalize_path(store.dir()));
    println!("entries: {}", stats.entries);
    println!("bytes: {}", stats.bytes);
    Ok(())
}

fn run_cache_prune(store: &CacheStore, max_age_hours: u64) -> Result<()> {
    let removed = store.prune(Duration::from_secs(max_age_hours.saturating_mul(3600)))?;
    println!("removed: {removed}");
    Ok(())
}

fn run_cache_clear(store: &CacheStore) -> Result<()> {
    let removed = store.clear()?;
    println!("removed: {removed}");
    Ok(())
}

fn parse_pairs(pairs: &[String]) -> Result<Params> {
    let mut params = Params::new();
    for pair in pairs {
        let Some((key, value)) = pair.split_once('=') else {
            bail!("expected KEY=VALUE, got `{pair}`");
        };
        if key.is_empty() {
            bail!("empty parameter name in `{pair}`");
        }
        params.insert(key, value);
    }
    Ok(params)
}

fn print_json(value: &Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn normalize_path(path: &Path) -> String {
    path.to_string_lossy().replace('\\', "/")
}
