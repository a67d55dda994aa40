use std::fs;
use std::io::{self, Read};
use std::path::PathBuf;

use anyhow::{anyhow, bail, Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use serde_json::json;
use tracing::{debug, warn};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

use bookcache::config::{self, Config};
use bookcache::{
    BookCache, BookCursor, CursorOrigin, MetaFields, OfflineState, Record, RecordStore,
    SearchContent, SortKey, StepFlags,
};

#[derive(Parser, Debug)]
#[command(name = "bookcache", version, about = "Offline address book cache")]
struct Cli {
    /// Configuration file (default: <config dir>/bookcache/config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Cache database, overriding the configuration
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    /// Log at debug level unless RUST_LOG says otherwise
    #[arg(long, short = 'v', global = true, default_value_t = false)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Store a record
    Put(PutArgs),
    /// Remove a record
    Remove(RemoveArgs),
    /// Print one record
    Get(GetArgs),
    /// Search records with an s-expression
    Search(SearchArgs),
    /// List or clear local changes not yet synced
    Changes(ChangesArgs),
    /// Print one page of a sorted cursor
    Browse(BrowseArgs),
    /// Read or write metadata keys
    #[command(subcommand)]
    Keys(KeysCommand),
}

#[derive(Args, Debug)]
struct PutArgs {
    /// Record uid; a random one is generated when omitted
    #[arg(long)]
    uid: Option<String>,

    /// Record body; `-` reads stdin
    #[arg(long)]
    body: Option<String>,

    /// Read the body from a file
    #[arg(long, conflicts_with = "body")]
    body_file: Option<PathBuf>,

    /// Summary field as NAME=VALUE, repeatable
    #[arg(long = "field", short = 'f', value_name = "NAME=VALUE")]
    fields: Vec<String>,

    #[arg(long)]
    extra: Option<String>,

    #[arg(long)]
    revision: Option<String>,

    /// Record the change for the next sync instead of marking it synced
    #[arg(long, default_value_t = false)]
    offline: bool,
}

#[derive(Args, Debug)]
struct RemoveArgs {
    uid: String,

    /// Leave a tombstone for the next sync
    #[arg(long, default_value_t = false)]
    offline: bool,
}

#[derive(Args, Debug)]
struct GetArgs {
    uid: String,

    #[arg(long, default_value_t = false)]
    include_deleted: bool,

    #[arg(long, default_value_t = false)]
    json: bool,
}

#[derive(Args, Debug)]
struct SearchArgs {
    /// Search expression; everything matches when omitted
    expr: Option<String>,

    /// Print summary fields instead of bodies
    #[arg(long, default_value_t = false)]
    meta: bool,

    /// Print uids only
    #[arg(long, default_value_t = false, conflicts_with = "meta")]
    uids: bool,

    #[arg(long, default_value_t = false)]
    include_deleted: bool,

    #[arg(long, default_value_t = false)]
    json: bool,
}

#[derive(Args, Debug)]
struct ChangesArgs {
    /// Purge tombstones and mark everything synced
    #[arg(long, default_value_t = false)]
    clear: bool,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum Start {
    Begin,
    End,
}

#[derive(Args, Debug)]
struct BrowseArgs {
    /// Search expression
    #[arg(long)]
    expr: Option<String>,

    /// Sort field, `-name` for descending; repeatable (default from config)
    #[arg(long = "sort", short = 's', allow_hyphen_values = true)]
    sort: Vec<String>,

    /// Jump to the bucket of this letter before stepping
    #[arg(long, conflicts_with = "from")]
    letter: Option<String>,

    #[arg(long, value_enum, default_value_t = Start::Begin)]
    from: Start,

    /// Records to fetch; negative walks backwards
    #[arg(long, short = 'n', default_value_t = 10, allow_negative_numbers = true)]
    count: i32,
}

#[derive(Subcommand, Debug)]
enum KeysCommand {
    /// Print a key
    Get { name: String },
    /// Set a key
    Set { name: String, value: String },
    /// Delete a key
    Unset { name: String },
    /// Print or set the data version
    Version {
        #[arg(long)]
        set: Option<i64>,
    },
    /// Print the current revision
    Revision,
    /// Print or change the collation locale
    Locale {
        #[arg(long)]
        set: Option<String>,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = config::load(cli.config.as_deref())?;

    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) if cli.verbose => EnvFilter::new("debug"),
        Err(_) => EnvFilter::try_new(&config.log).unwrap_or_else(|_| EnvFilter::new("warn")),
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .init();

    for warning in &config.warnings {
        warn!("{}", warning);
    }

    let db_path = cli.db.clone().unwrap_or_else(|| config.database.clone());
    debug!("using cache {}", db_path.display());
    let cache = BookCache::open(&db_path, &config.locale)
        .with_context(|| format!("failed to open cache at {}", db_path.display()))?;

    match cli.command {
        Command::Put(args) => handle_put(&cache, args),
        Command::Remove(args) => handle_remove(&cache, args),
        Command::Get(args) => handle_get(&cache, args),
        Command::Search(args) => handle_search(&cache, args),
        Command::Changes(args) => handle_changes(&cache, args),
        Command::Browse(args) => handle_browse(&cache, &config, args),
        Command::Keys(command) => handle_keys(&cache, command),
    }
}

fn parse_field(raw: &str) -> Result<(String, String)> {
    let (name, value) = raw
        .split_once('=')
        .ok_or_else(|| anyhow!("field `{}` must look like NAME=VALUE", raw))?;
    let name = name.trim();
    if name.is_empty() {
        bail!("field `{}` has an empty name", raw);
    }
    Ok((name.to_string(), value.to_string()))
}

fn handle_put(store: &dyn RecordStore, args: PutArgs) -> Result<()> {
    let uid = args
        .uid
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let body = match (args.body, args.body_file) {
        (Some(body), _) if body == "-" => {
            let mut buf = String::new();
            io::stdin()
                .read_to_string(&mut buf)
                .context("failed to read body from stdin")?;
            buf
        }
        (Some(body), _) => body,
        (None, Some(path)) => fs::read_to_string(&path)
            .with_context(|| format!("failed to read {}", path.display()))?,
        (None, None) => String::new(),
    };

    let meta = args
        .fields
        .iter()
        .map(|raw| parse_field(raw))
        .collect::<Result<MetaFields>>()?;

    let mut record = Record::new(&uid, &body).with_meta(meta);
    record.extra = args.extra;
    record.revision = args.revision;

    store.put(&record, args.offline)?;
    println!("{}", uid);
    Ok(())
}

fn handle_remove(store: &dyn RecordStore, args: RemoveArgs) -> Result<()> {
    store.remove(&args.uid, args.offline)?;
    Ok(())
}

fn handle_get(store: &dyn RecordStore, args: GetArgs) -> Result<()> {
    let stored = store.get(&args.uid, args.include_deleted)?;
    if args.json {
        let out = json!({
            "uid": stored.record.uid,
            "revision": stored.record.revision,
            "state": stored.state,
            "extra": stored.record.extra,
            "meta": stored.record.meta,
            "body": stored.record.body,
        });
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    println!("uid: {}", stored.record.uid);
    println!("state: {}", stored.state);
    if let Some(revision) = &stored.record.revision {
        println!("revision: {}", revision);
    }
    if let Some(extra) = &stored.record.extra {
        println!("extra: {}", extra);
    }
    for field in stored.record.meta.iter() {
        println!("{}: {}", field.field, field.value);
    }
    if !stored.record.body.is_empty() {
        println!();
        println!("{}", stored.record.body);
    }
    Ok(())
}

fn handle_search(cache: &BookCache, args: SearchArgs) -> Result<()> {
    let expr = args.expr.as_deref();
    if args.uids {
        for uid in cache.search_uids(expr)? {
            println!("{}", uid);
        }
        return Ok(());
    }

    let results = cache.search_with(expr, args.meta, args.include_deleted)?;
    if args.json {
        println!("{}", serde_json::to_string_pretty(&results)?);
        return Ok(());
    }

    for data in results {
        match &data.content {
            SearchContent::Meta(meta) => {
                let fields: Vec<String> = meta
                    .iter()
                    .map(|m| format!("{}={}", m.field, m.value))
                    .collect();
                println!("{}\t{}", data.uid, fields.join("\t"));
            }
            SearchContent::Full(body) => {
                println!("{}", data.uid);
                for line in body.lines() {
                    println!("  {}", line);
                }
            }
        }
    }
    Ok(())
}

fn handle_changes(cache: &BookCache, args: ChangesArgs) -> Result<()> {
    if args.clear {
        cache.clear_offline_changes()?;
        return Ok(());
    }
    for change in cache.get_offline_changes()? {
        println!(
            "{}\t{}\t{}",
            change.state,
            change.uid,
            change.revision.as_deref().unwrap_or("-")
        );
    }
    Ok(())
}

fn handle_browse(cache: &BookCache, config: &Config, args: BrowseArgs) -> Result<()> {
    let sort = if args.sort.is_empty() {
        config.sort.clone()
    } else {
        args.sort
            .iter()
            .map(|raw| config::parse_sort_field(raw))
            .collect::<Result<Vec<SortKey>>>()?
    };

    let mut cursor = BookCursor::new(cache, args.expr.as_deref(), &sort)?;

    let origin = match (&args.letter, args.from) {
        (Some(letter), _) => {
            let collator = cache.collator();
            let wanted = letter.trim().to_uppercase();
            let index = collator
                .index_labels()
                .iter()
                .position(|label| *label == wanted)
                .ok_or_else(|| {
                    anyhow!(
                        "`{}` is not in the alphabetic index of locale {} ({})",
                        letter,
                        collator.locale(),
                        collator.index_labels().join(" ")
                    )
                })?;
            let locale = cursor.load_locale()?;
            cursor.set_alphabetic_index(index, &locale)?;
            CursorOrigin::Current
        }
        (None, Start::Begin) => CursorOrigin::Begin,
        (None, Start::End) => CursorOrigin::End,
    };

    let revision = cache.revision()?;
    let count = match (origin, args.count) {
        (CursorOrigin::End, n) if n > 0 => -n,
        (_, n) => n,
    };
    let page = cursor.step(
        Some(&revision),
        StepFlags::MOVE | StepFlags::FETCH,
        origin,
        count,
    )?;

    let fields: Vec<&str> = sort.iter().map(|key| key.field.as_str()).collect();
    for data in page.records.unwrap_or_default() {
        let stored = cache.get(&data.uid, false)?;
        let values: Vec<&str> = fields
            .iter()
            .map(|field| stored.record.meta.first(field).unwrap_or(""))
            .collect();
        println!("{}\t{}", data.uid, values.join("\t"));
    }
    println!(
        "-- {} of {} (revision {})",
        cursor.position(),
        cursor.total(),
        revision
    );
    Ok(())
}

fn handle_keys(cache: &BookCache, command: KeysCommand) -> Result<()> {
    match command {
        KeysCommand::Get { name } => println!("{}", cache.get_key(&name)?),
        KeysCommand::Set { name, value } => cache.set_key(&name, Some(&value))?,
        KeysCommand::Unset { name } => cache.set_key(&name, None)?,
        KeysCommand::Version { set: Some(version) } => cache.set_version(version)?,
        KeysCommand::Version { set: None } => println!("{}", cache.get_version()?),
        KeysCommand::Revision => println!("{}", cache.revision()?),
        KeysCommand::Locale { set: Some(locale) } => cache.set_locale(&locale)?,
        KeysCommand::Locale { set: None } => println!("{}", cache.locale()),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_fields() {
        assert_eq!(
            parse_field("email=a=b@example.com").unwrap(),
            ("email".to_string(), "a=b@example.com".to_string())
        );
        assert!(parse_field("no-equals").is_err());
        assert!(parse_field("=value").is_err());
    }

    #[test]
    fn offline_state_prints_kebab_case() {
        assert_eq!(OfflineState::LocallyDeleted.to_string(), "locally-deleted");
    }
}
