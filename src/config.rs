use std::collections::HashSet;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use directories::BaseDirs;
use serde::Deserialize;

use crate::cursor::SortKey;

const CONFIG_FILE_NAME: &str = "config.toml";
const DATABASE_FILE_NAME: &str = "cache.db";
const APP_NAME: &str = "bookcache";
const DEFAULT_LOCALE: &str = "en_US";
const DEFAULT_LOG: &str = "warn";

#[derive(Debug, Clone)]
pub struct Config {
    pub config_path: PathBuf,
    pub database: PathBuf,
    pub locale: String,
    pub sort: Vec<SortKey>,
    /// Default tracing filter, overridden by `RUST_LOG`.
    pub log: String,
    /// Problems found while loading, reported once logging is up.
    pub warnings: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ConfigFile {
    database: Option<PathBuf>,
    locale: Option<String>,
    sort_fields: Option<Vec<String>>,
    log: Option<String>,
}

/// Expand ~ to home directory in paths
fn expand_tilde(path: &Path) -> PathBuf {
    if let Ok(stripped) = path.strip_prefix("~") {
        if let Some(home) = home::home_dir() {
            return home.join(stripped);
        }
    }
    path.to_path_buf()
}

fn config_root() -> Result<PathBuf> {
    let base = BaseDirs::new().context("unable to determine base directories")?;
    Ok(base.config_dir().join(APP_NAME))
}

pub fn config_path() -> Result<PathBuf> {
    Ok(config_root()?.join(CONFIG_FILE_NAME))
}

fn default_database() -> Result<PathBuf> {
    let base = BaseDirs::new().context("unable to determine data directories")?;
    Ok(base.data_dir().join(APP_NAME).join(DATABASE_FILE_NAME))
}

/// Collation locale from the environment, POSIX precedence.
fn default_locale() -> String {
    ["LC_ALL", "LC_COLLATE", "LANG"]
        .iter()
        .filter_map(|name| env::var(name).ok())
        .map(|value| value.trim().to_string())
        .find(|value| !value.is_empty())
        .unwrap_or_else(|| DEFAULT_LOCALE.to_string())
}

fn default_sort() -> Vec<SortKey> {
    vec![
        SortKey::ascending("family_name"),
        SortKey::ascending("given_name"),
    ]
}

/// `"family_name"` sorts ascending, `"-family_name"` descending.
pub fn parse_sort_field(raw: &str) -> Result<SortKey> {
    let raw = raw.trim();
    let key = match raw.strip_prefix('-') {
        Some(field) => SortKey::descending(field.trim()),
        None => SortKey::ascending(raw.strip_prefix('+').unwrap_or(raw).trim()),
    };
    if key.field.is_empty() {
        bail!("empty sort field");
    }
    Ok(key)
}

/// Load the configuration from `explicit`, or from the default location.
/// A missing file yields the defaults.
pub fn load(explicit: Option<&Path>) -> Result<Config> {
    let path = match explicit {
        Some(path) => expand_tilde(path),
        None => config_path()?,
    };
    if !path.exists() {
        if explicit.is_some() {
            bail!("configuration file not found at {}", path.display());
        }
        return parse("", path);
    }

    let raw = fs::read_to_string(&path)
        .with_context(|| format!("failed to read configuration file at {}", path.display()))?;
    parse(&raw, path)
}

fn parse(raw: &str, path: PathBuf) -> Result<Config> {
    let value: toml::Value = toml::from_str(raw)
        .with_context(|| format!("failed to parse {} as TOML", path.display()))?;

    let warnings = unknown_keys(&value);

    let cfg_file: ConfigFile = value
        .try_into()
        .with_context(|| format!("failed to deserialize config from {}", path.display()))?;

    let database = match cfg_file.database {
        Some(db) => expand_tilde(&db),
        None => default_database()?,
    };

    let locale = cfg_file
        .locale
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
        .unwrap_or_else(default_locale);

    let sort = match cfg_file.sort_fields {
        Some(fields) if !fields.is_empty() => fields
            .iter()
            .map(|field| parse_sort_field(field))
            .collect::<Result<Vec<_>>>()
            .with_context(|| format!("invalid `sort_fields` in {}", path.display()))?,
        _ => default_sort(),
    };

    Ok(Config {
        config_path: path,
        database,
        locale,
        sort,
        log: cfg_file.log.unwrap_or_else(|| DEFAULT_LOG.to_string()),
        warnings,
    })
}

fn unknown_keys(value: &toml::Value) -> Vec<String> {
    let Some(table) = value.as_table() else {
        return Vec::new();
    };

    let known = HashSet::from(["database", "locale", "sort_fields", "log"]);

    table
        .keys()
        .filter(|key| !known.contains(key.as_str()))
        .map(|key| format!("unknown configuration key `{}`", key))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cursor::SortDirection;

    #[test]
    fn test_full_config() {
        let cfg = parse(
            r#"
            database = "/tmp/book.db"
            locale = "sv_SE.UTF-8"
            sort_fields = ["family_name", "-given_name"]
            log = "bookcache=debug"
            "#,
            PathBuf::from("config.toml"),
        )
        .unwrap();

        assert_eq!(cfg.database, PathBuf::from("/tmp/book.db"));
        assert_eq!(cfg.locale, "sv_SE.UTF-8");
        assert_eq!(cfg.sort.len(), 2);
        assert_eq!(cfg.sort[1].field, "given_name");
        assert_eq!(cfg.sort[1].direction, SortDirection::Descending);
        assert_eq!(cfg.log, "bookcache=debug");
        assert!(cfg.warnings.is_empty());
    }

    #[test]
    fn test_unknown_keys_warn() {
        let cfg = parse(
            "database = \"/tmp/x.db\"\nvdir = \"/tmp\"\n",
            PathBuf::from("config.toml"),
        )
        .unwrap();
        assert_eq!(cfg.warnings, ["unknown configuration key `vdir`"]);
        assert_eq!(cfg.sort, default_sort());
    }

    #[test]
    fn test_tilde_expansion() {
        let cfg = parse("database = \"~/cache.db\"", PathBuf::from("c.toml")).unwrap();
        if let Some(home) = home::home_dir() {
            assert_eq!(cfg.database, home.join("cache.db"));
        }
    }

    #[test]
    fn test_missing_explicit_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(load(Some(&dir.path().join("nope.toml"))).is_err());
    }

    #[test]
    fn test_parse_sort_field() {
        assert_eq!(
            parse_sort_field("-Family_Name").unwrap(),
            SortKey::descending("family_name")
        );
        assert_eq!(
            parse_sort_field("+email").unwrap(),
            SortKey::ascending("email")
        );
        assert!(parse_sort_field(" - ").is_err());
    }
}
