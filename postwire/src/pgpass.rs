//! Last-resort password lookup from a `.pgpass` file.
//!
//! Consulted only when no password and no producer is configured.
//! Any failure here is non-fatal; authentication simply proceeds
//! without a password.
use std::path::PathBuf;

use crate::config::Config;

/// Look up a password for the target host/port/database/user.
pub(crate) fn lookup(config: &Config) -> Option<String> {
    let path = file_path()?;
    let contents = std::fs::read_to_string(path).ok()?;
    let database = config.database.as_deref().unwrap_or(&config.user);
    let mut port = itoa::Buffer::new();
    find(&contents, &config.host, port.format(config.port), database, &config.user)
}

fn file_path() -> Option<PathBuf> {
    if let Ok(path) = std::env::var("PGPASSFILE") {
        return Some(path.into());
    }
    home::home_dir().map(|dir| dir.join(".pgpass"))
}

/// Scan `hostname:port:database:username:password` lines. Fields match
/// literally or with a `*` wildcard; `\` escapes `:`, `\` and `*`.
fn find(contents: &str, host: &str, port: &str, database: &str, user: &str) -> Option<String> {
    for line in contents.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let mut fields = split_fields(line);
        let (h, p, d, u) = (fields.next()?, fields.next()?, fields.next()?, fields.next()?);
        let password = fields.next()?;

        if matches(&h, host) && matches(&p, port) && matches(&d, database) && matches(&u, user) {
            return Some(password);
        }
    }
    None
}

fn matches(field: &str, value: &str) -> bool {
    field == "*" || field == value
}

/// Split on unescaped `:`, resolving `\`-escapes within each field.
fn split_fields(line: &str) -> impl Iterator<Item = String> + '_ {
    let mut chars = line.chars().peekable();
    let mut done = false;

    std::iter::from_fn(move || {
        if done {
            return None;
        }
        let mut field = String::new();
        loop {
            match chars.next() {
                Some('\\') => {
                    if let Some(c) = chars.next() {
                        field.push(c);
                    }
                }
                Some(':') => break,
                Some(c) => field.push(c),
                None => {
                    done = true;
                    break;
                }
            }
        }
        Some(field)
    })
}
