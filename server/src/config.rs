//! Server configuration: a minimal `KEY=VALUE` file format, one setting per
//! line, `#` starts a trailing comment, blank lines ignored. Hand-rolled
//! rather than pulled in from a config crate, since the format has exactly
//! four keys and no nesting.
//!
//! The socket path is deliberately not configurable: the server unlinks
//! whatever path it's given at both startup and exit, so letting a config
//! file name arbitrary paths is needless attack surface. It lives at
//! [`SOCKET_PATH`].

use std::fmt;
use std::fs;
use std::path::Path;

use crate::error::{Error, ErrorKind, Result};

/// Fixed location of the listening socket. Not configurable; see module docs.
pub const SOCKET_PATH: &str = "/tmp/filestorageserver.sk";

const DEFAULT_WORKER_POOL_SIZE: usize = 5;
const DEFAULT_STORAGE_MAX_FILE_NUMBER: usize = 1000;
const DEFAULT_STORAGE_MAX_SIZE: u64 = 128 * 1024 * 1024;
const DEFAULT_BACKLOG: i32 = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Config {
    pub worker_pool_size: usize,
    pub storage_max_file_number: usize,
    pub storage_max_size: u64,
    pub backlog: i32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            worker_pool_size: DEFAULT_WORKER_POOL_SIZE,
            storage_max_file_number: DEFAULT_STORAGE_MAX_FILE_NUMBER,
            storage_max_size: DEFAULT_STORAGE_MAX_SIZE,
            backlog: DEFAULT_BACKLOG,
        }
    }
}

impl fmt::Display for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "worker_pool_size={} storage_max_file_number={} storage_max_size={} backlog={}",
            self.worker_pool_size, self.storage_max_file_number, self.storage_max_size, self.backlog
        )
    }
}

impl Config {
    /// Loads a config file, falling back to defaults for any key it doesn't
    /// set. Unknown keys and malformed lines are skipped with a logged
    /// warning rather than rejected outright, so comments and blank lines
    /// can be interleaved with settings freely.
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .map_err(|_| Error::with_detail(ErrorKind::Internal, "failed to read config file"))?;
        let mut config = Config::default();
        for raw_line in text.lines() {
            let line = strip_comment(raw_line).trim();
            if line.is_empty() {
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                log::warn!("config: ignoring malformed line: {raw_line:?}");
                continue;
            };
            let key = key.trim();
            let value = value.trim();
            match key {
                "WORKER_POOL_SIZE" => config.worker_pool_size = parse_positive(key, value)?,
                "STORAGE_MAX_FILE_NUMBER" => config.storage_max_file_number = parse_positive(key, value)?,
                "STORAGE_MAX_SIZE" => config.storage_max_size = parse_positive(key, value)?,
                "BACKLOG" => config.backlog = parse_positive::<i32>(key, value)?,
                other => log::warn!("config: unknown key {other:?}, ignoring"),
            }
        }
        Ok(config)
    }
}

fn strip_comment(line: &str) -> &str {
    match line.find('#') {
        Some(idx) => &line[..idx],
        None => line,
    }
}

fn parse_positive<T>(key: &str, value: &str) -> Result<T>
where
    T: std::str::FromStr + PartialOrd + Default,
{
    let parsed: T = value
        .parse()
        .map_err(|_| Error::with_detail(ErrorKind::Malformed, "bad config file format"))?;
    if parsed <= T::default() {
        return Err(Error::with_detail(ErrorKind::Malformed, "bad config file format"));
    }
    let _ = key;
    Ok(parsed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_apply_when_file_absent_keys() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "WORKER_POOL_SIZE=8").unwrap();
        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.worker_pool_size, 8);
        assert_eq!(config.backlog, DEFAULT_BACKLOG);
    }

    #[test]
    fn comments_and_blank_lines_are_ignored() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "# a comment").unwrap();
        writeln!(file).unwrap();
        writeln!(file, "BACKLOG=64 # inline comment").unwrap();
        let config = Config::load(file.path()).unwrap();
        assert_eq!(config.backlog, 64);
    }

    #[test]
    fn non_positive_value_is_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "WORKER_POOL_SIZE=0").unwrap();
        let err = Config::load(file.path()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Malformed);
    }
}
