//! Host list handling
//!
//! Expands host patterns from the command line and host files into the
//! deduplicated working list the scheduler fans out over.

mod pattern;

pub use pattern::{expand, expand_all};

use crate::error::{IoResultExt, Result, RunnerError};
use std::path::Path;

/// Default SSH port used when a target carries no explicit `:port`.
pub const DEFAULT_SSH_PORT: u16 = 22;

/// Read host patterns from a file: one pattern per line, blank and
/// all-whitespace lines ignored. There is no comment syntax.
pub fn load_host_file(path: &Path) -> Result<Vec<String>> {
    let contents = std::fs::read_to_string(path).with_path(path)?;

    Ok(contents
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect())
}

/// Collect the working host list from positional patterns plus an optional
/// host file, expanded and deduplicated in that order.
pub fn collect_hosts(patterns: &[String], host_file: Option<&Path>) -> Result<Vec<String>> {
    let mut all = patterns.to_vec();
    if let Some(path) = host_file {
        all.extend(load_host_file(path)?);
    }

    if all.is_empty() {
        return Err(RunnerError::config("no target hosts given"));
    }

    expand_all(&all)
}

/// Split a `host[:port]` target. A missing or unparsable port falls back to
/// the default SSH port.
pub fn split_host_port(target: &str) -> (String, u16) {
    if let Some((host, port)) = target.rsplit_once(':') {
        if let Ok(port) = port.parse::<u16>() {
            return (host.to_string(), port);
        }
    }
    (target.to_string(), DEFAULT_SSH_PORT)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_load_host_file_skips_blank_lines() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "web[1-2].prod").unwrap();
        writeln!(file).unwrap();
        writeln!(file, "   ").unwrap();
        writeln!(file, "db01").unwrap();

        let patterns = load_host_file(file.path()).unwrap();
        assert_eq!(patterns, vec!["web[1-2].prod", "db01"]);
    }

    #[test]
    fn test_collect_hosts_merges_sources() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "db01").unwrap();

        let hosts =
            collect_hosts(&["web[1-2]".to_string(), "db01".to_string()], Some(file.path()))
                .unwrap();
        assert_eq!(hosts, vec!["web1", "web2", "db01"]);
    }

    #[test]
    fn test_collect_hosts_requires_input() {
        assert!(collect_hosts(&[], None).is_err());
    }

    #[test]
    fn test_split_host_port() {
        assert_eq!(split_host_port("db01:2222"), ("db01".to_string(), 2222));
        assert_eq!(split_host_port("db01"), ("db01".to_string(), DEFAULT_SSH_PORT));
        assert_eq!(
            split_host_port("10.1.2.3:10022"),
            ("10.1.2.3".to_string(), 10022)
        );
    }
}
