//! Editing the service's environment file.
//!
//! The inference server reads tunables such as `GPU_MEMORY_UTILIZATION`
//! from a `KEY=value` file. Edits preserve every other line and are written
//! through a temp file plus rename so a crash never leaves a torn file.

use recovery_common::util;
use std::fs;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// vLLM's own defaults, assumed when the env file does not set a value.
pub const DEFAULT_GPU_MEMORY_UTILIZATION: f64 = 0.9;
pub const DEFAULT_MAX_NUM_SEQS: u32 = 256;

#[derive(Debug, Error)]
pub enum EnvFileError {
    #[error("Failed to access {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{key} in {path} is not a number: '{value}'")]
    NotANumber {
        path: PathBuf,
        key: String,
        value: String,
    },

    #[error("No config backup found in {0}")]
    NoBackup(PathBuf),
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> EnvFileError + '_ {
    move |source| EnvFileError::Io {
        path: path.to_path_buf(),
        source,
    }
}

/// Result of lowering a numeric tunable.
#[derive(Debug, Clone, PartialEq)]
pub struct Adjustment<T> {
    pub key: String,
    pub from: T,
    pub to: T,
    /// The value was already at the floor; nothing was written.
    pub at_floor: bool,
}

fn parse_line<'a>(line: &'a str, key: &str) -> Option<&'a str> {
    let trimmed = line.trim_start();
    let trimmed = trimmed.strip_prefix("export ").unwrap_or(trimmed);
    let rest = trimmed.strip_prefix(key)?;
    let value = rest.trim_start().strip_prefix('=')?;
    Some(value.trim().trim_matches(|c| c == '"' || c == '\''))
}

/// Read `key` from an env file. A missing file reads as unset.
pub fn read_var(path: &Path, key: &str) -> Result<Option<String>, EnvFileError> {
    let contents = match fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(io_error(path)(e)),
    };
    Ok(contents
        .lines()
        .filter(|l| !l.trim_start().starts_with('#'))
        .filter_map(|l| parse_line(l, key))
        .last()
        .map(str::to_string))
}

/// Set `key=value`, replacing existing assignments or appending one.
pub fn set_var(path: &Path, key: &str, value: &str) -> Result<(), EnvFileError> {
    let contents = match fs::read_to_string(path) {
        Ok(c) => c,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
        Err(e) => return Err(io_error(path)(e)),
    };

    let mut replaced = false;
    let mut lines: Vec<String> = contents
        .lines()
        .map(|line| {
            if !line.trim_start().starts_with('#') && parse_line(line, key).is_some() {
                replaced = true;
                format!("{key}={value}")
            } else {
                line.to_string()
            }
        })
        .collect();
    if !replaced {
        lines.push(format!("{key}={value}"));
    }

    let mut rendered = lines.join("\n");
    rendered.push('\n');
    write_atomic(path, rendered.as_bytes())
}

fn write_atomic(path: &Path, contents: &[u8]) -> Result<(), EnvFileError> {
    util::write_atomic(path, contents).map_err(io_error(path))
}

/// Lower a fractional tunable by `step`, never below `floor`.
pub fn lower_fraction(
    path: &Path,
    key: &str,
    step: f64,
    floor: f64,
    default: f64,
) -> Result<Adjustment<f64>, EnvFileError> {
    let current = match read_var(path, key)? {
        Some(raw) => raw.parse::<f64>().map_err(|_| EnvFileError::NotANumber {
            path: path.to_path_buf(),
            key: key.to_string(),
            value: raw.clone(),
        })?,
        None => default,
    };

    if current <= floor {
        return Ok(Adjustment {
            key: key.to_string(),
            from: current,
            to: current,
            at_floor: true,
        });
    }

    // Two decimals keep repeated steps from accumulating float noise.
    let next = ((current - step).max(floor) * 100.0).round() / 100.0;
    let next = next.max(floor);
    set_var(path, key, &format!("{next:.2}"))?;
    Ok(Adjustment {
        key: key.to_string(),
        from: current,
        to: next,
        at_floor: false,
    })
}

/// Lower an integer tunable by `step`, never below `floor`.
pub fn lower_count(
    path: &Path,
    key: &str,
    step: u32,
    floor: u32,
    default: u32,
) -> Result<Adjustment<u32>, EnvFileError> {
    let current = match read_var(path, key)? {
        Some(raw) => raw.parse::<u32>().map_err(|_| EnvFileError::NotANumber {
            path: path.to_path_buf(),
            key: key.to_string(),
            value: raw.clone(),
        })?,
        None => default,
    };

    if current <= floor {
        return Ok(Adjustment {
            key: key.to_string(),
            from: current,
            to: current,
            at_floor: true,
        });
    }

    let next = current.saturating_sub(step).max(floor);
    set_var(path, key, &next.to_string())?;
    Ok(Adjustment {
        key: key.to_string(),
        from: current,
        to: next,
        at_floor: false,
    })
}

#[derive(Debug, Clone, PartialEq)]
pub enum RestoreOutcome {
    Restored { from: PathBuf },
    /// The target already matches the newest backup.
    AlreadyCurrent { from: PathBuf },
}

/// Newest regular file in `backup_dir` by modification time.
pub fn latest_backup(backup_dir: &Path) -> Result<Option<PathBuf>, EnvFileError> {
    let entries = match fs::read_dir(backup_dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(io_error(backup_dir)(e)),
    };

    let mut newest: Option<(std::time::SystemTime, PathBuf)> = None;
    for entry in entries.flatten() {
        let Ok(meta) = entry.metadata() else { continue };
        if !meta.is_file() {
            continue;
        }
        let modified = meta.modified().unwrap_or(std::time::UNIX_EPOCH);
        let path = entry.path();
        let newer = match &newest {
            None => true,
            Some((t, p)) => modified > *t || (modified == *t && path > *p),
        };
        if newer {
            newest = Some((modified, path));
        }
    }
    Ok(newest.map(|(_, p)| p))
}

/// Copy the newest backup over `target`. Repeating the call is a no-op.
pub fn restore_latest_backup(backup_dir: &Path, target: &Path) -> Result<RestoreOutcome, EnvFileError> {
    let backup = latest_backup(backup_dir)?.ok_or_else(|| EnvFileError::NoBackup(backup_dir.to_path_buf()))?;
    let wanted = fs::read(&backup).map_err(io_error(&backup))?;
    if let Ok(current) = fs::read(target) {
        if current == wanted {
            return Ok(RestoreOutcome::AlreadyCurrent { from: backup });
        }
    }
    write_atomic(target, &wanted)?;
    Ok(RestoreOutcome::Restored { from: backup })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn read_and_set_preserve_other_lines() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("vllm.env");
        fs::write(
            &path,
            "# tuning\nMODEL=qwen3\nexport GPU_MEMORY_UTILIZATION=\"0.90\"\nPORT=8000\n",
        )
        .unwrap();

        assert_eq!(
            read_var(&path, "GPU_MEMORY_UTILIZATION").unwrap().as_deref(),
            Some("0.90")
        );
        set_var(&path, "GPU_MEMORY_UTILIZATION", "0.85").unwrap();
        let contents = fs::read_to_string(&path).unwrap();
        assert_eq!(
            contents,
            "# tuning\nMODEL=qwen3\nGPU_MEMORY_UTILIZATION=0.85\nPORT=8000\n"
        );
    }

    #[test]
    fn set_appends_missing_key_and_creates_file() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("nested").join("vllm.env");
        set_var(&path, "MAX_NUM_SEQS", "128").unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "MAX_NUM_SEQS=128\n");
    }

    #[test]
    fn prefix_keys_do_not_match() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("vllm.env");
        fs::write(&path, "MAX_NUM_SEQS_EXTRA=1\n").unwrap();
        assert_eq!(read_var(&path, "MAX_NUM_SEQS").unwrap(), None);
    }

    #[test]
    fn lower_fraction_clamps_at_floor_and_is_repeat_safe() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("vllm.env");
        fs::write(&path, "GPU_MEMORY_UTILIZATION=0.58\n").unwrap();

        let first = lower_fraction(&path, "GPU_MEMORY_UTILIZATION", 0.05, 0.5, 0.9).unwrap();
        assert_eq!(first.to, 0.53);
        let second = lower_fraction(&path, "GPU_MEMORY_UTILIZATION", 0.05, 0.5, 0.9).unwrap();
        assert_eq!(second.to, 0.5);
        assert!(!second.at_floor);
        let third = lower_fraction(&path, "GPU_MEMORY_UTILIZATION", 0.05, 0.5, 0.9).unwrap();
        assert!(third.at_floor);
        assert_eq!(third.to, 0.5);
        assert_eq!(
            read_var(&path, "GPU_MEMORY_UTILIZATION").unwrap().as_deref(),
            Some("0.50")
        );
    }

    #[test]
    fn lower_fraction_uses_default_when_unset() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("vllm.env");
        let adjustment = lower_fraction(&path, "GPU_MEMORY_UTILIZATION", 0.05, 0.5, 0.9).unwrap();
        assert_eq!(adjustment.from, 0.9);
        assert_eq!(adjustment.to, 0.85);
    }

    #[test]
    fn lower_count_clamps() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("vllm.env");
        fs::write(&path, "MAX_NUM_SEQS=40\n").unwrap();
        let adjustment = lower_count(&path, "MAX_NUM_SEQS", 64, 16, 256).unwrap();
        assert_eq!(adjustment.to, 16);
        assert!(lower_count(&path, "MAX_NUM_SEQS", 64, 16, 256).unwrap().at_floor);
    }

    #[test]
    fn non_numeric_value_is_an_error() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("vllm.env");
        fs::write(&path, "MAX_NUM_SEQS=lots\n").unwrap();
        assert!(matches!(
            lower_count(&path, "MAX_NUM_SEQS", 64, 16, 256),
            Err(EnvFileError::NotANumber { .. })
        ));
    }

    #[test]
    fn restore_is_idempotent() {
        let tmp = TempDir::new().unwrap();
        let backups = tmp.path().join("backups");
        fs::create_dir_all(&backups).unwrap();
        fs::write(backups.join("vllm.env.20240101"), "MODEL=good\n").unwrap();
        let target = tmp.path().join("vllm.env");
        fs::write(&target, "MODEL=broken\n").unwrap();

        assert!(matches!(
            restore_latest_backup(&backups, &target).unwrap(),
            RestoreOutcome::Restored { .. }
        ));
        assert_eq!(fs::read_to_string(&target).unwrap(), "MODEL=good\n");
        assert!(matches!(
            restore_latest_backup(&backups, &target).unwrap(),
            RestoreOutcome::AlreadyCurrent { .. }
        ));
    }

    #[test]
    fn restore_without_backup_fails() {
        let tmp = TempDir::new().unwrap();
        let err = restore_latest_backup(&tmp.path().join("none"), &tmp.path().join("vllm.env"))
            .unwrap_err();
        assert!(matches!(err, EnvFileError::NoBackup(_)));
    }
}
