/// Path processing utility functions / 路径处理工具函数

use std::io;
use std::path::{Path, PathBuf};

use glob::{glob_with, MatchOptions};

/// Expand a leading `~` to the user's home directory / 展开路径开头的 ~
pub fn expand_user(path: &str) -> PathBuf {
    let home = std::env::var("HOME")
        .or_else(|_| std::env::var("USERPROFILE"))
        .ok();

    match (path, home) {
        ("~", Some(home)) => PathBuf::from(home),
        (p, Some(home)) if p.starts_with("~/") || p.starts_with("~\\") => {
            PathBuf::from(home).join(&p[2..])
        }
        (p, _) => PathBuf::from(p),
    }
}

/// Check if any part of a path is a glob pattern / 判断路径是否包含通配符
pub fn has_wildcard(path: &Path) -> bool {
    path.to_string_lossy().contains(['*', '?', '['])
}

/// Expand a glob pattern over the whole path / 展开路径通配符
///
/// Wildcards may appear in directory components too (`data/day*/a.csv`).
/// `*` does not cross `/` and hidden entries need a literal leading dot.
/// Matching directories are returned so the caller can reject them;
/// unreadable entries are skipped. The result is sorted.
pub fn expand_wildcard(path: &Path) -> io::Result<Vec<PathBuf>> {
    if !has_wildcard(path) {
        return Ok(vec![path.to_path_buf()]);
    }

    let pattern = path.to_str().ok_or_else(|| {
        io::Error::new(io::ErrorKind::InvalidInput, format!("Non UTF-8 path: {}", path.display()))
    })?;
    let options = MatchOptions {
        case_sensitive: true,
        require_literal_separator: true,
        require_literal_leading_dot: true,
    };
    let paths = glob_with(pattern, options)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

    let mut matched = Vec::new();
    for entry in paths {
        match entry {
            Ok(path) => matched.push(path),
            Err(e) => tracing::debug!("Skipping unreadable path {}: {}", e.path().display(), e.error()),
        }
    }
    matched.sort();
    Ok(matched)
}

/// Get the last component of a path as a string / 获取路径最后一段
pub fn base_name(path: &str) -> String {
    let trimmed = path.trim_end_matches(['/', '\\']);
    match trimmed.rfind(['/', '\\']) {
        Some(pos) => trimmed[pos + 1..].to_string(),
        None => trimmed.to_string(),
    }
}

/// Strip the stage prefix of a remote path: "stage/dir/a.csv" -> "dir/a.csv"
/// 去掉远端路径的第一段
pub fn strip_first_component(path: &str) -> String {
    match path.split_once('/') {
        Some((_, rest)) if !rest.is_empty() => rest.to_string(),
        _ => path.to_string(),
    }
}

/// Get file extension (lowercase) / 获取文件扩展名
pub fn get_ext(path: &str) -> String {
    Path::new(path)
        .extension()
        .and_then(|e| e.to_str())
        .unwrap_or("")
        .to_lowercase()
}
