//! pip-style requirement file parsing.
//!
//! Supported: blank lines, `#` comments, `\` continuations and
//! `-r`/`--requirement` includes (relative to the including file). Any other
//! option line is rejected so that the manifest stays declarative.

use anyhow::{bail, Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

use super::Package;

/// Parse a requirements file and all of its includes, in order.
pub fn parse_requirements_file(path: &Path) -> Result<Vec<Package>> {
    let mut stack = Vec::new();
    let mut out = Vec::new();
    parse_into(path, &mut stack, &mut out)?;
    Ok(out)
}

fn parse_into(path: &Path, stack: &mut Vec<PathBuf>, out: &mut Vec<Package>) -> Result<()> {
    let canonical = fs::canonicalize(path)
        .with_context(|| format!("requirements file not found: '{}'", path.display()))?;
    if stack.contains(&canonical) {
        bail!(
            "requirements include cycle: {} -> {}",
            stack
                .iter()
                .map(|p| p.display().to_string())
                .collect::<Vec<_>>()
                .join(" -> "),
            canonical.display()
        );
    }

    let content = fs::read_to_string(&canonical)
        .with_context(|| format!("reading requirements file '{}'", canonical.display()))?;
    let base_dir = canonical
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));

    stack.push(canonical.clone());
    for (line_no, line) in logical_lines(&content) {
        let line = strip_comment(&line).trim().to_string();
        if line.is_empty() {
            continue;
        }

        if let Some(include) = include_target(&line) {
            parse_into(&base_dir.join(include), stack, out).with_context(|| {
                format!("included from '{}' line {}", canonical.display(), line_no)
            })?;
            continue;
        }

        if line.starts_with('-') {
            bail!(
                "unsupported option '{}' in '{}' line {}",
                line,
                canonical.display(),
                line_no
            );
        }

        let package = Package::python(&line)
            .with_context(|| format!("in '{}' line {}", canonical.display(), line_no))?;
        out.push(package);
    }
    stack.pop();
    Ok(())
}

/// Join `\`-continued physical lines; yields the 1-based number of the first
/// physical line of each logical line.
fn logical_lines(content: &str) -> Vec<(usize, String)> {
    let mut lines = Vec::new();
    let mut current = String::new();
    let mut start = 0;

    for (idx, raw) in content.lines().enumerate() {
        if current.is_empty() {
            start = idx + 1;
        }
        match raw.strip_suffix('\\') {
            Some(head) => {
                current.push_str(head);
                current.push(' ');
            }
            None => {
                current.push_str(raw);
                lines.push((start, std::mem::take(&mut current)));
            }
        }
    }
    if !current.is_empty() {
        lines.push((start, current));
    }
    lines
}

/// A `#` starts a comment at line start or after whitespace; `pkg#frag`
/// inside a URL is left alone.
fn strip_comment(line: &str) -> &str {
    let bytes = line.as_bytes();
    for (idx, b) in bytes.iter().enumerate() {
        if *b == b'#' && (idx == 0 || bytes[idx - 1].is_ascii_whitespace()) {
            return &line[..idx];
        }
    }
    line
}

fn include_target(line: &str) -> Option<&str> {
    for prefix in ["--requirement=", "--requirement ", "-r ", "-r"] {
        if let Some(rest) = line.strip_prefix(prefix) {
            let rest = rest.trim();
            if !rest.is_empty() {
                return Some(rest);
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_parse_basic_requirements() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("requirements.txt");
        fs::write(
            &path,
            "# web stack\nDjango>=4.2\n\npsycopg[binary]==3.1.18  # driver\ngunicorn\n",
        )
        .unwrap();

        let pkgs = parse_requirements_file(&path).unwrap();
        let names: Vec<_> = pkgs.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["django", "psycopg", "gunicorn"]);
        assert_eq!(pkgs[1].requirement, "psycopg[binary]==3.1.18");
    }

    #[test]
    fn test_parse_follows_includes() {
        let temp = TempDir::new().unwrap();
        fs::write(temp.path().join("base.txt"), "requests\n").unwrap();
        fs::write(
            temp.path().join("requirements-dev.txt"),
            "-r base.txt\npytest\n",
        )
        .unwrap();

        let pkgs = parse_requirements_file(&temp.path().join("requirements-dev.txt")).unwrap();
        let names: Vec<_> = pkgs.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["requests", "pytest"]);
    }

    #[test]
    fn test_parse_detects_include_cycle() {
        let temp = TempDir::new().unwrap();
        fs::write(temp.path().join("a.txt"), "-r b.txt\n").unwrap();
        fs::write(temp.path().join("b.txt"), "--requirement=a.txt\n").unwrap();

        let err = parse_requirements_file(&temp.path().join("a.txt")).unwrap_err();
        assert!(format!("{:#}", err).contains("cycle"));
    }

    #[test]
    fn test_parse_rejects_unsupported_options() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("requirements.txt");
        fs::write(&path, "--index-url https://example.invalid/simple\nflask\n").unwrap();

        let err = parse_requirements_file(&path).unwrap_err();
        assert!(err.to_string().contains("unsupported option"));
    }

    #[test]
    fn test_parse_joins_continuations() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("requirements.txt");
        fs::write(&path, "numpy \\\n  >=1.26\nscipy\n").unwrap();

        let pkgs = parse_requirements_file(&path).unwrap();
        assert_eq!(pkgs.len(), 2);
        assert_eq!(pkgs[0].name, "numpy");
    }

    #[test]
    fn test_parse_missing_file() {
        let temp = TempDir::new().unwrap();
        assert!(parse_requirements_file(&temp.path().join("nope.txt")).is_err());
    }
}
