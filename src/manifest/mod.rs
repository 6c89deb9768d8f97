//! Package manifests: what an image needs at runtime, what it needs only to
//! build, and what it needs only in development.
//!
//! A [`Manifest`] is immutable once constructed. Groups keep declaration
//! order so logs read the way the recipe was written; identity and ordering
//! of individual packages use `(ecosystem, normalized name)`.

pub mod requirements;

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};

use anyhow::{bail, Result};

/// Package manager a package belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Ecosystem {
    /// OS-level package (apt).
    System,
    /// Python distribution installed into the virtual environment.
    Python,
}

impl fmt::Display for Ecosystem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Ecosystem::System => write!(f, "system"),
            Ecosystem::Python => write!(f, "python"),
        }
    }
}

/// A single package reference.
///
/// `requirement` is the exact text handed to the package manager (for
/// Python this may carry a version specifier such as `django>=4.2`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Package {
    pub ecosystem: Ecosystem,
    pub name: String,
    pub requirement: String,
}

impl Package {
    /// OS package. Names follow Debian policy: lowercase alphanumerics plus
    /// `+ - .`, starting with an alphanumeric.
    pub fn system(name: &str) -> Result<Self> {
        let name = name.trim();
        let valid = name.len() >= 2
            && name.chars().next().is_some_and(|c| c.is_ascii_alphanumeric())
            && name.chars().all(|c| {
                c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '+' | '-' | '.')
            });
        if !valid {
            bail!("invalid system package name '{}'", name);
        }
        Ok(Self {
            ecosystem: Ecosystem::System,
            name: name.to_string(),
            requirement: name.to_string(),
        })
    }

    /// Python requirement line such as `psycopg[binary]==3.1.18`.
    pub fn python(requirement: &str) -> Result<Self> {
        let requirement = requirement.trim();
        let raw_name: &str = requirement
            .split(|c: char| matches!(c, '[' | '<' | '>' | '=' | '!' | '~' | ';' | '@' | ' '))
            .next()
            .unwrap_or("");
        if raw_name.is_empty()
            || !raw_name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
            || !raw_name.chars().next().is_some_and(|c| c.is_ascii_alphanumeric())
        {
            bail!("invalid python requirement '{}'", requirement);
        }
        Ok(Self {
            ecosystem: Ecosystem::Python,
            name: normalize_python_name(raw_name),
            requirement: requirement.to_string(),
        })
    }

    /// `ecosystem:name`, used in the ledger and in logs.
    pub fn key(&self) -> String {
        format!("{}:{}", self.ecosystem, self.name)
    }
}

impl PartialEq for Package {
    fn eq(&self, other: &Self) -> bool {
        self.ecosystem == other.ecosystem && self.name == other.name
    }
}

impl Eq for Package {}

impl Hash for Package {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.ecosystem.hash(state);
        self.name.hash(state);
    }
}

impl PartialOrd for Package {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Package {
    fn cmp(&self, other: &Self) -> Ordering {
        (self.ecosystem, &self.name).cmp(&(other.ecosystem, &other.name))
    }
}

impl fmt::Display for Package {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.key())
    }
}

/// PEP 503 normalization: lowercase, runs of `-_.` collapse to `-`.
pub fn normalize_python_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len());
    let mut in_separator = false;
    for c in name.chars() {
        if matches!(c, '-' | '_' | '.') {
            if !in_separator {
                out.push('-');
            }
            in_separator = true;
        } else {
            out.push(c.to_ascii_lowercase());
            in_separator = false;
        }
    }
    out
}

/// The three package groups of an image.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Manifest {
    runtime: Vec<Package>,
    build_only: Vec<Package>,
    dev: Vec<Package>,
}

impl Manifest {
    pub fn new(runtime: Vec<Package>, build_only: Vec<Package>, dev: Vec<Package>) -> Self {
        Self {
            runtime,
            build_only,
            dev,
        }
    }

    pub fn runtime(&self) -> &[Package] {
        &self.runtime
    }

    pub fn build_only(&self) -> &[Package] {
        &self.build_only
    }

    pub fn dev(&self) -> &[Package] {
        &self.dev
    }
}

/// Build-time switches.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildFlags {
    /// `DEV`: merge the development manifest into the runtime set.
    pub dev: bool,
}

impl BuildFlags {
    /// Resolve `DEV` with CLI > environment > recipe > `false` precedence.
    pub fn resolve(cli: Option<bool>, env_value: Option<&str>, recipe_default: bool) -> Self {
        let dev = cli
            .or_else(|| env_value.map(parse_flag))
            .unwrap_or(recipe_default);
        Self { dev }
    }
}

fn parse_flag(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes"
    )
}
