//! Image runtime configuration accumulated from metadata ops.

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;

use crate::privilege::Identity;

/// What a container runtime needs to start the image.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ImageConfig {
    /// Runtime identity; `None` until privileges are dropped.
    pub user: Option<Identity>,
    /// Values may reference `$NAME`/`${NAME}`; see [`ImageConfig::runtime_env`].
    pub env: BTreeMap<String, String>,
    pub exposed_ports: BTreeSet<u16>,
    pub working_dir: Option<String>,
    /// Build parameters that shaped the image (e.g. `DEV`).
    pub build_args: BTreeMap<String, String>,
}

impl ImageConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let bytes = fs::read(path)
            .with_context(|| format!("reading image config '{}'", path.display()))?;
        serde_json::from_slice(&bytes)
            .with_context(|| format!("parsing image config '{}'", path.display()))
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        let mut bytes = serde_json::to_vec_pretty(self)?;
        bytes.push(b'\n');
        fs::write(path, bytes)
            .with_context(|| format!("writing image config '{}'", path.display()))
    }

    pub fn set_env(&mut self, key: &str, value: &str) -> Result<()> {
        let mut chars = key.chars();
        let valid = chars
            .next()
            .is_some_and(|c| c.is_ascii_alphabetic() || c == '_')
            && chars.all(|c| c.is_ascii_alphanumeric() || c == '_');
        if !valid {
            bail!("invalid environment variable name '{}'", key);
        }
        self.env.insert(key.to_string(), value.to_string());
        Ok(())
    }

    /// Environment with references expanded against `lookup` (usually the
    /// launching process environment). Unknown references expand to "".
    pub fn runtime_env<F>(&self, lookup: F) -> Vec<(String, String)>
    where
        F: Fn(&str) -> Option<String>,
    {
        self.env
            .iter()
            .map(|(key, value)| (key.clone(), expand_references(value, &lookup)))
            .collect()
    }
}

/// Expand `$NAME` and `${NAME}` in `value`.
pub fn expand_references<F>(value: &str, lookup: &F) -> String
where
    F: Fn(&str) -> Option<String>,
{
    let mut out = String::with_capacity(value.len());
    let mut rest = value;

    while let Some(pos) = rest.find('$') {
        out.push_str(&rest[..pos]);
        let after = &rest[pos + 1..];

        let (name, consumed) = if let Some(braced) = after.strip_prefix('{') {
            match braced.find('}') {
                Some(end) => (&braced[..end], end + 2),
                None => ("", 0),
            }
        } else {
            let end = after
                .find(|c: char| !(c.is_ascii_alphanumeric() || c == '_'))
                .unwrap_or(after.len());
            (&after[..end], end)
        };

        if name.is_empty() {
            out.push('$');
            rest = after;
            continue;
        }
        out.push_str(&lookup(name).unwrap_or_default());
        rest = &after[consumed..];
    }
    out.push_str(rest);
    out
}
