//! Identity handler: Op::CreateIdentity
//!
//! Account files are edited directly (no `useradd` in the rootfs), so the
//! result is the same on every host.

use anyhow::{bail, Context, Result};
use std::fs;
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use crate::privilege::{Identity, NO_HOME, NO_LOGIN_SHELL};

/// Parsed `/etc/passwd` entry plus its `/etc/shadow` password field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Account {
    pub name: String,
    pub uid: u32,
    pub gid: u32,
    pub home: String,
    pub shell: String,
    /// Shadow password field, or the passwd one when there is no shadow
    /// entry. `None` when passwd defers (`x`) to a missing shadow entry.
    pub password: Option<String>,
}

impl Account {
    /// Whether the password field lets anyone authenticate. An empty field
    /// means "no password required", which counts as usable.
    pub fn has_usable_password(&self) -> bool {
        match self.password.as_deref() {
            None => false,
            Some(field) => !field.starts_with('!') && !field.starts_with('*'),
        }
    }

    /// Whether the login shell refuses interactive sessions.
    pub fn has_nologin_shell(&self) -> bool {
        self.shell.ends_with("/nologin") || self.shell.ends_with("/false")
    }
}

/// One colon-separated account database file.
struct AccountDb {
    path: PathBuf,
    entries: Vec<Vec<String>>,
}

impl AccountDb {
    /// Load `etc/<file>`. A missing file is empty; short lines are corruption.
    fn load(rootfs: &Path, file: &str, min_fields: usize) -> Result<Self> {
        let path = rootfs.join("etc").join(file);
        if !path.exists() {
            return Ok(Self {
                path,
                entries: Vec::new(),
            });
        }

        let content = fs::read_to_string(&path)
            .with_context(|| format!("Failed to read {} file at {}", file, path.display()))?;
        let mut entries = Vec::new();
        for (idx, line) in content.lines().enumerate() {
            if line.trim().is_empty() || line.starts_with('#') {
                continue;
            }
            let parts: Vec<String> = line.split(':').map(str::to_string).collect();
            if parts.len() < min_fields {
                bail!(
                    "Corrupted {} file: line {} has {} fields (expected at least {}) at {}",
                    file,
                    idx + 1,
                    parts.len(),
                    min_fields,
                    path.display()
                );
            }
            entries.push(parts);
        }
        Ok(Self { path, entries })
    }

    fn find(&self, name: &str) -> Option<&[String]> {
        self.entries
            .iter()
            .find(|parts| parts[0] == name)
            .map(Vec::as_slice)
    }

    /// Name of the entry whose numeric field `field` equals `id`.
    fn owner_of_id(&self, field: usize, id: u32) -> Result<Option<&str>> {
        for parts in &self.entries {
            if parse_id(&self.path, &parts[0], &parts[field])? == id {
                return Ok(Some(parts[0].as_str()));
            }
        }
        Ok(None)
    }

    fn append(&self, line: &str, mode: Option<u32>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let needs_newline = fs::read(&self.path)
            .map(|bytes| bytes.last().is_some_and(|b| *b != b'\n'))
            .unwrap_or(false);
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .with_context(|| format!("Failed to open {}", self.path.display()))?;
        if needs_newline {
            writeln!(file)?;
        }
        writeln!(file, "{}", line)
            .with_context(|| format!("Failed to write {}", self.path.display()))?;
        if let Some(mode) = mode {
            fs::set_permissions(&self.path, fs::Permissions::from_mode(mode))?;
        }
        Ok(())
    }
}

fn parse_id(path: &Path, name: &str, value: &str) -> Result<u32> {
    value.parse().with_context(|| {
        format!(
            "Corrupted account file: invalid id '{}' for '{}' at {}",
            value,
            name,
            path.display()
        )
    })
}

/// Read an account together with its password field: the shadow entry when
/// there is one, otherwise the passwd field itself.
pub fn read_account(rootfs: &Path, username: &str) -> Result<Option<Account>> {
    let passwd = AccountDb::load(rootfs, "passwd", 7)?;
    let Some(parts) = passwd.find(username) else {
        return Ok(None);
    };
    let shadow = AccountDb::load(rootfs, "shadow", 2)?;

    Ok(Some(Account {
        name: username.to_string(),
        uid: parse_id(&passwd.path, username, &parts[2])?,
        gid: parse_id(&passwd.path, username, &parts[3])?,
        home: parts[5].clone(),
        shell: parts[6].clone(),
        password: match shadow.find(username) {
            Some(entry) => Some(entry[1].clone()),
            // `x` defers to a shadow entry that does not exist: nothing to match.
            None if parts[1] == "x" => None,
            None => Some(parts[1].clone()),
        },
    }))
}

/// Handle Op::CreateIdentity: add the group, user and locked shadow entry.
///
/// The identity must be new: an existing user of that name, or a uid/gid
/// owned by another entry, is an error. No home directory is created.
pub fn create_identity(rootfs: &Path, identity: &Identity) -> Result<()> {
    let passwd = AccountDb::load(rootfs, "passwd", 7)?;
    let group = AccountDb::load(rootfs, "group", 3)?;
    let shadow = AccountDb::load(rootfs, "shadow", 2)?;
    let name = identity.name();

    if passwd.find(name).is_some() {
        bail!("user '{}' already exists in {}", name, passwd.path.display());
    }
    if shadow.find(name).is_some() {
        bail!("user '{}' already has a shadow entry", name);
    }
    if let Some(owner) = passwd.owner_of_id(2, identity.uid())? {
        bail!("uid {} is already taken by '{}'", identity.uid(), owner);
    }
    if let Some(owner) = group.owner_of_id(2, identity.gid())? {
        bail!("gid {} is already taken by group '{}'", identity.gid(), owner);
    }
    if group.find(name).is_some() {
        bail!("group '{}' already exists with a different gid", name);
    }

    group.append(&format!("{}:x:{}:", name, identity.gid()), None)?;
    passwd.append(
        &format!(
            "{}:x:{}:{}::{}:{}",
            name,
            identity.uid(),
            identity.gid(),
            NO_HOME,
            NO_LOGIN_SHELL
        ),
        None,
    )?;
    shadow.append(&format!("{}:!:::::::", name), Some(0o640))?;
    Ok(())
}
