//! Runtime identity and the one-way privilege downgrade.
//!
//! [`Identity`] can only hold a non-root principal. [`PrivilegeState`]
//! tracks the build-time transition from the administrative context to that
//! identity; [`drop_process_privileges`] performs the same transition for a
//! live process before it runs the image entrypoint.

use serde::{Deserialize, Serialize};
use std::fmt;

use anyhow::{bail, Result};

use crate::error::ProvisionError;

/// Home directory recorded for the identity. It is never created.
pub const NO_HOME: &str = "/nonexistent";

/// Login shell recorded for the identity.
pub const NO_LOGIN_SHELL: &str = "/usr/sbin/nologin";

/// Non-root execution principal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawIdentity", into = "RawIdentity")]
pub struct Identity {
    name: String,
    uid: u32,
    gid: u32,
}

#[derive(Serialize, Deserialize)]
struct RawIdentity {
    name: String,
    uid: u32,
    gid: u32,
}

impl TryFrom<RawIdentity> for Identity {
    type Error = anyhow::Error;

    fn try_from(raw: RawIdentity) -> Result<Self> {
        Identity::new(&raw.name, raw.uid, raw.gid)
    }
}

impl From<Identity> for RawIdentity {
    fn from(identity: Identity) -> Self {
        RawIdentity {
            name: identity.name,
            uid: identity.uid,
            gid: identity.gid,
        }
    }
}

impl Identity {
    /// Validate and build an identity. Root (by name, uid or gid) is rejected.
    pub fn new(name: &str, uid: u32, gid: u32) -> Result<Self> {
        validate_user_name(name)?;
        if name == "root" {
            bail!("runtime identity must not be 'root'");
        }
        if uid == 0 {
            bail!("runtime identity '{}' must not use uid 0", name);
        }
        if gid == 0 {
            bail!("runtime identity '{}' must not use gid 0", name);
        }
        Ok(Self {
            name: name.to_string(),
            uid,
            gid,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn uid(&self) -> u32 {
        self.uid
    }

    pub fn gid(&self) -> u32 {
        self.gid
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}:{})", self.name, self.uid, self.gid)
    }
}

/// `[a-z_][a-z0-9_-]{0,31}`
fn validate_user_name(name: &str) -> Result<()> {
    let mut chars = name.chars();
    let first_ok = chars
        .next()
        .is_some_and(|c| c.is_ascii_lowercase() || c == '_');
    let rest_ok = chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' || c == '-');
    if !first_ok || !rest_ok || name.len() > 32 {
        bail!("invalid user name '{}'", name);
    }
    Ok(())
}

/// Build-time privilege context.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum PrivilegeState {
    /// Stages run with administrative rights.
    #[default]
    Elevated,
    /// Terminal: every later stage runs as this identity.
    Dropped(Identity),
}

impl PrivilegeState {
    /// Fail if `stage` needs rights the current context no longer has.
    pub fn require_elevated(&self, stage: &str) -> Result<(), ProvisionError> {
        match self {
            PrivilegeState::Elevated => Ok(()),
            PrivilegeState::Dropped(_) => Err(ProvisionError::PrivilegeRegression {
                stage: stage.to_string(),
            }),
        }
    }

    /// Perform the one-way transition.
    pub fn drop_to(&mut self, stage: &str, identity: Identity) -> Result<(), ProvisionError> {
        self.require_elevated(stage)?;
        tracing::info!(stage, identity = %identity, "dropping privileges");
        *self = PrivilegeState::Dropped(identity);
        Ok(())
    }

    pub fn identity(&self) -> Option<&Identity> {
        match self {
            PrivilegeState::Elevated => None,
            PrivilegeState::Dropped(identity) => Some(identity),
        }
    }
}

/// Switch the current process to `identity` permanently.
///
/// Supplementary groups are cleared, then gid, then uid. Afterwards the
/// process must not be able to regain uid 0.
pub fn drop_process_privileges(identity: &Identity) -> Result<()> {
    // SAFETY: plain libc credential calls with no pointers retained.
    unsafe {
        if libc::setgroups(0, std::ptr::null()) != 0 {
            bail!(
                "setgroups failed: {}",
                std::io::Error::last_os_error()
            );
        }
        if libc::setgid(identity.gid()) != 0 {
            bail!(
                "setgid({}) failed: {}",
                identity.gid(),
                std::io::Error::last_os_error()
            );
        }
        if libc::setuid(identity.uid()) != 0 {
            bail!(
                "setuid({}) failed: {}",
                identity.uid(),
                std::io::Error::last_os_error()
            );
        }
        if libc::getuid() == 0 || libc::geteuid() == 0 {
            bail!("process still runs as root after dropping to {}", identity);
        }
        if libc::setuid(0) == 0 {
            bail!("process regained root after dropping to {}", identity);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_rejects_root() {
        assert!(Identity::new("root", 1000, 1000).is_err());
        assert!(Identity::new("app", 0, 1000).is_err());
        assert!(Identity::new("app", 1000, 0).is_err());
        assert!(Identity::new("app", 1000, 1000).is_ok());
    }

    #[test]
    fn test_identity_name_validation() {
        assert!(Identity::new("_svc", 999, 999).is_ok());
        assert!(Identity::new("web-app1", 999, 999).is_ok());
        assert!(Identity::new("App", 999, 999).is_err());
        assert!(Identity::new("1app", 999, 999).is_err());
        assert!(Identity::new("", 999, 999).is_err());
        assert!(Identity::new(&"a".repeat(33), 999, 999).is_err());
    }

    #[test]
    fn test_identity_deserialize_validates() {
        let ok: Identity = serde_json::from_str(r#"{"name":"app","uid":1000,"gid":1000}"#).unwrap();
        assert_eq!(ok.uid(), 1000);
        let bad = serde_json::from_str::<Identity>(r#"{"name":"root","uid":0,"gid":0}"#);
        assert!(bad.is_err());
    }

    #[test]
    fn test_privilege_drop_is_one_way() {
        let identity = Identity::new("app", 1000, 1000).unwrap();
        let mut state = PrivilegeState::default();
        assert!(state.require_elevated("install").is_ok());

        state.drop_to("user", identity.clone()).unwrap();
        assert_eq!(state.identity(), Some(&identity));

        let err = state.require_elevated("late-install").unwrap_err();
        assert!(matches!(err, ProvisionError::PrivilegeRegression { .. }));

        let err = state.drop_to("second-drop", identity).unwrap_err();
        assert!(matches!(err, ProvisionError::PrivilegeRegression { .. }));
    }
}
