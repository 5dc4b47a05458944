//! Resolution of the user a container process runs as.

use garden_common::constants::{DEFAULT_USER, ROOT_USER};
use nix::unistd::{User, geteuid};

/// Host account for `root` in unprivileged containers and for users the
/// host does not know.
const UNPRIVILEGED_ACCOUNT: &str = "nobody";

/// Overflow uid and gid, used when the host has no usable `nobody`.
const OVERFLOW_ID: u32 = 65534;

/// A user as seen by a container process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedUser {
    /// Account name, exported as `USER`.
    pub name: String,
    /// Home directory inside the container, exported as `HOME`.
    pub home: String,
    /// Host uid and gid to switch to, when the server can switch.
    pub credentials: Option<(u32, u32)>,
}

/// Picks the user for a process.
///
/// An empty `requested` name means `root` for privileged processes and
/// `vcap` otherwise. Credentials are only switched when the server runs
/// as root. Only `root` in a privileged container keeps the server's
/// credentials; every other user runs as its host account, or as
/// `nobody` when that account is missing or would be host root.
#[must_use]
pub fn resolve(requested: &str, privileged_process: bool, privileged_container: bool) -> ResolvedUser {
    let name = if requested.is_empty() {
        if privileged_process { ROOT_USER } else { DEFAULT_USER }
    } else {
        requested
    };
    let home = if name == ROOT_USER {
        "/root".to_owned()
    } else {
        format!("/home/{name}")
    };

    let credentials = if geteuid().is_root() {
        host_credentials(name, privileged_container)
    } else {
        None
    };

    ResolvedUser {
        name: name.to_owned(),
        home,
        credentials,
    }
}

fn host_credentials(name: &str, privileged_container: bool) -> Option<(u32, u32)> {
    let account = if name == ROOT_USER && !privileged_container {
        UNPRIVILEGED_ACCOUNT
    } else {
        name
    };
    match lookup(account) {
        Some((0, _)) if privileged_container => None,
        Some((0, _)) | None => Some(unprivileged()),
        Some(ids) => Some(ids),
    }
}

fn lookup(account: &str) -> Option<(u32, u32)> {
    match User::from_name(account) {
        Ok(Some(user)) => Some((user.uid.as_raw(), user.gid.as_raw())),
        Ok(None) => {
            tracing::debug!(user = account, "no host account");
            None
        }
        Err(e) => {
            tracing::warn!(user = account, error = %e, "user lookup failed");
            None
        }
    }
}

fn unprivileged() -> (u32, u32) {
    lookup(UNPRIVILEGED_ACCOUNT)
        .filter(|(uid, _)| *uid != 0)
        .unwrap_or((OVERFLOW_ID, OVERFLOW_ID))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_user_depends_on_privilege() {
        let user = resolve("", false, false);
        assert_eq!(user.name, "vcap");
        assert_eq!(user.home, "/home/vcap");

        let root = resolve("", true, true);
        assert_eq!(root.name, "root");
        assert_eq!(root.home, "/root");
    }

    #[test]
    fn explicit_user_is_kept() {
        let user = resolve("alice", true, false);
        assert_eq!(user.name, "alice");
        assert_eq!(user.home, "/home/alice");
    }

    #[test]
    fn unknown_account_never_runs_as_host_root() {
        let user = resolve("no-such-garden-user", false, false);
        if geteuid().is_root() {
            let (uid, gid) = user.credentials.unwrap();
            assert_ne!(uid, 0);
            assert_ne!(gid, 0);
        } else {
            assert_eq!(user.credentials, None);
        }
    }

    #[test]
    fn root_in_an_unprivileged_container_is_not_host_root() {
        let user = resolve("", true, false);
        assert_eq!(user.name, "root");
        if geteuid().is_root() {
            assert!(user.credentials.is_some_and(|(uid, _)| uid != 0));
        } else {
            assert_eq!(user.credentials, None);
        }
    }

    #[test]
    fn root_in_a_privileged_container_keeps_server_credentials() {
        assert_eq!(resolve("", true, true).credentials, None);
    }
}
