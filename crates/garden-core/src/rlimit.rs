//! POSIX resource limits for container processes.
//!
//! Limits are collected in the parent and applied in the child between
//! `fork` and `exec`, where only async-signal-safe calls are allowed.

use garden_common::types::ResourceLimits;
use nix::sys::resource::{Resource, setrlimit};

/// Flattens the requested limits into `(resource, value)` pairs.
#[must_use]
pub fn requested(limits: &ResourceLimits) -> Vec<(Resource, u64)> {
    [
        (Resource::RLIMIT_AS, limits.as_),
        (Resource::RLIMIT_CORE, limits.core),
        (Resource::RLIMIT_CPU, limits.cpu),
        (Resource::RLIMIT_DATA, limits.data),
        (Resource::RLIMIT_FSIZE, limits.fsize),
        (Resource::RLIMIT_LOCKS, limits.locks),
        (Resource::RLIMIT_MEMLOCK, limits.memlock),
        (Resource::RLIMIT_MSGQUEUE, limits.msgqueue),
        (Resource::RLIMIT_NICE, limits.nice),
        (Resource::RLIMIT_NOFILE, limits.nofile),
        (Resource::RLIMIT_NPROC, limits.nproc),
        (Resource::RLIMIT_RSS, limits.rss),
        (Resource::RLIMIT_RTPRIO, limits.rtprio),
        (Resource::RLIMIT_SIGPENDING, limits.sigpending),
        (Resource::RLIMIT_STACK, limits.stack),
    ]
    .into_iter()
    .filter_map(|(resource, value)| value.map(|v| (resource, v)))
    .collect()
}

/// Sets both the soft and hard limit of every pair.
///
/// Meant to run in a freshly forked child.
///
/// # Errors
///
/// Returns the first `setrlimit(2)` failure.
pub fn apply(limits: &[(Resource, u64)]) -> std::io::Result<()> {
    for (resource, value) in limits {
        setrlimit(*resource, *value, *value).map_err(std::io::Error::from)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_requested_limits_are_returned() {
        let limits = ResourceLimits {
            nofile: Some(1234),
            fsize: Some(4096),
            ..ResourceLimits::default()
        };
        let pairs = requested(&limits);
        assert_eq!(pairs.len(), 2);
        assert!(pairs.contains(&(Resource::RLIMIT_NOFILE, 1234)));
        assert!(pairs.contains(&(Resource::RLIMIT_FSIZE, 4096)));
    }

    #[test]
    fn nothing_requested_is_empty() {
        assert!(requested(&ResourceLimits::default()).is_empty());
        apply(&[]).unwrap();
    }
}
