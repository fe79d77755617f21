//! Machine identity resolution.
//!
//! The machine id is produced by an external collaborator (by default a shell
//! command reading the host serial). Resolution may fail; callers then use
//! [`UNRESOLVED`] and try again on a later record.

use std::io::Read;
use std::process::{Command, Stdio};
use std::sync::Arc;
use std::time::{Duration, Instant};

use arc_swap::ArcSwapOption;

use crate::aggregate::key::is_valid_component;

/// Machine id used while resolution has not succeeded.
pub const UNRESOLVED: &str = "-1";

/// Default command printing the host serial.
pub const DEFAULT_COMMAND: &str = "cat /etc/nagent_sn";

/// Resolves the local machine identifier.
pub trait IdentityResolver: Send + Sync {
    /// Returns the identifier, or `None` when it cannot be determined now.
    fn resolve_identity(&self) -> Option<String>;
}

/// Resolver returning a fixed value.
pub struct StaticIdentity(pub String);

impl IdentityResolver for StaticIdentity {
    fn resolve_identity(&self) -> Option<String> {
        Some(self.0.clone())
    }
}

/// Resolver running `/bin/sh -c <command>` with a timeout.
pub struct CommandIdentity {
    command: String,
    timeout: Duration,
}

impl CommandIdentity {
    pub fn new(command: impl Into<String>, timeout: Duration) -> Self {
        Self {
            command: command.into(),
            timeout,
        }
    }
}

impl IdentityResolver for CommandIdentity {
    fn resolve_identity(&self) -> Option<String> {
        match run_with_timeout(&self.command, self.timeout) {
            Ok(id) => Some(id),
            Err(reason) => {
                tracing::debug!(command = %self.command, reason = %reason, "machine id unresolved");
                None
            }
        }
    }
}

fn run_with_timeout(command: &str, timeout: Duration) -> Result<String, String> {
    let mut child = Command::new("/bin/sh")
        .arg("-c")
        .arg(command)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .map_err(|e| format!("spawn failed: {e}"))?;

    let deadline = Instant::now() + timeout;
    let status = loop {
        match child.try_wait() {
            Ok(Some(status)) => break status,
            Ok(None) if Instant::now() >= deadline => {
                let _ = child.kill();
                let _ = child.wait();
                return Err("timed out".to_string());
            }
            Ok(None) => std::thread::sleep(Duration::from_millis(10)),
            Err(e) => return Err(format!("wait failed: {e}")),
        }
    };

    if !status.success() {
        return Err(format!("exited with {status}"));
    }

    let mut out = String::new();
    if let Some(mut stdout) = child.stdout.take() {
        stdout
            .read_to_string(&mut out)
            .map_err(|e| format!("reading output: {e}"))?;
    }

    let id = out.trim();
    if id.is_empty() {
        return Err("empty output".to_string());
    }
    if !is_valid_component(id) {
        return Err("output contains a reserved delimiter".to_string());
    }
    Ok(id.to_string())
}

/// Caches the first successfully resolved machine id.
///
/// Until resolution succeeds, [`IdentityCache::resolve`] returns the sentinel
/// and retries the resolver on every call.
pub struct IdentityCache {
    resolver: Arc<dyn IdentityResolver>,
    resolved: ArcSwapOption<Arc<str>>,
    unresolved: Arc<str>,
}

impl IdentityCache {
    pub fn new(resolver: Arc<dyn IdentityResolver>) -> Self {
        Self {
            resolver,
            resolved: ArcSwapOption::const_empty(),
            unresolved: Arc::from(UNRESOLVED),
        }
    }

    /// Cached id, if resolution has succeeded. Never blocks.
    pub fn current(&self) -> Option<Arc<str>> {
        self.resolved
            .load()
            .as_ref()
            .map(|id| Arc::clone(id.as_ref()))
    }

    pub fn is_resolved(&self) -> bool {
        self.resolved.load().is_some()
    }

    /// Cached id, resolving (and caching on success) if needed. Returns the
    /// sentinel when the resolver fails.
    ///
    /// May block on the resolver; async callers go through
    /// `spawn_blocking` while [`IdentityCache::is_resolved`] is false.
    pub fn resolve(&self) -> Arc<str> {
        if let Some(id) = self.current() {
            return id;
        }

        match self.resolver.resolve_identity() {
            Some(id) if !id.is_empty() && id != UNRESOLVED && is_valid_component(&id) => {
                let id: Arc<str> = Arc::from(id);
                self.resolved.store(Some(Arc::new(Arc::clone(&id))));
                tracing::info!(machine_id = %id, "machine id resolved");
                id
            }
            _ => Arc::clone(&self.unresolved),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    /// Fails a fixed number of times, then succeeds.
    struct Flaky {
        failures: usize,
        calls: AtomicUsize,
    }

    impl IdentityResolver for Flaky {
        fn resolve_identity(&self) -> Option<String> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            (n >= self.failures).then(|| "sn-42".to_string())
        }
    }

    #[test]
    fn test_cache_retries_until_resolved() {
        let flaky = Arc::new(Flaky {
            failures: 2,
            calls: AtomicUsize::new(0),
        });
        let cache = IdentityCache::new(flaky.clone());

        assert_eq!(&*cache.resolve(), UNRESOLVED);
        assert_eq!(&*cache.resolve(), UNRESOLVED);
        assert!(!cache.is_resolved());
        assert_eq!(&*cache.resolve(), "sn-42");
        assert!(cache.is_resolved());

        // Cached: no further resolver calls.
        assert_eq!(&*cache.resolve(), "sn-42");
        assert_eq!(flaky.calls.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_cache_rejects_reserved_characters() {
        let cache = IdentityCache::new(Arc::new(StaticIdentity("a|b".to_string())));
        assert_eq!(&*cache.resolve(), UNRESOLVED);
        assert!(cache.current().is_none());
    }

    #[test]
    fn test_command_identity_success() {
        let id = CommandIdentity::new("echo '  host-7 '", Duration::from_secs(5));
        assert_eq!(id.resolve_identity().as_deref(), Some("host-7"));
    }

    #[test]
    fn test_command_identity_failures() {
        let timeout = Duration::from_secs(5);
        assert!(CommandIdentity::new("exit 3", timeout)
            .resolve_identity()
            .is_none());
        assert!(CommandIdentity::new("printf ''", timeout)
            .resolve_identity()
            .is_none());
        assert!(CommandIdentity::new("echo a,b", timeout)
            .resolve_identity()
            .is_none());
        assert!(CommandIdentity::new("cat /nonexistent/loadtally/sn", timeout)
            .resolve_identity()
            .is_none());
    }

    #[test]
    fn test_command_identity_timeout() {
        let started = Instant::now();
        let id = CommandIdentity::new("sleep 5", Duration::from_millis(100));
        assert!(id.resolve_identity().is_none());
        assert!(started.elapsed() < Duration::from_secs(3));
    }
}
