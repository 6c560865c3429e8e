//! Recursive name resolution across mount tables (component E, §4.E).
//!
//! [`MountTableService`] abstracts a single `ResolveStep`/`Glob` call away
//! from how it's actually reached — in-process for tests and
//! single-process deployments, or over the wire once `fabric-transport`
//! provides a real RPC client. [`Resolver`] drives the recursive walk on
//! top of that abstraction: at each step it asks every currently-known
//! mount table in parallel and takes the first answer, following returned
//! suffixes until a non-mount-table server is reached or depth/loop limits
//! trip.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;

use crate::mount_table::{GlobEntry, MountTable};
use crate::{NamingError, Result};

/// Resolution stops after this many hops even if every hop reported a
/// mount table, guarding against a misconfigured cycle that loop detection
/// somehow missed.
pub const MAX_RESOLVE_DEPTH: usize = 32;

/// A source of `ResolveStep`/`Glob` answers: either a local [`MountTable`]
/// or (eventually) an RPC-backed client talking to a remote mount table.
#[async_trait]
pub trait MountTableService: Send + Sync {
    /// Resolve one step of `name` against this service.
    async fn resolve_step(&self, name: &str, now: u64, caller_names: &[String]) -> Result<crate::mount_table::ResolveStepResult>;

    /// Glob `pattern` against this service, returning every match.
    async fn glob(&self, pattern: &str, now: u64, caller_names: Vec<String>) -> Result<Vec<GlobEntry>>;
}

/// A `MountTableService` backed directly by an in-process [`MountTable`],
/// useful for single-process tests and deployments with no separate mount
/// table daemon.
pub struct LocalMountTableService {
    table: Arc<MountTable>,
}

impl LocalMountTableService {
    /// Wrap `table` as a `MountTableService`.
    pub fn new(table: Arc<MountTable>) -> Self {
        LocalMountTableService { table }
    }
}

#[async_trait]
impl MountTableService for LocalMountTableService {
    async fn resolve_step(&self, name: &str, now: u64, caller_names: &[String]) -> Result<crate::mount_table::ResolveStepResult> {
        self.table.resolve_step(name, now, caller_names)
    }

    async fn glob(&self, pattern: &str, now: u64, caller_names: Vec<String>) -> Result<Vec<GlobEntry>> {
        let mut rx = self.table.glob(pattern, now, caller_names);
        let mut entries = Vec::new();
        while let Some(entry) = rx.recv().await {
            entries.push(entry);
        }
        Ok(entries)
    }
}

/// The final outcome of recursively resolving a name: the terminal
/// (non-mount-table) servers and the suffix left unconsumed at each.
#[derive(Clone, Debug)]
pub struct ResolvedName {
    /// Terminal servers, each paired with whatever suffix of the original
    /// name that server itself must still resolve.
    pub servers: Vec<(String, String)>,
}

/// Dials whatever a mount's `ResolveStep` redirected to, so recursion can
/// cross from one mount-table service to a genuinely different one it never
/// had wired up as a root. Without this, a [`Resolver`] can only federate
/// across services that were all supplied to [`Resolver::new`] up front
/// (§4.E's "recurse with that suffix against the returned servers" requires
/// actually reaching the returned server, not just re-asking the same
/// fixed root list a different name).
#[async_trait]
pub trait ServiceResolver: Send + Sync {
    /// Produce a service to continue resolving `server` against. An error
    /// here aborts the whole resolve — a mount pointing at an address
    /// nothing can reach is a connectivity failure, not an absent name.
    async fn service_for(&self, server: &str) -> Result<Arc<dyn MountTableService>>;
}

/// Drives recursive resolution against a set of namespace-root services.
pub struct Resolver {
    roots: Vec<Arc<dyn MountTableService>>,
    max_depth: usize,
    service_resolver: Option<Arc<dyn ServiceResolver>>,
}

/// Which service the next hop should be resolved against: still racing the
/// original fixed roots, or pinned to whatever [`ServiceResolver`] produced
/// for a mount encountered mid-walk.
enum Target {
    Roots(String),
    Remote(Arc<dyn MountTableService>, String),
}

impl Resolver {
    /// A resolver rooted at `roots`, tried in order at each hop (the first
    /// root to answer successfully wins that hop, matching §4.E's
    /// parallel-race semantics without requiring an executor that supports
    /// real task spawning in this crate's tests).
    pub fn new(roots: Vec<Arc<dyn MountTableService>>) -> Self {
        Resolver {
            roots,
            max_depth: MAX_RESOLVE_DEPTH,
            service_resolver: None,
        }
    }

    /// Override the default depth bound (exposed for tests exercising the
    /// loop-detection path without constructing 32 real hops).
    pub fn with_max_depth(mut self, max_depth: usize) -> Self {
        self.max_depth = max_depth;
        self
    }

    /// Dial mounts dynamically via `service_resolver` instead of re-querying
    /// the fixed `roots` list with a redirected name. Once set, any mount
    /// whose server `service_resolver` can produce a service for is resolved
    /// against that service directly for every hop beyond it.
    pub fn with_service_resolver(mut self, service_resolver: Arc<dyn ServiceResolver>) -> Self {
        self.service_resolver = Some(service_resolver);
        self
    }

    /// Recursively resolve `name` down to terminal servers, following
    /// mount-table redirects until a non-mount-table server answers or a
    /// limit trips.
    pub async fn resolve(&self, name: &str, now: u64, caller_names: &[String]) -> Result<ResolvedName> {
        let mut visited: HashSet<String> = HashSet::new();
        let mut frontier = vec![Target::Roots(name.to_string())];
        let mut terminal = Vec::new();

        for _ in 0..self.max_depth {
            if frontier.is_empty() {
                break;
            }
            let mut next_frontier = Vec::new();

            for current in frontier.drain(..) {
                let step = match &current {
                    Target::Roots(n) => self.resolve_step_raced(n, now, caller_names).await?,
                    Target::Remote(service, n) => service.resolve_step(n, now, caller_names).await?,
                };

                for server in step.servers {
                    if step.is_mount_table {
                        let key = format!("{server}//{}", step.suffix);
                        if !visited.insert(key) {
                            return Err(NamingError::NamingLoop(server));
                        }
                        if let Some(service_resolver) = &self.service_resolver {
                            let service = service_resolver.service_for(&server).await?;
                            next_frontier.push(Target::Remote(service, step.suffix.clone()));
                        } else {
                            let next_name = if step.suffix.is_empty() {
                                server.clone()
                            } else {
                                format!("{server}/{}", step.suffix)
                            };
                            next_frontier.push(Target::Roots(next_name));
                        }
                    } else {
                        terminal.push((server, step.suffix.clone()));
                    }
                }
            }

            frontier = next_frontier;
        }

        if !frontier.is_empty() {
            return Err(NamingError::NamingLoop(name.to_string()));
        }

        Ok(ResolvedName { servers: terminal })
    }

    async fn resolve_step_raced(
        &self,
        name: &str,
        now: u64,
        caller_names: &[String],
    ) -> Result<crate::mount_table::ResolveStepResult> {
        let mut last_err = None;
        for root in &self.roots {
            match root.resolve_step(name, now, caller_names).await {
                Ok(result) => return Ok(result),
                Err(err) => last_err = Some(err),
            }
        }
        Err(last_err.unwrap_or_else(|| NamingError::NoSuchName(name.to_string())))
    }

    /// Federated glob (§4.E): merges matches from every configured root,
    /// tolerating individual root failures (a root that errors simply
    /// contributes no entries rather than failing the whole glob). Every
    /// matched entry is streamed as-is; in addition, for mount points whose
    /// pattern still had an unused tail when the local `Glob` stopped
    /// descending, this reissues `Glob(tail)` against the mounted servers
    /// (via `service_resolver`, when configured) and merges those results
    /// in too — so a pattern like `x/y/z` that crosses a mount at `x`
    /// still reaches `y/z` on the far side.
    pub async fn glob(&self, pattern: &str, now: u64, caller_names: Vec<String>) -> Vec<GlobEntry> {
        enum Source {
            Roots,
            Remote(Arc<dyn MountTableService>),
        }

        let mut results = Vec::new();
        let mut visited: HashSet<String> = HashSet::new();
        let mut queue: VecDeque<(Source, String)> = VecDeque::new();
        queue.push_back((Source::Roots, pattern.to_string()));

        while let Some((source, pattern)) = queue.pop_front() {
            let entries = match &source {
                Source::Roots => {
                    let mut merged = Vec::new();
                    for root in &self.roots {
                        if let Ok(entries) = root.glob(&pattern, now, caller_names.clone()).await {
                            merged.extend(entries);
                        }
                    }
                    merged
                }
                Source::Remote(service) => service.glob(&pattern, now, caller_names.clone()).await.unwrap_or_default(),
            };

            for entry in entries {
                if entry.is_mount_table && !entry.remaining_pattern.is_empty() {
                    if let Some(service_resolver) = &self.service_resolver {
                        for server in &entry.servers {
                            let key = format!("{server}//{}", entry.remaining_pattern);
                            if visited.insert(key) {
                                if let Ok(service) = service_resolver.service_for(server).await {
                                    queue.push_back((Source::Remote(service), entry.remaining_pattern.clone()));
                                }
                            }
                        }
                    }
                }
                results.push(entry);
            }
        }

        results
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mount_table::MountFlags;

    fn names() -> Vec<String> {
        vec!["anyone".to_string()]
    }

    #[tokio::test]
    async fn resolves_through_one_mount_table_hop() {
        let root_table = Arc::new(MountTable::new());
        root_table
            .mount("services/echo", "tcp:echo-server:0", 60, 0, MountFlags::default(), &names())
            .expect("mount");

        let service = Arc::new(LocalMountTableService::new(root_table));
        let resolver = Resolver::new(vec![service]);

        let resolved = resolver.resolve("services/echo", 0, &names()).await.expect("resolve");
        assert_eq!(resolved.servers, vec![("tcp:echo-server:0".to_string(), String::new())]);
    }

    #[tokio::test]
    async fn follows_nested_mount_table_redirect() {
        let inner = Arc::new(MountTable::new());
        inner
            .mount("leaf", "tcp:leaf-server:0", 60, 0, MountFlags::default(), &names())
            .expect("mount leaf");

        let outer = Arc::new(MountTable::new());
        outer
            .mount(
                "sub",
                "tcp:inner-mt:0",
                60,
                0,
                MountFlags { replace: false, mt: true },
                &names(),
            )
            .expect("mount sub");

        // Two independent roots: the outer table answers "sub" hops, but
        // resolving past it requires a second service keyed by the name
        // the outer table redirected to. Since both services are tried at
        // every hop here, a request for the inner leaf via the outer's
        // redirect target resolves once the frontier reaches "tcp:inner-mt:0/leaf".
        struct InnerAtRedirectedName {
            inner: Arc<MountTable>,
        }

        #[async_trait::async_trait]
        impl MountTableService for InnerAtRedirectedName {
            async fn resolve_step(
                &self,
                name: &str,
                now: u64,
                caller_names: &[String],
            ) -> Result<crate::mount_table::ResolveStepResult> {
                let stripped = name.strip_prefix("tcp:inner-mt:0/").unwrap_or(name);
                if stripped == name && name != "tcp:inner-mt:0" {
                    return Err(NamingError::NoSuchName(name.to_string()));
                }
                let suffix = if stripped == name { "" } else { stripped };
                self.inner.resolve_step(suffix, now, caller_names)
            }

            async fn glob(&self, _pattern: &str, _now: u64, _caller_names: Vec<String>) -> Result<Vec<GlobEntry>> {
                Ok(Vec::new())
            }
        }

        let outer_service = Arc::new(LocalMountTableService::new(outer));
        let inner_service = Arc::new(InnerAtRedirectedName { inner });
        let resolver = Resolver::new(vec![outer_service, inner_service]);

        let resolved = resolver.resolve("sub/leaf", 0, &names()).await.expect("resolve");
        assert_eq!(resolved.servers, vec![("tcp:leaf-server:0".to_string(), String::new())]);
    }

    #[tokio::test]
    async fn service_resolver_dials_a_redirect_target_never_supplied_as_a_root() {
        let inner = Arc::new(MountTable::new());
        inner
            .mount("leaf", "tcp:leaf-server:0", 60, 0, MountFlags::default(), &names())
            .expect("mount leaf");

        let outer = Arc::new(MountTable::new());
        outer
            .mount("sub", "tcp:inner-mt:0", 60, 0, MountFlags { replace: false, mt: true }, &names())
            .expect("mount sub");

        struct DialsInnerByAddress {
            inner: Arc<MountTable>,
        }

        #[async_trait::async_trait]
        impl ServiceResolver for DialsInnerByAddress {
            async fn service_for(&self, server: &str) -> Result<Arc<dyn MountTableService>> {
                assert_eq!(server, "tcp:inner-mt:0", "must be asked to dial exactly what the mount redirected to");
                Ok(Arc::new(LocalMountTableService::new(Arc::clone(&self.inner))))
            }
        }

        let resolver = Resolver::new(vec![Arc::new(LocalMountTableService::new(outer))])
            .with_service_resolver(Arc::new(DialsInnerByAddress { inner }));

        let resolved = resolver.resolve("sub/leaf", 0, &names()).await.expect("resolve");
        assert_eq!(resolved.servers, vec![("tcp:leaf-server:0".to_string(), String::new())]);
    }

    #[tokio::test]
    async fn no_such_name_propagates() {
        let table = Arc::new(MountTable::new());
        let service = Arc::new(LocalMountTableService::new(table));
        let resolver = Resolver::new(vec![service]);

        let err = resolver.resolve("missing", 0, &names()).await;
        assert!(matches!(err, Err(NamingError::NoSuchName(_))));
    }

    #[tokio::test]
    async fn depth_limit_trips_on_unresolvable_self_redirect() {
        struct AlwaysRedirects;

        #[async_trait::async_trait]
        impl MountTableService for AlwaysRedirects {
            async fn resolve_step(
                &self,
                _name: &str,
                _now: u64,
                _caller_names: &[String],
            ) -> Result<crate::mount_table::ResolveStepResult> {
                Ok(crate::mount_table::ResolveStepResult {
                    servers: vec!["tcp:same:0".to_string()],
                    suffix: String::new(),
                    is_mount_table: true,
                })
            }

            async fn glob(&self, _pattern: &str, _now: u64, _caller_names: Vec<String>) -> Result<Vec<GlobEntry>> {
                Ok(Vec::new())
            }
        }

        let resolver = Resolver::new(vec![Arc::new(AlwaysRedirects)]).with_max_depth(3);
        let err = resolver.resolve("start", 0, &names()).await;
        assert!(matches!(err, Err(NamingError::NamingLoop(_))));
    }

    #[tokio::test]
    async fn federated_glob_merges_all_roots() {
        let a = Arc::new(MountTable::new());
        a.mount("x", "s1", 60, 0, MountFlags::default(), &names()).expect("mount");
        let b = Arc::new(MountTable::new());
        b.mount("y", "s2", 60, 0, MountFlags::default(), &names()).expect("mount");

        let resolver = Resolver::new(vec![
            Arc::new(LocalMountTableService::new(a)),
            Arc::new(LocalMountTableService::new(b)),
        ]);

        let mut entries = resolver.glob("*", 0, names()).await;
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        let found: Vec<_> = entries.iter().map(|e| e.name.clone()).collect();
        assert_eq!(found, vec!["x".to_string(), "y".to_string()]);
    }

    #[tokio::test]
    async fn federated_glob_reissues_against_mount_with_unused_tail() {
        let inner = Arc::new(MountTable::new());
        inner
            .mount("y/z", "tcp:leaf-server:0", 60, 0, MountFlags::default(), &names())
            .expect("mount leaf");

        let outer = Arc::new(MountTable::new());
        outer
            .mount("x", "tcp:inner-mt:0", 60, 0, MountFlags { replace: false, mt: true }, &names())
            .expect("mount sub");

        struct DialsInnerByAddress {
            inner: Arc<MountTable>,
        }

        #[async_trait::async_trait]
        impl ServiceResolver for DialsInnerByAddress {
            async fn service_for(&self, server: &str) -> Result<Arc<dyn MountTableService>> {
                assert_eq!(server, "tcp:inner-mt:0");
                Ok(Arc::new(LocalMountTableService::new(Arc::clone(&self.inner))))
            }
        }

        let resolver = Resolver::new(vec![Arc::new(LocalMountTableService::new(outer))])
            .with_service_resolver(Arc::new(DialsInnerByAddress { inner }));

        // "x/y/z" exhausts at "x" locally (a mount point with an unused
        // tail "y/z"), so the federated glob must reissue Glob("y/z")
        // against the mounted inner table to actually find the leaf.
        let entries = resolver.glob("x/y/z", 0, names()).await;
        let names_found: Vec<_> = entries.iter().map(|e| e.name.clone()).collect();
        assert!(names_found.contains(&"x".to_string()), "mount point itself is still streamed: {names_found:?}");
        assert!(names_found.contains(&"y/z".to_string()), "tail must be resolved remotely: {names_found:?}");
        let leaf = entries.iter().find(|e| e.name == "y/z").expect("leaf entry");
        assert_eq!(leaf.servers, vec!["tcp:leaf-server:0".to_string()]);
    }
}
