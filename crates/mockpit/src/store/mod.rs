use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::process::Child;
use tokio::sync::Mutex;

use crate::domain::{RouteDefinition, RouteMatcher, ServerSummary};

/// Ordered, in-memory route list for one managed server. The single
/// source of truth during a session; persistence and the remote API
/// are synchronized from it, never the other way around mid-flight.
#[derive(Debug, Default)]
pub struct RouteStore {
    routes: Vec<RouteDefinition>,
}

impl RouteStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_routes(routes: Vec<RouteDefinition>) -> Self {
        Self { routes }
    }

    /// Appends without deduplicating: duplicate (method, path) pairs
    /// coexist and the serving process resolves matches
    /// last-write-wins.
    pub fn add(&mut self, route: RouteDefinition) {
        self.routes.push(route);
    }

    /// Removes every route the matcher accepts (at most one under
    /// correct use) and returns how many were dropped. Removing an
    /// absent route is a no-op, not an error.
    pub fn remove(&mut self, matcher: &RouteMatcher) -> usize {
        let before = self.routes.len();
        self.routes.retain(|r| !matcher.matches(r));
        before - self.routes.len()
    }

    /// Swaps the whole list in one assignment so no partial state is
    /// ever observable.
    pub fn replace_all(&mut self, routes: Vec<RouteDefinition>) {
        self.routes = routes;
    }

    pub fn routes(&self) -> &[RouteDefinition] {
        &self.routes
    }

    /// Read-only view dropping entries without a usable method/path.
    /// Everything rendered or persisted goes through this filter.
    pub fn valid_routes(&self) -> Vec<RouteDefinition> {
        self.routes.iter().filter(|r| r.is_valid()).cloned().collect()
    }

    pub fn valid_count(&self) -> usize {
        self.routes.iter().filter(|r| r.is_valid()).count()
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

/// One supervised server instance: route set, launch parameters, and
/// the child process handle (owned exclusively by the supervisor).
#[derive(Debug)]
pub struct ManagedServer {
    pub name: String,
    pub port: u16,
    pub java_path: String,
    /// When set, routes were loaded from this file and it is never
    /// overwritten by snapshot persistence.
    pub external_config_path: Option<PathBuf>,
    pub store: RouteStore,
    pub child: Option<Child>,
    pub pid: Option<u32>,
    pub running: bool,
    /// Bumped on every spawn so a stale exit monitor cannot reconcile
    /// state belonging to a newer child.
    pub generation: u64,
}

impl ManagedServer {
    pub fn new(name: impl Into<String>, port: u16, java_path: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            port,
            java_path: java_path.into(),
            external_config_path: None,
            store: RouteStore::new(),
            child: None,
            pid: None,
            running: false,
            generation: 0,
        }
    }

    pub fn from_summary(summary: ServerSummary) -> Self {
        let mut server = Self::new(summary.name, summary.port, summary.java_path);
        server.store = RouteStore::from_routes(summary.api_list);
        server
    }

    /// The document the spawned process reads at startup: the external
    /// file when one is loaded, the shared active document otherwise.
    pub fn active_config_path<'a>(&'a self, shared: &'a Path) -> &'a Path {
        self.external_config_path.as_deref().unwrap_or(shared)
    }

    /// Snapshot element for the UI document. Servers backed by an
    /// external file contribute an empty route list; that file stays
    /// their source of truth.
    pub fn summary(&self) -> ServerSummary {
        ServerSummary {
            name: self.name.clone(),
            port: self.port,
            java_path: self.java_path.clone(),
            api_list: if self.external_config_path.is_some() {
                Vec::new()
            } else {
                self.store.valid_routes()
            },
        }
    }
}

/// Named handle wrapping a server behind an async mutex. Every
/// compound mutate-persist-restart sequence holds the lock for its
/// whole duration, so interleaved intents against the same server
/// serialize instead of racing at await points.
///
/// Invariant: no code path acquires a second server's mutex while
/// holding one. Whole-registry views read the per-handle summary
/// cache instead.
pub struct ServerHandle {
    name: String,
    inner: Mutex<ManagedServer>,
    summary: parking_lot::Mutex<ServerSummary>,
}

impl ServerHandle {
    pub fn new(server: ManagedServer) -> Arc<Self> {
        Arc::new(Self {
            name: server.name.clone(),
            summary: parking_lot::Mutex::new(server.summary()),
            inner: Mutex::new(server),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub async fn lock(&self) -> tokio::sync::MutexGuard<'_, ManagedServer> {
        self.inner.lock().await
    }

    /// Refresh the cached summary. Called while the server guard is
    /// still held, so the cache never lags a completed mutation.
    pub fn publish_summary(&self, server: &ManagedServer) {
        *self.summary.lock() = server.summary();
    }

    pub fn cached_summary(&self) -> ServerSummary {
        self.summary.lock().clone()
    }
}

/// Explicit registry of managed servers, constructed once at daemon
/// startup and passed by handle to every component that needs it.
pub struct ServerRegistry {
    servers: Vec<Arc<ServerHandle>>,
}

impl ServerRegistry {
    pub fn from_servers(servers: Vec<ManagedServer>) -> Self {
        Self {
            servers: servers.into_iter().map(ServerHandle::new).collect(),
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<ServerHandle>> {
        self.servers.iter().find(|s| s.name() == name).cloned()
    }

    pub fn handles(&self) -> Vec<Arc<ServerHandle>> {
        self.servers.clone()
    }

    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }

    /// Snapshot built from the per-handle caches. Takes no server
    /// mutex, so it is safe to call while one of them is held.
    pub fn cached_summaries(&self) -> Vec<ServerSummary> {
        self.servers.iter().map(|s| s.cached_summary()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Method;

    fn route(method: Method, path: &str) -> RouteDefinition {
        RouteDefinition::new(method, path)
    }

    #[test]
    fn add_permits_duplicate_method_path_pairs() {
        // Intentional: duplicates coexist, match resolution is
        // last-write-wins inside the serving process.
        let mut store = RouteStore::new();
        store.add(route(Method::GET, "/users"));
        store.add(route(Method::GET, "/users"));
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn remove_absent_route_is_a_noop() {
        let mut store = RouteStore::new();
        store.add(route(Method::GET, "/users"));
        let removed = store.remove(&RouteMatcher::Key {
            method: Method::POST,
            path: "/users".into(),
        });
        assert_eq!(removed, 0);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn remove_by_key_drops_all_matches() {
        let mut store = RouteStore::new();
        store.add(route(Method::GET, "/users"));
        store.add(route(Method::GET, "/users"));
        store.add(route(Method::POST, "/users"));
        let removed = store.remove(&RouteMatcher::Key {
            method: Method::GET,
            path: "/users".into(),
        });
        assert_eq!(removed, 2);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn remove_by_id_ignores_key_fields() {
        let mut store = RouteStore::new();
        let mut a = route(Method::GET, "/a");
        a.id = Some("1".into());
        let mut b = route(Method::GET, "/b");
        b.id = Some("2".into());
        store.add(a);
        store.add(b);
        assert_eq!(store.remove(&RouteMatcher::Id("2".into())), 1);
        assert_eq!(store.routes()[0].path.as_deref(), Some("/a"));
    }

    #[test]
    fn valid_filter_is_exact_and_idempotent() {
        let mut store = RouteStore::new();
        store.add(route(Method::GET, "/ok"));
        store.add(RouteDefinition {
            path: Some("/no-method".into()),
            ..RouteDefinition::default()
        });
        store.add(RouteDefinition {
            method: Some(Method::PUT),
            ..RouteDefinition::default()
        });

        let once = store.valid_routes();
        assert_eq!(once.len(), 1);
        assert_eq!(once[0].path.as_deref(), Some("/ok"));

        let twice: Vec<_> = once.iter().filter(|r| r.is_valid()).cloned().collect();
        assert_eq!(once, twice);
        assert_eq!(store.valid_count(), 1);
        assert_eq!(store.len(), 3);
    }

    #[test]
    fn replace_all_swaps_the_entire_list() {
        let mut store = RouteStore::new();
        store.add(route(Method::GET, "/old"));
        store.replace_all(vec![route(Method::POST, "/new"), route(Method::PUT, "/new2")]);
        assert_eq!(store.len(), 2);
        assert_eq!(store.routes()[0].path.as_deref(), Some("/new"));
    }

    #[test]
    fn summary_omits_routes_for_externally_backed_servers() {
        let mut server = ManagedServer::new("localhost", 8081, "java");
        server.store.add(route(Method::GET, "/users"));

        let summary = server.summary();
        assert_eq!(summary.api_list.len(), 1);

        server.external_config_path = Some(PathBuf::from("/tmp/routes.json"));
        let summary = server.summary();
        assert!(summary.api_list.is_empty());
    }

    #[test]
    fn registry_lookup_by_name() {
        let registry = ServerRegistry::from_servers(vec![
            ManagedServer::new("localhost", 8081, "java"),
            ManagedServer::new("staging", 8082, "java"),
        ]);
        assert!(registry.get("staging").is_some());
        assert!(registry.get("missing").is_none());
        assert_eq!(registry.cached_summaries().len(), 2);
    }

    #[tokio::test]
    async fn cached_summary_tracks_published_mutations() {
        let handle = ServerHandle::new(ManagedServer::new("localhost", 8081, "java"));
        assert!(handle.cached_summary().api_list.is_empty());

        let server = {
            let mut server = handle.lock().await;
            server.store.add(route(Method::GET, "/users"));
            // Stale until explicitly published.
            assert!(handle.cached_summary().api_list.is_empty());
            handle.publish_summary(&server);
            drop(server);
            handle.cached_summary()
        };
        assert_eq!(server.api_list.len(), 1);
    }
}
