use std::sync::Arc;

use tracing::{debug, warn};

use super::strategy::{FetchRules, Strategy};
use crate::cache::{CacheRole, CacheStorage, CachedEntry, GenerationId};
use crate::clock::Clock;
use crate::error::FetchError;
use crate::http::{Network, Request, Response};

/// Serves intercepted requests for one active generation.
///
/// Network failures are turned into cache lookups; the only error a caller
/// sees is a network failure with nothing cached to fall back on. Cache
/// failures are logged and never block a live response.
///
/// Clone is cheap; clones share storage, network and rules.
#[derive(Clone)]
pub struct FetchInterceptor {
    storage: CacheStorage,
    network: Arc<dyn Network>,
    clock: Arc<dyn Clock>,
    rules: Arc<FetchRules>,
    generation: GenerationId,
}

impl FetchInterceptor {
    pub fn new(
        storage: CacheStorage,
        network: Arc<dyn Network>,
        clock: Arc<dyn Clock>,
        rules: Arc<FetchRules>,
        generation: GenerationId,
    ) -> Self {
        Self {
            storage,
            network,
            clock,
            rules,
            generation,
        }
    }

    pub async fn handle(&self, request: &Request) -> Result<Response, FetchError> {
        let strategy = self.rules.select(request);
        debug!(url = %request.url, %strategy, generation = %self.generation, "Intercepted request");

        match strategy {
            Strategy::NetworkFirst => self.network_first(request).await,
            Strategy::CacheFirst => self.cache_first(request).await,
            Strategy::NavigationShell => self.navigation(request).await,
            Strategy::CacheThenNetwork => self.cache_then_network(request).await,
            Strategy::Passthrough => self.network.fetch(request).await,
        }
    }

    async fn network_first(&self, request: &Request) -> Result<Response, FetchError> {
        match self.network.fetch(request).await {
            Ok(response) => {
                if response.status == 200 {
                    self.store(CacheRole::Data, request, &response);
                }
                Ok(response)
            }
            Err(e) => {
                warn!(url = %request.url, error = %e, "API request failed, trying cache");
                self.lookup(CacheRole::Data, request)
                    .map(|entry| entry.to_response())
                    .ok_or(e)
            }
        }
    }

    async fn cache_first(&self, request: &Request) -> Result<Response, FetchError> {
        let refresh = request.wants_fresh(&self.rules.cache_busting_params);
        if !refresh {
            if let Some(entry) = self.lookup_any(request) {
                return Ok(entry.to_response());
            }
        }

        match self.network.fetch(request).await {
            Ok(response) => {
                self.store(CacheRole::Assets, request, &response);
                Ok(response)
            }
            Err(e) if refresh => {
                warn!(url = %request.url, error = %e, "Forced refresh failed, trying cache");
                self.lookup_any(request).map(|entry| entry.to_response()).ok_or(e)
            }
            Err(e) => Err(e),
        }
    }

    async fn navigation(&self, request: &Request) -> Result<Response, FetchError> {
        match self.network.fetch(request).await {
            Ok(response) => {
                self.store(CacheRole::Core, request, &response);
                Ok(response)
            }
            Err(e) => {
                warn!(url = %request.url, error = %e, "Navigation failed, serving offline shell");
                if let Some(entry) = self.lookup_any(request) {
                    return Ok(entry.to_response());
                }
                let shell = match request.url.join(&self.rules.root_document) {
                    Ok(url) => Request::navigate(url),
                    Err(parse_err) => {
                        warn!(root = %self.rules.root_document, error = %parse_err, "Invalid root document path");
                        return Err(e);
                    }
                };
                self.lookup(CacheRole::Core, &shell)
                    .map(|entry| entry.to_response())
                    .ok_or(e)
            }
        }
    }

    async fn cache_then_network(&self, request: &Request) -> Result<Response, FetchError> {
        if let Some(entry) = self.lookup_any(request) {
            return Ok(entry.to_response());
        }
        self.network.fetch(request).await
    }

    fn lookup(&self, role: CacheRole, request: &Request) -> Option<CachedEntry> {
        match self.storage.handle(self.generation, role).match_request(request) {
            Ok(entry) => entry,
            Err(e) => {
                warn!(cache = %role, url = %request.url, error = %e, "Cache lookup failed");
                None
            }
        }
    }

    fn lookup_any(&self, request: &Request) -> Option<CachedEntry> {
        match self.storage.match_any(self.generation, request) {
            Ok(entry) => entry,
            Err(e) => {
                warn!(url = %request.url, error = %e, "Cache lookup failed");
                None
            }
        }
    }

    /// Write-through that never fails the request. Writes into the caches the
    /// generation was primed with and never creates one, so a fetch that
    /// outlives its generation cannot bring it back.
    fn store(&self, role: CacheRole, request: &Request, response: &Response) {
        let cache = self.storage.handle(self.generation, role);
        if let Err(e) = cache.put(request, response, self.clock.now()) {
            warn!(cache = %role, url = %request.url, error = %e, "Failed to cache response");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheBackend;
    use crate::clock::SystemClock;
    use crate::error::CacheError;
    use crate::http::{CacheMode, Destination};
    use crate::testing::FakeNetwork;
    use url::Url;

    const GEN: GenerationId = GenerationId::new(1);

    fn url(path: &str) -> Url {
        Url::parse("https://app.test").unwrap().join(path).unwrap()
    }

    /// Storage with every cache of [`GEN`] created, as after install.
    fn primed_storage() -> CacheStorage {
        let storage = CacheStorage::in_memory("app");
        for role in CacheRole::ALL {
            storage.open(GEN, role).unwrap();
        }
        storage
    }

    fn interceptor(network: &FakeNetwork, storage: &CacheStorage) -> FetchInterceptor {
        FetchInterceptor::new(
            storage.clone(),
            Arc::new(network.clone()),
            Arc::new(SystemClock),
            Arc::new(FetchRules::default()),
            GEN,
        )
    }

    #[tokio::test]
    async fn test_api_response_served_byte_for_byte_offline() {
        let network = FakeNetwork::new();
        let storage = primed_storage();
        let body = vec![0u8, 159, 146, 150, b'{', b'}'];
        network.respond(url("/api/orders"), Response::ok(body.clone()));
        let sw = interceptor(&network, &storage);

        let live = sw.handle(&Request::get(url("/api/orders"))).await.unwrap();
        assert!(!live.from_cache);

        network.set_offline(true);
        let offline = sw.handle(&Request::get(url("/api/orders"))).await.unwrap();
        assert!(offline.from_cache);
        assert_eq!(offline.body, body);
    }

    #[tokio::test]
    async fn test_api_miss_offline_propagates_error() {
        let network = FakeNetwork::new();
        network.set_offline(true);
        let sw = interceptor(&network, &CacheStorage::in_memory("app"));

        let result = sw.handle(&Request::get(url("/api/orders"))).await;
        assert!(matches!(result, Err(FetchError::Offline(_))));
    }

    #[tokio::test]
    async fn test_api_non_200_not_stored() {
        let network = FakeNetwork::new();
        let storage = primed_storage();
        network.respond(url("/api/orders"), Response::new(204, ""));
        let sw = interceptor(&network, &storage);

        sw.handle(&Request::get(url("/api/orders"))).await.unwrap();
        let data = storage.handle(GEN, CacheRole::Data);
        assert!(data.keys().unwrap_or_default().is_empty());
    }

    #[tokio::test]
    async fn test_static_asset_cache_first() {
        let network = FakeNetwork::new();
        let storage = primed_storage();
        network.respond(url("/app.js"), Response::ok("v1"));
        let sw = interceptor(&network, &storage);
        let req = Request::get(url("/app.js")).with_destination(Destination::Script);

        assert_eq!(sw.handle(&req).await.unwrap().body, b"v1");
        network.respond(url("/app.js"), Response::ok("v2"));

        let cached = sw.handle(&req).await.unwrap();
        assert!(cached.from_cache);
        assert_eq!(cached.body, b"v1");
        assert_eq!(network.calls(), 1);
    }

    #[tokio::test]
    async fn test_static_asset_forced_refresh_overwrites() {
        let network = FakeNetwork::new();
        let storage = primed_storage();
        network.respond(url("/app.css"), Response::ok("old"));
        let sw = interceptor(&network, &storage);
        let req = Request::get(url("/app.css")).with_destination(Destination::Style);
        sw.handle(&req).await.unwrap();

        network.respond(url("/app.css"), Response::ok("new"));
        let fresh = req.clone().with_cache_mode(CacheMode::NoCache);
        let response = sw.handle(&fresh).await.unwrap();
        assert!(!response.from_cache);
        assert_eq!(response.body, b"new");

        let cached = sw.handle(&req).await.unwrap();
        assert!(cached.from_cache);
        assert_eq!(cached.body, b"new");
    }

    #[tokio::test]
    async fn test_navigation_falls_back_to_shell() {
        let network = FakeNetwork::new();
        let storage = CacheStorage::in_memory("app");
        storage
            .open(GEN, CacheRole::Core)
            .unwrap()
            .put(&Request::get(url("/")), &Response::ok("<shell>"), chrono::Utc::now())
            .unwrap();
        network.set_offline(true);
        let sw = interceptor(&network, &storage);

        let response = sw.handle(&Request::navigate(url("/orders/42"))).await.unwrap();
        assert!(response.from_cache);
        assert_eq!(response.body, b"<shell>");
    }

    #[tokio::test]
    async fn test_navigation_prefers_cached_page() {
        let network = FakeNetwork::new();
        let storage = primed_storage();
        network.respond(url("/orders"), Response::ok("<orders>"));
        network.respond(url("/"), Response::ok("<shell>"));
        let sw = interceptor(&network, &storage);

        sw.handle(&Request::navigate(url("/"))).await.unwrap();
        sw.handle(&Request::navigate(url("/orders"))).await.unwrap();
        network.set_offline(true);

        let response = sw.handle(&Request::navigate(url("/orders"))).await.unwrap();
        assert_eq!(response.body, b"<orders>");
    }

    #[tokio::test]
    async fn test_other_requests_not_stored() {
        let network = FakeNetwork::new();
        let storage = CacheStorage::in_memory("app");
        network.respond(url("/manifest.json"), Response::ok("{}"));
        let sw = interceptor(&network, &storage);

        sw.handle(&Request::get(url("/manifest.json"))).await.unwrap();
        assert!(storage.match_any(GEN, &Request::get(url("/manifest.json"))).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_other_requests_served_from_cache_when_primed() {
        let network = FakeNetwork::new();
        let storage = primed_storage();
        storage
            .open(GEN, CacheRole::Core)
            .unwrap()
            .put(&Request::get(url("/manifest.json")), &Response::ok("{\"v\":1}"), chrono::Utc::now())
            .unwrap();
        network.respond(url("/manifest.json"), Response::ok("{\"v\":2}"));
        let sw = interceptor(&network, &storage);

        let response = sw.handle(&Request::get(url("/manifest.json"))).await.unwrap();
        assert!(response.from_cache);
        assert_eq!(response.body, b"{\"v\":1}");
        assert_eq!(network.calls(), 0);
    }

    #[tokio::test]
    async fn test_write_after_generation_deleted_is_dropped() {
        let network = FakeNetwork::new();
        let storage = primed_storage();
        network.respond(url("/api/orders"), Response::ok("[1]"));
        let sw = interceptor(&network, &storage);
        storage.delete_generation(GEN).unwrap();

        let live = sw.handle(&Request::get(url("/api/orders"))).await.unwrap();
        assert_eq!(live.body, b"[1]");
        assert!(storage.list_generations().unwrap().is_empty());
    }

    struct BrokenBackend;

    impl CacheBackend for BrokenBackend {
        fn cache_names(&self) -> Result<Vec<String>, CacheError> {
            Err(CacheError::Unavailable("quota exceeded".to_string()))
        }
        fn create(&self, _name: &str) -> Result<(), CacheError> {
            Err(CacheError::Unavailable("quota exceeded".to_string()))
        }
        fn get(&self, _name: &str, _key: &str) -> Result<Option<CachedEntry>, CacheError> {
            Err(CacheError::Unavailable("quota exceeded".to_string()))
        }
        fn put(&self, _name: &str, _key: &str, _entry: CachedEntry) -> Result<bool, CacheError> {
            Err(CacheError::Unavailable("quota exceeded".to_string()))
        }
        fn keys(&self, _name: &str) -> Result<Vec<String>, CacheError> {
            Ok(Vec::new())
        }
        fn delete(&self, _name: &str) -> Result<bool, CacheError> {
            Ok(false)
        }
    }

    #[tokio::test]
    async fn test_cache_failure_never_blocks_live_response() {
        let network = FakeNetwork::new();
        network.respond(url("/api/orders"), Response::ok("[1]"));
        network.respond(url("/logo.png"), Response::ok("png"));
        let storage = CacheStorage::new("app", Arc::new(BrokenBackend));
        let sw = interceptor(&network, &storage);

        let api = sw.handle(&Request::get(url("/api/orders"))).await.unwrap();
        assert_eq!(api.body, b"[1]");
        let img = Request::get(url("/logo.png")).with_destination(Destination::Image);
        assert_eq!(sw.handle(&img).await.unwrap().body, b"png");
    }
}
