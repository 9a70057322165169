use image_verifier::cache::{Cache, CacheError, CachedEntry};
use image_verifier::image::Image;
use image_verifier::workload::WorkloadObject;
use tracing::{debug, warn};

use crate::settings;

/// Outcome of the skip evaluation. `cached_error` carries a previous
/// validation failure that will deny the request without an upstream
/// call.
#[derive(Debug, Default, PartialEq)]
pub struct SkipDecision {
    pub skip: bool,
    pub reason: String,
    pub digest: String,
    pub cached_error: Option<String>,
}

impl SkipDecision {
    fn skipped(reason: &str, digest: String, cached_error: Option<String>) -> Self {
        SkipDecision {
            skip: true,
            reason: reason.to_string(),
            digest,
            cached_error,
        }
    }
}

/// Decides whether validation of the image can be short-circuited:
/// unchanged reference first, then child approval, then the cache.
pub async fn evaluate(
    cache: &dyn Cache,
    kube_client: Option<&kube::Client>,
    workload: &WorkloadObject,
    image: &Image,
    previous_images: &[String],
) -> SkipDecision {
    if automatic_unchanged_approval(image, previous_images) {
        return SkipDecision::skipped("unchanged image reference", image.digest().to_string(), None);
    }

    if automatic_child_approval(kube_client, workload, image).await {
        return SkipDecision::skipped(
            "automatic approval of child image reference",
            image.digest().to_string(),
            None,
        );
    }

    match cached_digest(cache, image).await {
        Ok((digest, cached_error)) => SkipDecision::skipped("cache hit", digest, cached_error),
        Err(e) => {
            debug!(error = %e, "error getting cached digest");
            SkipDecision::default()
        }
    }
}

/// An UPDATE carrying an image reference that was already part of the
/// old object does not need re-validation.
fn automatic_unchanged_approval(image: &Image, previous_images: &[String]) -> bool {
    settings::automatic_unchanged_approval()
        && previous_images
            .iter()
            .any(|previous| previous == image.original_string())
}

/// An image already approved as part of the parent workload's admission
/// can pass. Disabled under pod-only validation, as that combination
/// would admit any pod owned by a permitted workload without checking
/// its trust data.
async fn automatic_child_approval(
    kube_client: Option<&kube::Client>,
    workload: &WorkloadObject,
    image: &Image,
) -> bool {
    if !settings::automatic_child_approval() {
        return false;
    }

    if !settings::block_all_resources() {
        warn!(
            "insecure configuration detected: automatic child approval enabled while only pod \
             admissions are rejected, pretending automatic child approval was disabled"
        );
        return false;
    }

    let Some(client) = kube_client else {
        warn!("missing kube API client, unable to get parent container images");
        return false;
    };

    workload
        .parent_images(client)
        .await
        .iter()
        .any(|parent| parent == image.original_string())
}

/// Reads the cached validation result. Backend errors are logged and
/// degrade to a miss.
async fn cached_digest(cache: &dyn Cache, image: &Image) -> Result<(String, Option<String>), String> {
    let value = cache.get(image.original_string()).await.map_err(|e| {
        if matches!(e, CacheError::Backend(_)) {
            warn!(error = %e, "error connecting to cache");
        }
        format!("cache miss for image {}: {e}", image.original_string())
    })?;

    let entry: CachedEntry = serde_json::from_str(&value)
        .map_err(|e| format!("error unmarshalling cached entry: {e}"))?;

    if !entry.error.is_empty() {
        return Ok((String::new(), Some(entry.error)));
    }
    if entry.digest.is_empty() {
        return Err("empty cached digest".to_string());
    }

    Ok((entry.digest, None))
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::collections::HashMap;
    use std::sync::Mutex;
    use std::time::Duration;

    use async_trait::async_trait;
    use serial_test::serial;

    struct MapCache {
        entries: Mutex<HashMap<String, String>>,
    }

    impl MapCache {
        fn with(key: &str, value: &str) -> Self {
            MapCache {
                entries: Mutex::new(HashMap::from([(key.to_string(), value.to_string())])),
            }
        }
    }

    #[async_trait]
    impl Cache for MapCache {
        async fn get(&self, key: &str) -> Result<String, CacheError> {
            self.entries
                .lock()
                .unwrap()
                .get(key)
                .cloned()
                .ok_or_else(|| CacheError::Miss(key.to_string()))
        }

        async fn set(&self, key: &str, value: String, _ttl: Duration) -> Result<(), CacheError> {
            self.entries.lock().unwrap().insert(key.to_string(), value);
            Ok(())
        }

        async fn ping(&self) -> Result<(), CacheError> {
            Ok(())
        }

        async fn keys(&self, _pattern: &str) -> Result<Vec<String>, CacheError> {
            Ok(Vec::new())
        }

        async fn del(&self, _keys: &[String]) -> Result<(), CacheError> {
            Ok(())
        }
    }

    fn workload() -> WorkloadObject {
        WorkloadObject {
            kind: "Pod".to_string(),
            ..Default::default()
        }
    }

    #[tokio::test]
    #[serial]
    async fn unchanged_reference_wins_over_cache() {
        std::env::set_var(settings::AUTOMATIC_UNCHANGED_APPROVAL, "true");

        let cache = MapCache::with("nginx:v1", r#"{"digest":"sha256:cafe","error":""}"#);
        let image = Image::new("nginx:v1").unwrap();
        let decision = evaluate(
            &cache,
            None,
            &workload(),
            &image,
            &["nginx:v1".to_string()],
        )
        .await;

        assert!(decision.skip);
        assert_eq!(decision.reason, "unchanged image reference");
        assert!(decision.cached_error.is_none());

        std::env::remove_var(settings::AUTOMATIC_UNCHANGED_APPROVAL);
    }

    #[tokio::test]
    #[serial]
    async fn cache_hit_returns_digest() {
        std::env::remove_var(settings::AUTOMATIC_UNCHANGED_APPROVAL);
        std::env::set_var(settings::AUTOMATIC_CHILD_APPROVAL, "false");

        let cache = MapCache::with("nginx:v1", r#"{"digest":"sha256:cafe","error":""}"#);
        let image = Image::new("nginx:v1").unwrap();
        let decision = evaluate(&cache, None, &workload(), &image, &[]).await;

        assert!(decision.skip);
        assert_eq!(decision.reason, "cache hit");
        assert_eq!(decision.digest, "sha256:cafe");

        std::env::remove_var(settings::AUTOMATIC_CHILD_APPROVAL);
    }

    #[tokio::test]
    #[serial]
    async fn cache_hit_surfaces_previous_error() {
        std::env::set_var(settings::AUTOMATIC_CHILD_APPROVAL, "false");

        let cache = MapCache::with("nginx:v1", r#"{"digest":"","error":"bad signature"}"#);
        let image = Image::new("nginx:v1").unwrap();
        let decision = evaluate(&cache, None, &workload(), &image, &[]).await;

        assert!(decision.skip);
        assert_eq!(decision.reason, "cache hit");
        assert!(decision.digest.is_empty());
        assert_eq!(decision.cached_error.as_deref(), Some("bad signature"));

        std::env::remove_var(settings::AUTOMATIC_CHILD_APPROVAL);
    }

    #[tokio::test]
    #[serial]
    async fn cache_miss_does_not_skip() {
        std::env::set_var(settings::AUTOMATIC_CHILD_APPROVAL, "false");

        let cache = MapCache::with("other:v1", r#"{"digest":"sha256:cafe","error":""}"#);
        let image = Image::new("nginx:v1").unwrap();
        let decision = evaluate(&cache, None, &workload(), &image, &[]).await;
        assert!(!decision.skip);

        std::env::remove_var(settings::AUTOMATIC_CHILD_APPROVAL);
    }

    #[tokio::test]
    #[serial]
    async fn malformed_cache_entry_is_a_miss() {
        std::env::set_var(settings::AUTOMATIC_CHILD_APPROVAL, "false");

        let cache = MapCache::with("nginx:v1", "not json");
        let image = Image::new("nginx:v1").unwrap();
        let decision = evaluate(&cache, None, &workload(), &image, &[]).await;
        assert!(!decision.skip);

        std::env::remove_var(settings::AUTOMATIC_CHILD_APPROVAL);
    }

    #[tokio::test]
    #[serial]
    async fn child_approval_disabled_under_pod_only_mode() {
        std::env::set_var(settings::AUTOMATIC_CHILD_APPROVAL, "true");
        std::env::set_var(settings::RESOURCE_VALIDATION_MODE, "podsOnly");

        let image = Image::new("nginx:v1").unwrap();
        assert!(!automatic_child_approval(None, &workload(), &image).await);

        std::env::remove_var(settings::AUTOMATIC_CHILD_APPROVAL);
        std::env::remove_var(settings::RESOURCE_VALIDATION_MODE);
    }
}
