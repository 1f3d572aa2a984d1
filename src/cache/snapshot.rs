//! Single-slot TTL cache with single-flight refresh
//!
//! Provides a `SnapshotCache` that holds one `RecentTracks` value together with
//! the instant its fetch started, and refreshes it from a [`TrackSource`] when
//! it is older than the TTL.

use std::sync::Arc;
use std::time::Duration;

use futures::future::{BoxFuture, FutureExt, Shared};
use parking_lot::{Mutex, RwLock};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::data::{FetchError, FetchParams, RecentTracks, TrackSource};

/// How long a snapshot is served before the next caller refreshes it
pub const DEFAULT_TTL: Duration = Duration::from_secs(5);

type RefreshOutcome = Result<Arc<RecentTracks>, FetchError>;

/// A refresh shared by every caller that missed while it was running
type Refresh = Shared<BoxFuture<'static, RefreshOutcome>>;

/// The cached value and the instant its fetch started
///
/// Always replaced as a whole, so a reader can never pair one generation's
/// timestamp with another generation's tracks.
#[derive(Debug, Clone)]
struct Snapshot {
    tracks: Arc<RecentTracks>,
    cached_at: Instant,
}

/// Result of a cache lookup, including where the value came from
#[derive(Debug, Clone)]
pub struct CacheLookup {
    /// The tracks to serve
    pub tracks: Arc<RecentTracks>,
    /// Whether the value was a fresh snapshot rather than the result of a refresh
    pub served_from_cache: bool,
}

struct Inner<S> {
    source: S,
    ttl: Duration,
    /// `None` until the first successful refresh
    slot: RwLock<Option<Snapshot>>,
    in_flight: Mutex<Option<Refresh>>,
}

/// Read-through cache holding one snapshot of the upstream recent tracks
///
/// Cloning is cheap and every clone shares the same slot, so the cache can be
/// handed to request handlers as state.
pub struct SnapshotCache<S> {
    inner: Arc<Inner<S>>,
}

impl<S> Clone for SnapshotCache<S> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<S: TrackSource> SnapshotCache<S> {
    /// Creates an empty cache in front of `source`
    pub fn new(source: S, ttl: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                source,
                ttl,
                slot: RwLock::new(None),
                in_flight: Mutex::new(None),
            }),
        }
    }

    pub fn ttl(&self) -> Duration {
        self.inner.ttl
    }

    /// Returns the held snapshot whatever its age, without refreshing
    pub fn peek(&self) -> Option<Arc<RecentTracks>> {
        self.inner
            .slot
            .read()
            .as_ref()
            .map(|snapshot| Arc::clone(&snapshot.tracks))
    }

    /// Returns the snapshot if it is fresh, otherwise refreshes it
    ///
    /// # Arguments
    /// * `params` - Forwarded to the source if a refresh is needed
    ///
    /// # Returns
    /// * `Ok(CacheLookup)` with `served_from_cache = true` for a fresh snapshot,
    ///   or `false` when the value comes from a refresh (started here or joined)
    /// * `Err(FetchError)` if the refresh failed; the held snapshot is untouched
    ///
    /// # Behavior
    /// - The fresh path only takes a read lock and never waits on the network
    /// - At most one refresh runs at a time; callers that miss while it runs
    ///   wait for it and receive its outcome, success or error
    /// - No retry: the next call after a failure starts a new refresh
    /// - The refresh runs on its own task; dropping every caller does not cancel it
    pub async fn get_or_refresh(&self, params: &FetchParams) -> Result<CacheLookup, FetchError> {
        if let Some(tracks) = self.inner.fresh() {
            debug!("serving recent tracks from cache");
            return Ok(CacheLookup {
                tracks,
                served_from_cache: true,
            });
        }

        let refresh = {
            let mut in_flight = self.inner.in_flight.lock();

            // A refresh may have been published since the unlocked check.
            if let Some(tracks) = self.inner.fresh() {
                debug!("serving recent tracks refreshed by another request");
                return Ok(CacheLookup {
                    tracks,
                    served_from_cache: true,
                });
            }

            match in_flight.as_ref() {
                Some(refresh) => {
                    debug!("joining in-flight refresh");
                    refresh.clone()
                }
                None => {
                    debug!(limit = params.limit, "cache stale, refreshing from upstream");
                    let refresh = Inner::refresh(&self.inner, *params);
                    *in_flight = Some(refresh.clone());
                    refresh
                }
            }
        };

        let tracks = refresh.await?;
        Ok(CacheLookup {
            tracks,
            served_from_cache: false,
        })
    }
}

impl<S: TrackSource> Inner<S> {
    fn fresh(&self) -> Option<Arc<RecentTracks>> {
        self.slot
            .read()
            .as_ref()
            .filter(|snapshot| snapshot.cached_at.elapsed() < self.ttl)
            .map(|snapshot| Arc::clone(&snapshot.tracks))
    }

    /// Spawns the refresh and returns a shared handle to its outcome
    ///
    /// The fetch runs as its own task, so it completes and publishes even if
    /// every caller waiting on it is dropped. The in-flight slot is cleared
    /// when the task ends, after any publish, so the next miss starts anew.
    fn refresh(inner: &Arc<Self>, params: FetchParams) -> Refresh {
        let task_inner = Arc::clone(inner);
        let task = tokio::spawn(async move {
            let _clear = InFlightGuard(Arc::clone(&task_inner));
            let started = Instant::now();
            match task_inner.source.fetch(&params).await {
                Ok(recent) => {
                    let tracks = Arc::new(recent);
                    *task_inner.slot.write() = Some(Snapshot {
                        tracks: Arc::clone(&tracks),
                        cached_at: started,
                    });
                    debug!(
                        total_tracks = tracks.total_tracks,
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        "snapshot refreshed"
                    );
                    Ok(tracks)
                }
                Err(err) => {
                    warn!(error = %err, "refresh failed, keeping previous snapshot");
                    Err(err)
                }
            }
        });

        async move {
            task.await
                .unwrap_or_else(|err| Err(FetchError::Interrupted(err.to_string())))
        }
        .boxed()
        .shared()
    }
}

/// Clears the in-flight refresh when the refresh task finishes or unwinds
struct InFlightGuard<S>(Arc<Inner<S>>);

impl<S> Drop for InFlightGuard<S> {
    fn drop(&mut self) {
        self.0.in_flight.lock().take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::Track;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Source that replays scripted outcomes, optionally after a delay
    struct ScriptedSource {
        calls: Arc<AtomicUsize>,
        script: Mutex<VecDeque<Result<RecentTracks, FetchError>>>,
        delay: Duration,
    }

    impl ScriptedSource {
        fn new(script: Vec<Result<RecentTracks, FetchError>>) -> (Self, Arc<AtomicUsize>) {
            let calls = Arc::new(AtomicUsize::new(0));
            let source = Self {
                calls: Arc::clone(&calls),
                script: Mutex::new(script.into()),
                delay: Duration::ZERO,
            };
            (source, calls)
        }

        fn with_delay(mut self, delay: Duration) -> Self {
            self.delay = delay;
            self
        }
    }

    #[async_trait]
    impl TrackSource for ScriptedSource {
        async fn fetch(&self, _params: &FetchParams) -> Result<RecentTracks, FetchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            self.script
                .lock()
                .pop_front()
                .expect("ScriptedSource ran out of responses")
        }
    }

    fn tracks(titles: &[&str]) -> RecentTracks {
        RecentTracks::new(
            titles
                .iter()
                .map(|title| Track {
                    title: title.to_string(),
                    artist: "Artist".to_string(),
                    album: "Album".to_string(),
                    epoch_time_played: 0,
                    artwork_url: String::new(),
                    is_currently_playing: false,
                })
                .collect(),
        )
    }

    fn upstream_down() -> FetchError {
        FetchError::Status {
            status: 503,
            message: "Service Unavailable".to_string(),
        }
    }

    const TTL: Duration = Duration::from_secs(5);

    #[tokio::test(start_paused = true)]
    async fn test_first_call_fetches_then_serves_from_cache() {
        let (source, calls) = ScriptedSource::new(vec![Ok(tracks(&["a", "b"]))]);
        let cache = SnapshotCache::new(source, TTL);
        let params = FetchParams::default();

        let first = cache.get_or_refresh(&params).await.expect("First call should succeed");
        assert!(!first.served_from_cache);
        assert_eq!(first.tracks.total_tracks, 2);

        tokio::time::advance(Duration::from_secs(4)).await;

        let second = cache.get_or_refresh(&params).await.expect("Second call should succeed");
        assert!(second.served_from_cache);
        assert_eq!(second.tracks, first.tracks);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_snapshot_triggers_one_refresh() {
        let (source, calls) =
            ScriptedSource::new(vec![Ok(tracks(&["old"])), Ok(tracks(&["new"]))]);
        let cache = SnapshotCache::new(source, TTL);
        let params = FetchParams::default();

        cache.get_or_refresh(&params).await.expect("Initial fetch should succeed");
        tokio::time::advance(TTL).await;

        let refreshed = cache.get_or_refresh(&params).await.expect("Refresh should succeed");
        assert!(!refreshed.served_from_cache);
        assert_eq!(refreshed.tracks.tracks[0].title, "new");
        assert_eq!(calls.load(Ordering::SeqCst), 2);

        let cached = cache.get_or_refresh(&params).await.expect("Cached call should succeed");
        assert!(cached.served_from_cache);
        assert_eq!(cached.tracks.tracks[0].title, "new");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cached_at_is_fetch_start() {
        let (source, calls) = ScriptedSource::new(vec![Ok(tracks(&["slow"])), Ok(tracks(&["again"]))]);
        let cache = SnapshotCache::new(source.with_delay(Duration::from_secs(3)), TTL);
        let params = FetchParams::default();

        cache.get_or_refresh(&params).await.expect("Slow fetch should succeed");

        // The fetch started three seconds ago, so two more make the snapshot five seconds old.
        tokio::time::advance(Duration::from_secs(2)).await;
        let lookup = cache.get_or_refresh(&params).await.expect("Refresh should succeed");
        assert!(!lookup.served_from_cache);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_without_snapshot_returns_error() {
        let (source, calls) = ScriptedSource::new(vec![Err(upstream_down()), Ok(tracks(&["ok"]))]);
        let cache = SnapshotCache::new(source, TTL);
        let params = FetchParams::default();

        let err = cache.get_or_refresh(&params).await.unwrap_err();
        assert!(matches!(err, FetchError::Status { status: 503, .. }));
        assert!(cache.peek().is_none());

        // No retry inside the cache; the next call tries again.
        let lookup = cache.get_or_refresh(&params).await.expect("Second call should succeed");
        assert!(!lookup.served_from_cache);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failure_preserves_previous_snapshot() {
        let (source, calls) = ScriptedSource::new(vec![
            Ok(tracks(&["kept"])),
            Err(upstream_down()),
            Ok(tracks(&["next"])),
        ]);
        let cache = SnapshotCache::new(source, TTL);
        let params = FetchParams::default();

        let original = cache.get_or_refresh(&params).await.expect("Initial fetch should succeed");
        tokio::time::advance(Duration::from_secs(6)).await;

        assert!(cache.get_or_refresh(&params).await.is_err());
        let held = cache.peek().expect("Snapshot should survive a failed refresh");
        assert_eq!(held, original.tracks);

        // The failed attempt did not reset the age, so this call refreshes again.
        let lookup = cache.get_or_refresh(&params).await.expect("Retry should succeed");
        assert!(!lookup.served_from_cache);
        assert_eq!(lookup.tracks.tracks[0].title, "next");
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_misses_share_one_fetch() {
        let (source, calls) = ScriptedSource::new(vec![Ok(tracks(&["shared"]))]);
        let cache = SnapshotCache::new(source.with_delay(Duration::from_millis(200)), TTL);
        let params = FetchParams::default();

        let lookups =
            futures::future::join_all((0..10).map(|_| cache.get_or_refresh(&params))).await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let first = lookups[0].as_ref().expect("Leader should succeed");
        for lookup in &lookups {
            let lookup = lookup.as_ref().expect("Every waiter should succeed");
            assert!(!lookup.served_from_cache);
            assert!(Arc::ptr_eq(&lookup.tracks, &first.tracks));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_misses_share_one_failure() {
        let (source, calls) = ScriptedSource::new(vec![Err(upstream_down())]);
        let cache = SnapshotCache::new(source.with_delay(Duration::from_millis(200)), TTL);
        let params = FetchParams::default();

        let lookups =
            futures::future::join_all((0..5).map(|_| cache.get_or_refresh(&params))).await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(lookups.iter().all(|lookup| lookup.is_err()));
        assert!(cache.peek().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_in_flight_slot_cleared_after_publish() {
        let (source, calls) = ScriptedSource::new(vec![Ok(tracks(&["a"]))]);
        let cache = SnapshotCache::new(source, TTL);
        let params = FetchParams::default();

        cache.get_or_refresh(&params).await.expect("Initial fetch should succeed");
        assert!(cache.inner.in_flight.lock().is_none());

        for _ in 0..100 {
            let lookup = cache.get_or_refresh(&params).await.expect("Cached call should succeed");
            assert!(lookup.served_from_cache);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_leader_still_publishes() {
        let (source, calls) = ScriptedSource::new(vec![Ok(tracks(&["finished"]))]);
        let cache = SnapshotCache::new(source.with_delay(Duration::from_millis(300)), TTL);
        let params = FetchParams::default();

        let abandoned =
            tokio::time::timeout(Duration::from_millis(50), cache.get_or_refresh(&params)).await;
        assert!(abandoned.is_err(), "leader should give up before the fetch ends");

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(cache.inner.in_flight.lock().is_none());

        let lookup = cache.get_or_refresh(&params).await.expect("Later call should succeed");
        assert!(lookup.served_from_cache);
        assert_eq!(lookup.tracks.tracks[0].title, "finished");
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_failed_refresh_lets_next_call_refetch() {
        let (source, calls) = ScriptedSource::new(vec![Err(upstream_down()), Ok(tracks(&["ok"]))]);
        let cache = SnapshotCache::new(source.with_delay(Duration::from_millis(300)), TTL);
        let params = FetchParams::default();

        let abandoned =
            tokio::time::timeout(Duration::from_millis(50), cache.get_or_refresh(&params)).await;
        assert!(abandoned.is_err());

        tokio::time::sleep(Duration::from_secs(2)).await;

        let lookup = cache.get_or_refresh(&params).await.expect("Next call should refetch");
        assert!(!lookup.served_from_cache);
        assert_eq!(lookup.tracks.tracks[0].title, "ok");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    /// Source whose every response is stamped with a generation number
    struct GenerationSource {
        generation: AtomicUsize,
    }

    #[async_trait]
    impl TrackSource for GenerationSource {
        async fn fetch(&self, _params: &FetchParams) -> Result<RecentTracks, FetchError> {
            let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
            tokio::task::yield_now().await;
            let title = format!("gen-{generation}");
            let mut recent = tracks(&[title.as_str(); 4]);
            for track in &mut recent.tracks {
                track.epoch_time_played = generation as i64;
            }
            Ok(recent)
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_readers_never_see_mixed_generations() {
        let cache = SnapshotCache::new(
            GenerationSource {
                generation: AtomicUsize::new(0),
            },
            Duration::from_millis(1),
        );

        let readers: Vec<_> = (0..8)
            .map(|_| {
                let cache = cache.clone();
                tokio::spawn(async move {
                    let mut last_seen = 0;
                    for _ in 0..200 {
                        let lookup = cache
                            .get_or_refresh(&FetchParams::default())
                            .await
                            .expect("Generation source never fails");
                        let recent = &lookup.tracks;
                        assert_eq!(recent.total_tracks, recent.tracks.len());

                        let generation = recent.tracks[0].epoch_time_played;
                        let title = format!("gen-{generation}");
                        assert!(recent
                            .tracks
                            .iter()
                            .all(|t| t.epoch_time_played == generation && t.title == title));
                        assert!(generation >= last_seen, "generations must not go backwards");
                        last_seen = generation;
                    }
                })
            })
            .collect();

        for reader in readers {
            reader.await.expect("Reader task panicked");
        }
    }
}
