//! Core data models for the recent-tracks service
//!
//! This module contains the normalized track types served to clients and the
//! `TrackSource` seam through which the cache reaches the upstream API.

pub mod lastfm;

pub use lastfm::{normalize_track, FetchError, LastFmClient, RawTrack, UNPARSEABLE_EPOCH};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Default number of tracks requested when the client does not specify one
pub const DEFAULT_LIMIT: u32 = 10;

/// Largest `limit` accepted from clients
pub const MAX_LIMIT: u32 = 50;

/// One normalized played item
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Track {
    /// Track title
    pub title: String,
    /// Artist name
    pub artist: String,
    /// Album name, empty when the upstream has none
    pub album: String,
    /// When the track was played, in seconds since the Unix epoch
    pub epoch_time_played: i64,
    /// Best available artwork URL, empty when there is none
    pub artwork_url: String,
    /// Whether the track is playing right now rather than already scrobbled
    pub is_currently_playing: bool,
}

/// The payload held by the snapshot cache and served as JSON
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecentTracks {
    /// Tracks in upstream order (most recent first)
    pub tracks: Vec<Track>,
    /// Number of entries in `tracks`
    pub total_tracks: usize,
}

impl RecentTracks {
    pub fn new(tracks: Vec<Track>) -> Self {
        let total_tracks = tracks.len();
        Self {
            tracks,
            total_tracks,
        }
    }
}

/// Parameters forwarded to the upstream on refresh
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchParams {
    /// Maximum number of tracks to request
    pub limit: u32,
}

impl Default for FetchParams {
    fn default() -> Self {
        Self {
            limit: DEFAULT_LIMIT,
        }
    }
}

/// Anything that can produce a fresh list of recent tracks
///
/// Implemented by [`LastFmClient`]; tests substitute scripted sources.
#[async_trait]
pub trait TrackSource: Send + Sync + 'static {
    async fn fetch(&self, params: &FetchParams) -> Result<RecentTracks, FetchError>;
}
