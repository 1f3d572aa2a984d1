//! Last.fm recent tracks API client
//!
//! This module fetches a user's recent tracks from the Last.fm XML API and
//! normalizes each `<track>` element into our [`Track`] structure.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use thiserror::Error;

use super::{FetchParams, RecentTracks, Track, TrackSource};

/// Base URL for the Last.fm 2.0 API
pub const LASTFM_BASE_URL: &str = "https://ws.audioscrobbler.com/2.0/";

/// Default bound on a single upstream request
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Value used for `epoch_time_played` when the upstream timestamp is missing
/// or not an integer. The record is kept rather than failing the whole fetch.
pub const UNPARSEABLE_EPOCH: i64 = 0;

/// Image size labels in order of preference. Last.fm spells the largest
/// variant `extralarge`.
const ARTWORK_PRIORITY: [&str; 4] = ["extralarge", "large", "medium", "small"];

const RECENT_TRACKS_METHOD: &str = "user.getrecenttracks";

/// Errors that can occur when fetching recent tracks
///
/// Cloneable so one failed refresh can be handed to every caller waiting on
/// it; non-cloneable sources are shared behind an `Arc`.
#[derive(Debug, Clone, Error)]
pub enum FetchError {
    /// The request could not complete (connect, DNS, timeout, body read)
    #[error("HTTP request failed: {0}")]
    Transport(#[source] Arc<reqwest::Error>),

    /// Last.fm answered with a non-success status
    #[error("Last.fm returned status {status}: {message}")]
    Status { status: u16, message: String },

    /// The response body is not the expected XML document
    #[error("Failed to parse XML response: {0}")]
    Decode(#[source] Arc<quick_xml::de::DeError>),

    /// Last.fm answered 200 but flagged the request as failed
    #[error("Last.fm error {code}: {message}")]
    Api { code: u32, message: String },

    /// The refresh task ended without a result (panic or runtime shutdown)
    #[error("Refresh task did not complete: {0}")]
    Interrupted(String),
}

impl From<reqwest::Error> for FetchError {
    fn from(err: reqwest::Error) -> Self {
        FetchError::Transport(Arc::new(err))
    }
}

impl From<quick_xml::de::DeError> for FetchError {
    fn from(err: quick_xml::de::DeError) -> Self {
        FetchError::Decode(Arc::new(err))
    }
}

/// Root `<lfm>` element
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct LfmResponse {
    #[serde(rename = "@status")]
    status: String,
    recenttracks: RawRecentTracks,
    error: Option<LfmError>,
}

/// `<error code="…">message</error>` carried by failed responses
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct LfmError {
    #[serde(rename = "@code")]
    code: u32,
    #[serde(rename = "$text")]
    message: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawRecentTracks {
    #[serde(rename = "track")]
    tracks: Vec<RawTrack>,
}

/// A single `<track>` element as Last.fm sends it
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RawTrack {
    /// `nowplaying="true"` on the track being listened to right now
    #[serde(rename = "@nowplaying")]
    pub now_playing: Option<String>,
    pub name: String,
    pub artist: TextElement,
    pub album: TextElement,
    pub date: Option<RawDate>,
    #[serde(rename = "image")]
    pub images: Vec<RawImage>,
}

/// An element whose text content is all we keep (`<artist mbid="…">Name</artist>`)
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TextElement {
    #[serde(rename = "$text")]
    pub text: String,
}

/// `<date uts="1213031819">9 Jun 2008, 17:16</date>`
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RawDate {
    #[serde(rename = "@uts")]
    pub uts: String,
    #[serde(rename = "$text")]
    pub text: String,
}

/// `<image size="large">https://…</image>`
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RawImage {
    #[serde(rename = "@size")]
    pub size: String,
    #[serde(rename = "$text")]
    pub url: String,
}

/// Client for fetching recent tracks from the Last.fm API
#[derive(Debug, Clone)]
pub struct LastFmClient {
    client: Client,
    api_key: String,
    user: String,
    /// Base URL for the API (allows override for testing)
    base_url: String,
}

impl LastFmClient {
    /// Create a new LastFmClient whose requests are bounded by `timeout`
    pub fn new(
        api_key: impl Into<String>,
        user: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, FetchError> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self::with_client(client, api_key, user))
    }

    /// Create a new LastFmClient with a custom HTTP client
    pub fn with_client(client: Client, api_key: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            client,
            api_key: api_key.into(),
            user: user.into(),
            base_url: LASTFM_BASE_URL.to_string(),
        }
    }

    /// Point the client at another endpoint (a proxy or a local test server)
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    /// Fetch and normalize the user's recent tracks
    ///
    /// # Returns
    /// * `Ok(RecentTracks)` - Tracks in the order Last.fm returned them
    /// * `Err(FetchError)` - If the request, the status, or the XML is bad
    pub async fn fetch_recent_tracks(
        &self,
        params: &FetchParams,
    ) -> Result<RecentTracks, FetchError> {
        let limit = params.limit.to_string();
        let response = self
            .client
            .get(&self.base_url)
            .query(&[
                ("method", RECENT_TRACKS_METHOD),
                ("user", self.user.as_str()),
                ("api_key", self.api_key.as_str()),
                ("limit", limit.as_str()),
            ])
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;

        if !status.is_success() {
            return Err(status_error(status, &body));
        }

        parse_response(&body)
    }
}

#[async_trait]
impl TrackSource for LastFmClient {
    async fn fetch(&self, params: &FetchParams) -> Result<RecentTracks, FetchError> {
        self.fetch_recent_tracks(params).await
    }
}

/// Build a status error, preferring the `<error>` text Last.fm puts in failed bodies
fn status_error(status: StatusCode, body: &str) -> FetchError {
    let message = quick_xml::de::from_str::<LfmResponse>(body)
        .ok()
        .and_then(|lfm| lfm.error)
        .map(|err| err.message.trim().to_string())
        .filter(|message| !message.is_empty())
        .unwrap_or_else(|| status.canonical_reason().unwrap_or("unknown").to_string());

    FetchError::Status {
        status: status.as_u16(),
        message,
    }
}

/// Parse a successful Last.fm XML body into normalized tracks
fn parse_response(body: &str) -> Result<RecentTracks, FetchError> {
    let lfm: LfmResponse = quick_xml::de::from_str(body)?;

    if lfm.status == "failed" {
        let error = lfm.error.unwrap_or_default();
        return Err(FetchError::Api {
            code: error.code,
            message: error.message.trim().to_string(),
        });
    }

    let tracks = lfm.recenttracks.tracks.iter().map(normalize_track).collect();
    Ok(RecentTracks::new(tracks))
}

/// Map one raw `<track>` element to a [`Track`]
///
/// Pure: no I/O, never fails. A bad timestamp becomes [`UNPARSEABLE_EPOCH`].
pub fn normalize_track(raw: &RawTrack) -> Track {
    let epoch_time_played = raw
        .date
        .as_ref()
        .and_then(|date| date.uts.parse::<i64>().ok())
        .unwrap_or(UNPARSEABLE_EPOCH);

    Track {
        title: raw.name.clone(),
        artist: raw.artist.text.clone(),
        album: raw.album.text.clone(),
        epoch_time_played,
        artwork_url: select_artwork(&raw.images),
        is_currently_playing: raw.now_playing.as_deref() == Some("true"),
    }
}

/// Pick artwork following [`ARTWORK_PRIORITY`]
///
/// Only the first image carrying a label counts for that size; if its URL is
/// empty the next size is tried.
fn select_artwork(images: &[RawImage]) -> String {
    ARTWORK_PRIORITY
        .iter()
        .filter_map(|size| images.iter().find(|image| image.size == *size))
        .find(|image| !image.url.is_empty())
        .map(|image| image.url.clone())
        .unwrap_or_default()
}
