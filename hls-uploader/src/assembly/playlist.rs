use std::collections::BTreeMap;

use async_trait::async_trait;
use m3u8_rs::{MasterPlaylist, MediaPlaylist, Playlist, parse_playlist_res};
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use url::Url;

use crate::clients::{ClientError, with_cancellation};
use crate::model::JobDescriptor;

/// Ordered segment locators for one job, plus an optional cover image.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedPlaylist {
    pub segments: Vec<Url>,
    pub thumbnail: Option<Url>,
}

/// Resolves a job into the ordered list of segments to download.
#[async_trait]
pub trait PlaylistResolver: Send + Sync {
    async fn resolve(
        &self,
        job: &JobDescriptor,
        token: &CancellationToken,
    ) -> Result<ResolvedPlaylist, ClientError>;
}

/// Response of the video source API.
#[derive(Debug, Deserialize)]
struct SourceResponse {
    /// Quality label (e.g. `"720"`) to playlist URL.
    playlists: BTreeMap<String, Url>,
    #[serde(default)]
    thumbnail: Option<Url>,
}

/// Looks a job up in the video source API and parses the chosen HLS playlist.
#[derive(Debug, Clone)]
pub struct HttpPlaylistResolver {
    client: reqwest::Client,
    base_url: Url,
    use_lowest_quality: bool,
}

impl HttpPlaylistResolver {
    pub fn new(client: reqwest::Client, base_url: Url, use_lowest_quality: bool) -> Self {
        Self {
            client,
            base_url,
            use_lowest_quality,
        }
    }

    fn lookup_url(&self, job: &JobDescriptor) -> Result<Url, ClientError> {
        let id = job.my_anime_list_id.to_string();
        let episode = job.episode.to_string();
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| ClientError::configuration("video source URL cannot be a base"))?
            .pop_if_empty()
            .extend(["videos", id.as_str(), episode.as_str()]);
        url.query_pairs_mut().append_pair("dub", &job.dub);
        Ok(url)
    }

    async fn fetch_body(&self, url: &Url, operation: &'static str) -> Result<Vec<u8>, ClientError> {
        let response = self.client.get(url.clone()).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(ClientError::http_status(status, url.as_str(), operation));
        }
        Ok(response.bytes().await?.to_vec())
    }

    async fn load_segments(&self, playlist_url: &Url) -> Result<Vec<Url>, ClientError> {
        let body = self.fetch_body(playlist_url, "playlist").await?;
        match parse_playlist(&body)? {
            Playlist::MediaPlaylist(media) => media_segments(&media, playlist_url),
            Playlist::MasterPlaylist(master) => {
                let variant_url = select_stream(&master, playlist_url, self.use_lowest_quality)?;
                debug!(variant = %variant_url, "Following master playlist variant");
                let body = self.fetch_body(&variant_url, "variant playlist").await?;
                match parse_playlist(&body)? {
                    Playlist::MediaPlaylist(media) => media_segments(&media, &variant_url),
                    Playlist::MasterPlaylist(_) => Err(ClientError::playlist(
                        "variant playlist is itself a master playlist",
                    )),
                }
            }
        }
    }
}

#[async_trait]
impl PlaylistResolver for HttpPlaylistResolver {
    async fn resolve(
        &self,
        job: &JobDescriptor,
        token: &CancellationToken,
    ) -> Result<ResolvedPlaylist, ClientError> {
        with_cancellation(token, async {
            let lookup = self.lookup_url(job)?;
            let body = self.fetch_body(&lookup, "video lookup").await?;
            let source: SourceResponse = serde_json::from_slice(&body)
                .map_err(|e| ClientError::invalid_response("video source", e.to_string()))?;

            let (quality, playlist_url) =
                select_variant(&source.playlists, self.use_lowest_quality)
                    .ok_or_else(|| ClientError::playlist("video source returned no playlists"))?;
            info!(quality, playlist = %playlist_url, "Selected playlist");

            let segments = self.load_segments(playlist_url).await?;
            Ok(ResolvedPlaylist {
                segments,
                thumbnail: source.thumbnail,
            })
        })
        .await
    }
}

/// Pick a quality: labels sort by length, then lexically, so `"1080"` ranks
/// above `"720"`. Highest wins unless `lowest` is set.
pub fn select_variant(
    playlists: &BTreeMap<String, Url>,
    lowest: bool,
) -> Option<(&str, &Url)> {
    let mut keys: Vec<&String> = playlists.keys().collect();
    keys.sort_by(|a, b| a.len().cmp(&b.len()).then_with(|| a.cmp(b)));
    let key: &String = if lowest { keys.first() } else { keys.last() }.copied()?;
    playlists.get(key).map(|url| (key.as_str(), url))
}

fn parse_playlist(body: &[u8]) -> Result<Playlist, ClientError> {
    parse_playlist_res(body).map_err(|e| ClientError::playlist(format!("failed to parse playlist: {e}")))
}

/// Segment URIs of a media playlist, resolved against the playlist URL.
pub fn media_segments(playlist: &MediaPlaylist, playlist_url: &Url) -> Result<Vec<Url>, ClientError> {
    playlist
        .segments
        .iter()
        .map(|segment| {
            playlist_url.join(&segment.uri).map_err(|e| {
                ClientError::playlist(format!("invalid segment URI `{}`: {e}", segment.uri))
            })
        })
        .collect()
}

/// Variant of a master playlist with the highest (or lowest) bandwidth.
fn select_stream(master: &MasterPlaylist, playlist_url: &Url, lowest: bool) -> Result<Url, ClientError> {
    let variants = master.variants.iter().filter(|v| !v.is_i_frame);
    let chosen = if lowest {
        variants.min_by_key(|v| v.bandwidth)
    } else {
        variants.max_by_key(|v| v.bandwidth)
    }
    .ok_or_else(|| ClientError::playlist("master playlist has no variants"))?;

    playlist_url
        .join(&chosen.uri)
        .map_err(|e| ClientError::playlist(format!("invalid variant URI `{}`: {e}", chosen.uri)))
}
