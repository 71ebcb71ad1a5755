//! HLS playlist parsing and loading
//!
//! Implements parsing for:
//! - Multivariant playlists (`#EXT-X-STREAM-INF` + URI)
//! - Alternate audio (`#EXT-X-MEDIA:TYPE=AUDIO` with `URI`)
//! - Media playlists (`#EXTINF:<duration>,` + URI, `#EXT-X-MAP`)

use super::{is_multivariant, select_level_to_load, MasterManifest, MediaPlaylist};
use crate::{
    error::Error,
    transport::{AbortToken, HttpClient, Request},
    types::*,
    Result,
};
use m3u8_rs::{AlternativeMediaType, MasterPlaylist};
use std::time::Duration;
use tracing::{debug, info, instrument};
use url::Url;

/// Stateless playlist parser
pub struct HlsParser;

impl HlsParser {
    /// Parse a top-level document. A media playlist yields one synthetic level.
    pub fn parse_master(content: &str, base_url: &Url) -> Result<MasterManifest> {
        if !is_multivariant(content) {
            return Ok(MasterManifest {
                levels: vec![Level {
                    index: 0,
                    bandwidth: 0,
                    resolution: None,
                    codecs: None,
                    uri: base_url.clone(),
                }],
                audio: Vec::new(),
                is_multivariant: false,
                url: base_url.clone(),
            });
        }

        let parsed = m3u8_rs::parse_master_playlist_res(content.as_bytes())
            .map_err(|e| Error::ManifestParse(format!("Failed to parse HLS master: {:?}", e)))?;

        let levels = Self::extract_levels(&parsed, base_url)?;
        if levels.is_empty() {
            return Err(Error::InvalidManifest("multivariant playlist has no variants".into()));
        }

        Ok(MasterManifest {
            levels,
            audio: Self::extract_audio(&parsed, base_url)?,
            is_multivariant: true,
            url: base_url.clone(),
        })
    }

    fn extract_levels(master: &MasterPlaylist, base_url: &Url) -> Result<Vec<Level>> {
        master
            .variants
            .iter()
            .filter(|v| !v.is_i_frame)
            .enumerate()
            .map(|(index, variant)| {
                Ok(Level {
                    index,
                    bandwidth: variant.bandwidth,
                    resolution: variant
                        .resolution
                        .map(|r| Resolution::new(r.width as u32, r.height as u32)),
                    codecs: variant.codecs.clone(),
                    uri: resolve_uri(base_url, &variant.uri)?,
                })
            })
            .collect()
    }

    fn extract_audio(master: &MasterPlaylist, base_url: &Url) -> Result<Vec<AudioRendition>> {
        let mut audio = Vec::new();
        for media in &master.alternatives {
            if media.media_type != AlternativeMediaType::Audio {
                continue;
            }
            // Audio muxed into the variant has no URI
            let Some(uri) = media.uri.as_deref() else {
                continue;
            };
            audio.push(AudioRendition {
                group_id: media.group_id.clone(),
                name: media.name.clone(),
                language: media.language.clone(),
                default: media.default,
                uri: resolve_uri(base_url, uri)?,
            });
        }
        Ok(audio)
    }

    /// Parse a media playlist
    pub fn parse_media(content: &str, base_url: &Url) -> Result<MediaPlaylist> {
        let parsed = m3u8_rs::parse_media_playlist_res(content.as_bytes())
            .map_err(|e| Error::ManifestParse(format!("Failed to parse HLS media: {:?}", e)))?;

        let mut segments = Vec::with_capacity(parsed.segments.len());
        let mut init_uri: Option<Url> = None;
        let mut start = 0.0;

        for (idx, seg) in parsed.segments.iter().enumerate() {
            if let Some(map) = &seg.map {
                init_uri = Some(resolve_uri(base_url, &map.uri)?);
            }

            let duration = Duration::from_secs_f64(f64::from(seg.duration.max(0.0)));
            segments.push(Segment {
                number: parsed.media_sequence + idx as u64,
                uri: resolve_uri(base_url, &seg.uri)?,
                duration,
                start,
                init_uri: init_uri.clone(),
            });
            start += duration.as_secs_f64();
        }

        Ok(MediaPlaylist {
            segments,
            end_list: parsed.end_list,
            url: base_url.clone(),
        })
    }
}

/// Resolve relative URI against base URL
fn resolve_uri(base: &Url, relative: &str) -> Result<Url> {
    base.join(relative.trim())
        .map_err(|e| Error::InvalidManifest(format!("Invalid URI '{}': {}", relative, e)))
}

/// A level chosen for playback together with its segment list
#[derive(Debug, Clone)]
pub struct LoadedLevel {
    pub master: MasterManifest,
    pub level: Level,
    pub playlist: MediaPlaylist,
}

/// Fetches and parses playlists through the shared transport
#[derive(Clone)]
pub struct HlsLoader {
    client: HttpClient,
    timeout: Duration,
    retries: u32,
}

impl HlsLoader {
    pub fn new(client: HttpClient, timeout: Duration, retries: u32) -> Self {
        Self {
            client,
            timeout,
            retries,
        }
    }

    async fn fetch_playlist(&self, url: &Url, abort: &AbortToken) -> Result<String> {
        let request = Request::get(url.clone())
            .with_timeout(self.timeout)
            .with_retries(self.retries);
        self.client.fetch_text(&request, abort).await.map_err(|e| match e {
            Error::HttpStatus { .. } | Error::SegmentFetch { .. } => {
                Error::ManifestFetch(e.to_string())
            }
            other => other,
        })
    }

    #[instrument(skip(self, abort))]
    pub async fn load_master(&self, url: &Url, abort: &AbortToken) -> Result<MasterManifest> {
        debug!("Fetching HLS manifest: {}", url);
        let content = self.fetch_playlist(url, abort).await?;
        HlsParser::parse_master(&content, url)
    }

    #[instrument(skip(self, abort))]
    pub async fn load_media(&self, url: &Url, abort: &AbortToken) -> Result<MediaPlaylist> {
        debug!("Fetching HLS media playlist: {}", url);
        let content = self.fetch_playlist(url, abort).await?;
        HlsParser::parse_media(&content, url)
    }

    /// Fetch the top-level manifest, select a level and fetch its segment list
    pub async fn load(
        &self,
        url: &Url,
        bandwidth_estimate: Option<u64>,
        abort: &AbortToken,
    ) -> Result<LoadedLevel> {
        let content = self.fetch_playlist(url, abort).await?;
        let master = HlsParser::parse_master(&content, url)?;
        let level = select_level_to_load(&master.levels, bandwidth_estimate)
            .cloned()
            .ok_or(Error::NoSuitableRendition)?;

        let playlist = if master.is_multivariant {
            self.load_media(&level.uri, abort).await?
        } else {
            HlsParser::parse_media(&content, url)?
        };

        if playlist.segments.is_empty() {
            return Err(Error::InvalidManifest(format!("{} lists no segments", playlist.url)));
        }

        info!(
            level = level.index,
            bandwidth = level.bandwidth,
            segments = playlist.segments.len(),
            duration = playlist.total_duration(),
            "Ad level selected"
        );

        Ok(LoadedLevel {
            master,
            level,
            playlist,
        })
    }
}
