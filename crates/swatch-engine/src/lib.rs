use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use image::imageops::FilterType;
use image::{imageops, Rgb, RgbImage};
use kmeans_colors::get_kmeans;
use palette::Srgb;
use reqwest::blocking::{Client as HttpClient, Response as HttpResponse};
use reqwest::header::AUTHORIZATION;
use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};
use swatch_contracts::events::{now_utc_iso, EventLog};
use swatch_contracts::palette::{hex_from_rgb, parse_hex};
use swatch_contracts::quota::{allocate, QuotaPlan};
use swatch_contracts::runs::report::{write_report, PaletteRecord, RunReport};
use swatch_contracts::runs::summary::{write_summary, RunSummary};
use swatch_contracts::settings::{non_empty_env, Credentials, RunSettings};
use swatch_contracts::sources::SourceId;
use thiserror::Error;

pub const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(20);
pub const DEFAULT_WORKERS: usize = 4;

const PALETTE_SAMPLE_DIM: u32 = 200;
const KMEANS_MAX_ITER: usize = 20;
const KMEANS_CONVERGE: f32 = 1e-4;
const KMEANS_SEED: u64 = 42;

const DRYRUN_SCHEME: &str = "dryrun://";
const DRYRUN_DIM: u32 = 64;

/// Stages a run moves through. `Failed` is terminal and reachable only from
/// input validation; source and per-image failures never leave the normal
/// path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunPhase {
    Idle,
    AllocatingQuota,
    FetchingUrls,
    DownloadingImages,
    ExtractingPalettes,
    Done,
    Failed,
}

impl RunPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunPhase::Idle => "idle",
            RunPhase::AllocatingQuota => "allocating_quota",
            RunPhase::FetchingUrls => "fetching_urls",
            RunPhase::DownloadingImages => "downloading_images",
            RunPhase::ExtractingPalettes => "extracting_palettes",
            RunPhase::Done => "done",
            RunPhase::Failed => "failed",
        }
    }
}

/// One search hit waiting to be downloaded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageRecord {
    pub url: String,
    pub source: SourceId,
}

/// An image that was dropped from the run after its per-URL fetch or decode
/// failed.
#[derive(Debug, Clone)]
pub struct SkippedImage {
    pub position: usize,
    pub source: SourceId,
    pub url: String,
    pub kind: String,
}

#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub run_id: String,
    pub phase: RunPhase,
    pub palettes: Vec<PaletteRecord>,
    pub skipped: Vec<SkippedImage>,
    pub warnings: Vec<String>,
    pub report_path: PathBuf,
    pub summary_path: PathBuf,
}

/// A text-search adapter for one stock-photo service.
///
/// `search` returns at most `count` direct image URLs for `query`. Any
/// failure (missing key, transport, bad status, unparseable payload) is an
/// ordinary error; the orchestrator absorbs it as "zero URLs from this
/// source" and keeps going.
pub trait SearchProvider: Send + Sync {
    fn id(&self) -> SourceId;
    fn search(&self, query: &str, count: usize) -> Result<Vec<String>>;
}

#[derive(Default)]
pub struct SourceRegistry {
    adapters: BTreeMap<SourceId, Box<dyn SearchProvider>>,
}

impl SourceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<P: SearchProvider + 'static>(&mut self, adapter: P) {
        self.adapters.insert(adapter.id(), Box::new(adapter));
    }

    pub fn get(&self, source: SourceId) -> Option<&dyn SearchProvider> {
        self.adapters.get(&source).map(|adapter| adapter.as_ref())
    }

    pub fn sources(&self) -> Vec<SourceId> {
        self.adapters.keys().copied().collect()
    }
}

/// Registry with one live adapter per source, keys injected from
/// `credentials`.
pub fn default_source_registry(credentials: &Credentials, timeout: Duration) -> SourceRegistry {
    let key = |source: SourceId| credentials.key_for(source).map(str::to_string);
    let mut registry = SourceRegistry::new();
    registry.register(UnsplashProvider::new(key(SourceId::Unsplash), timeout));
    registry.register(PexelsProvider::new(key(SourceId::Pexels), timeout));
    registry.register(PixabayProvider::new(key(SourceId::Pixabay), timeout));
    registry
}

/// Offline registry answering every source with deterministic synthetic
/// URLs; the fetcher resolves them without touching the network.
pub fn dryrun_source_registry() -> SourceRegistry {
    let mut registry = SourceRegistry::new();
    for source in SourceId::ALL {
        registry.register(DryrunSource::new(source));
    }
    registry
}

pub struct DryrunSource {
    id: SourceId,
}

impl DryrunSource {
    pub fn new(id: SourceId) -> Self {
        Self { id }
    }
}

impl SearchProvider for DryrunSource {
    fn id(&self) -> SourceId {
        self.id
    }

    fn search(&self, query: &str, count: usize) -> Result<Vec<String>> {
        Ok((0..count)
            .map(|idx| dryrun_url(self.id, query, idx))
            .collect())
    }
}

/// Offline stand-in URL carrying its own solid color, e.g.
/// `dryrun://unsplash/3fa1c2/0`.
pub fn dryrun_url(source: SourceId, query: &str, idx: usize) -> String {
    let rgb = color_from_query(source.name(), query, idx as u64);
    format!("{DRYRUN_SCHEME}{}/{}/{idx}", source.name(), hex::encode(rgb))
}

fn color_from_query(source: &str, query: &str, idx: u64) -> [u8; 3] {
    let mut hasher = Sha256::new();
    hasher.update(source.as_bytes());
    hasher.update(query.as_bytes());
    hasher.update(idx.to_be_bytes());
    let digest = hasher.finalize();
    [digest[0], digest[1], digest[2]]
}

pub struct UnsplashProvider {
    api_base: String,
    access_key: Option<String>,
    http: HttpClient,
    timeout: Duration,
}

impl UnsplashProvider {
    pub fn new(access_key: Option<String>, timeout: Duration) -> Self {
        Self {
            api_base: api_base_override("UNSPLASH_API_BASE", "https://api.unsplash.com"),
            access_key,
            http: HttpClient::new(),
            timeout,
        }
    }

    fn extract_urls(payload: &Value) -> Vec<String> {
        payload
            .get("results")
            .and_then(Value::as_array)
            .map(|rows| {
                rows.iter()
                    .filter_map(|row| row.get("urls"))
                    .filter_map(|urls| urls.get("regular"))
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }
}

impl SearchProvider for UnsplashProvider {
    fn id(&self) -> SourceId {
        SourceId::Unsplash
    }

    fn search(&self, query: &str, count: usize) -> Result<Vec<String>> {
        let Some(access_key) = self.access_key.as_deref() else {
            bail!("unsplash access key not configured (set UNSPLASH_ACCESS_KEY)");
        };
        let per_page = count.to_string();
        let response = self
            .http
            .get(format!("{}/search/photos", self.api_base))
            .query(&[("query", query), ("per_page", per_page.as_str())])
            .header(AUTHORIZATION, format!("Client-ID {access_key}"))
            .timeout(self.timeout)
            .send()
            .with_context(|| format!("unsplash search request failed ({query})"))?;
        let payload = response_json_or_error("unsplash", response)?;
        let mut urls = Self::extract_urls(&payload);
        urls.truncate(count);
        Ok(urls)
    }
}

pub struct PexelsProvider {
    api_base: String,
    api_key: Option<String>,
    http: HttpClient,
    timeout: Duration,
}

impl PexelsProvider {
    pub fn new(api_key: Option<String>, timeout: Duration) -> Self {
        Self {
            api_base: api_base_override("PEXELS_API_BASE", "https://api.pexels.com"),
            api_key,
            http: HttpClient::new(),
            timeout,
        }
    }

    fn extract_urls(payload: &Value) -> Vec<String> {
        payload
            .get("photos")
            .and_then(Value::as_array)
            .map(|rows| {
                rows.iter()
                    .filter_map(|row| row.get("src"))
                    .filter_map(|src| src.get("medium"))
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }
}

impl SearchProvider for PexelsProvider {
    fn id(&self) -> SourceId {
        SourceId::Pexels
    }

    fn search(&self, query: &str, count: usize) -> Result<Vec<String>> {
        let Some(api_key) = self.api_key.as_deref() else {
            bail!("pexels API key not configured (set PEXELS_API_KEY)");
        };
        let per_page = count.to_string();
        let response = self
            .http
            .get(format!("{}/v1/search", self.api_base))
            .query(&[("query", query), ("per_page", per_page.as_str())])
            .header(AUTHORIZATION, api_key)
            .timeout(self.timeout)
            .send()
            .with_context(|| format!("pexels search request failed ({query})"))?;
        let payload = response_json_or_error("pexels", response)?;
        let mut urls = Self::extract_urls(&payload);
        urls.truncate(count);
        Ok(urls)
    }
}

pub struct PixabayProvider {
    api_base: String,
    api_key: Option<String>,
    http: HttpClient,
    timeout: Duration,
}

impl PixabayProvider {
    pub fn new(api_key: Option<String>, timeout: Duration) -> Self {
        Self {
            api_base: api_base_override("PIXABAY_API_BASE", "https://pixabay.com"),
            api_key,
            http: HttpClient::new(),
            timeout,
        }
    }

    /// Pixabay rejects `per_page` below 3, so small shares are padded on
    /// the wire and the surplus dropped after parsing.
    fn padded_count(count: usize) -> usize {
        count.max(SourceId::Pixabay.min_request_size())
    }

    fn extract_urls(payload: &Value) -> Vec<String> {
        payload
            .get("hits")
            .and_then(Value::as_array)
            .map(|rows| {
                rows.iter()
                    .filter_map(|row| row.get("largeImageURL"))
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }
}

impl SearchProvider for PixabayProvider {
    fn id(&self) -> SourceId {
        SourceId::Pixabay
    }

    fn search(&self, query: &str, count: usize) -> Result<Vec<String>> {
        let Some(api_key) = self.api_key.as_deref() else {
            bail!("pixabay API key not configured (set PIXABAY_API_KEY)");
        };
        let per_page = Self::padded_count(count).to_string();
        let response = self
            .http
            .get(format!("{}/api/", self.api_base))
            .query(&[
                ("key", api_key),
                ("q", query),
                ("image_type", "photo"),
                ("per_page", per_page.as_str()),
            ])
            .timeout(self.timeout)
            .send()
            .with_context(|| format!("pixabay search request failed ({query})"))?;
        let payload = response_json_or_error("pixabay", response)?;
        let mut urls = Self::extract_urls(&payload);
        urls.truncate(count);
        Ok(urls)
    }
}

/// Why a single image dropped out of a run. `Fetch` covers transport and
/// HTTP-status failures, `Decode` anything that was not a readable image.
#[derive(Debug, Error)]
pub enum ImageLoadError {
    #[error("image fetch failed ({url}): {reason}")]
    Fetch { url: String, reason: String },
    #[error("image decode failed ({url}): {reason}")]
    Decode { url: String, reason: String },
}

impl ImageLoadError {
    pub fn kind(&self) -> &'static str {
        match self {
            ImageLoadError::Fetch { .. } => "fetch",
            ImageLoadError::Decode { .. } => "decode",
        }
    }

    pub fn url(&self) -> &str {
        match self {
            ImageLoadError::Fetch { url, .. } | ImageLoadError::Decode { url, .. } => url,
        }
    }
}

pub struct ImageFetcher {
    http: HttpClient,
    timeout: Duration,
}

impl ImageFetcher {
    pub fn new(timeout: Duration) -> Self {
        Self {
            http: HttpClient::new(),
            timeout,
        }
    }

    /// Resolves one URL to a decoded RGB raster. Both failure kinds are
    /// fatal for this URL only.
    pub fn load(&self, url: &str) -> Result<RgbImage, ImageLoadError> {
        if let Some(rest) = url.strip_prefix(DRYRUN_SCHEME) {
            return synthesize_dryrun_image(url, rest);
        }

        let response = self
            .http
            .get(url)
            .timeout(self.timeout)
            .send()
            .map_err(|err| ImageLoadError::Fetch {
                url: url.to_string(),
                reason: err.to_string(),
            })?;
        let status = response.status();
        if !status.is_success() {
            return Err(ImageLoadError::Fetch {
                url: url.to_string(),
                reason: format!("status {}", status.as_u16()),
            });
        }
        let bytes = response.bytes().map_err(|err| ImageLoadError::Fetch {
            url: url.to_string(),
            reason: err.to_string(),
        })?;
        decode_image(url, &bytes)
    }
}

fn decode_image(url: &str, bytes: &[u8]) -> Result<RgbImage, ImageLoadError> {
    let decoded = image::load_from_memory(bytes).map_err(|err| ImageLoadError::Decode {
        url: url.to_string(),
        reason: err.to_string(),
    })?;
    Ok(decoded.to_rgb8())
}

fn synthesize_dryrun_image(url: &str, rest: &str) -> Result<RgbImage, ImageLoadError> {
    let color = rest
        .split('/')
        .nth(1)
        .and_then(parse_hex)
        .ok_or_else(|| ImageLoadError::Decode {
            url: url.to_string(),
            reason: "malformed dryrun url".to_string(),
        })?;
    let mut canvas = RgbImage::new(DRYRUN_DIM, DRYRUN_DIM);
    for pixel in canvas.pixels_mut() {
        *pixel = Rgb(color);
    }
    Ok(canvas)
}

/// Reduces `image` to exactly `k` representative colors.
///
/// The raster is resampled to a fixed 200x200 grid so clustering cost and
/// output do not depend on source resolution, then clustered in RGB space
/// with a fixed seed. The returned hex strings follow the clustering pass's
/// own centroid order, which is stable for identical input and seed; a
/// low-variance image yields duplicate entries rather than fewer than `k`.
pub fn extract_palette(image: &RgbImage, k: usize) -> Vec<String> {
    let resampled;
    let grid = if image.dimensions() == (PALETTE_SAMPLE_DIM, PALETTE_SAMPLE_DIM) {
        image
    } else {
        resampled = imageops::resize(
            image,
            PALETTE_SAMPLE_DIM,
            PALETTE_SAMPLE_DIM,
            FilterType::Triangle,
        );
        &resampled
    };

    let pixels: Vec<Srgb<f32>> = grid
        .pixels()
        .map(|pixel| {
            Srgb::new(
                pixel[0] as f32 / 255.0,
                pixel[1] as f32 / 255.0,
                pixel[2] as f32 / 255.0,
            )
        })
        .collect();

    let clustered = get_kmeans(
        k,
        KMEANS_MAX_ITER,
        KMEANS_CONVERGE,
        false,
        &pixels,
        KMEANS_SEED,
    );

    // A cluster that ends up with no members keeps a meaningless centroid,
    // which happens on low-variance rasters (a solid color fills one
    // cluster and starves the rest). Empty slots take the dominant
    // cluster's color so the palette still has k entries and a solid
    // input yields the same color k times.
    let mut member_counts = vec![0usize; k];
    for &index in &clustered.indices {
        if let Some(count) = member_counts.get_mut(index as usize) {
            *count += 1;
        }
    }
    let dominant = member_counts
        .iter()
        .enumerate()
        .max_by_key(|(_, count)| **count)
        .map(|(index, _)| index)
        .unwrap_or(0);

    member_counts
        .iter()
        .enumerate()
        .map(|(index, count)| {
            let centroid = if *count == 0 {
                clustered.centroids[dominant]
            } else {
                clustered.centroids[index]
            };
            let rgb = centroid.into_format::<u8>();
            hex_from_rgb([rgb.red, rgb.green, rgb.blue])
        })
        .collect()
}

pub struct PaletteEngine {
    run_dir: PathBuf,
    run_id: String,
    events: EventLog,
    sources: SourceRegistry,
    fetcher: ImageFetcher,
    workers: usize,
    started_at: String,
    phase: RunPhase,
}

impl PaletteEngine {
    pub fn new(
        run_dir: impl Into<PathBuf>,
        events_path: impl Into<PathBuf>,
        sources: SourceRegistry,
        timeout: Duration,
        workers: usize,
    ) -> Result<Self> {
        let run_dir: PathBuf = run_dir.into();
        let events_path: PathBuf = events_path.into();
        fs::create_dir_all(&run_dir)?;
        let run_id = run_dir
            .file_name()
            .and_then(|value| value.to_str())
            .filter(|value| !value.is_empty())
            .unwrap_or("swatch-run")
            .to_string();
        let events = EventLog::create(events_path, run_id.clone())?;
        let started_at = now_utc_iso();

        events.record(
            "run_started",
            map_object(json!({
                "out_dir": run_dir.to_string_lossy().to_string(),
            })),
        )?;

        Ok(Self {
            run_dir,
            run_id,
            events,
            sources,
            fetcher: ImageFetcher::new(timeout),
            workers: workers.max(1),
            started_at,
            phase: RunPhase::Idle,
        })
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }

    pub fn phase(&self) -> RunPhase {
        self.phase
    }

    /// Executes one submission end to end.
    ///
    /// Returns an error only for blocking input validation; every failure
    /// past that point is absorbed into the outcome's warnings and skip
    /// list.
    pub fn run(&mut self, settings: &RunSettings) -> Result<RunOutcome> {
        self.phase = RunPhase::Idle;
        if let Err(invalid) = settings.validate() {
            self.enter_phase(RunPhase::Failed)?;
            self.events.record(
                "run_failed",
                map_object(json!({ "error": invalid.to_string() })),
            )?;
            return Err(invalid.into());
        }

        if settings.is_upload() {
            self.run_upload(settings)
        } else {
            self.run_search(settings)
        }
    }

    fn run_search(&mut self, settings: &RunSettings) -> Result<RunOutcome> {
        let requested = settings.requested_count();
        let mut warnings: Vec<String> = Vec::new();

        self.enter_phase(RunPhase::AllocatingQuota)?;
        let plan = allocate(requested, &settings.sources)?;
        self.events.record(
            "quota_planned",
            map_object(json!({
                "requested": requested,
                "plan": plan
                    .iter()
                    .map(|(source, share)| json!({ "source": source.name(), "share": share }))
                    .collect::<Vec<_>>(),
            })),
        )?;

        self.enter_phase(RunPhase::FetchingUrls)?;
        let mut records = self.fetch_urls(&settings.prompt, &plan, &mut warnings)?;
        records.truncate(requested);
        if records.is_empty() {
            push_unique_warning(
                &mut warnings,
                format!("no images found for '{}'", settings.prompt.trim()),
            );
        }

        self.enter_phase(RunPhase::DownloadingImages)?;
        let loaded = collect_indexed(&records, self.workers, |_, record: &ImageRecord| {
            self.fetcher.load(&record.url)
        });

        let mut skipped: Vec<SkippedImage> = Vec::new();
        let mut to_extract: Vec<(usize, ImageRecord, RgbImage)> = Vec::new();
        for (index, (record, outcome)) in records.iter().zip(loaded.into_iter()).enumerate() {
            match outcome {
                Some(Ok(image)) => to_extract.push((index, record.clone(), image)),
                Some(Err(err)) => {
                    self.events.record(
                        "image_skipped",
                        map_object(json!({
                            "index": index,
                            "url": record.url,
                            "kind": err.kind(),
                            "error": err.to_string(),
                        })),
                    )?;
                    push_unique_warning(&mut warnings, err.to_string());
                    skipped.push(SkippedImage {
                        position: index,
                        source: record.source,
                        url: record.url.clone(),
                        kind: err.kind().to_string(),
                    });
                }
                None => {
                    self.events.record(
                        "image_skipped",
                        map_object(json!({
                            "index": index,
                            "url": record.url,
                            "kind": "fetch",
                            "error": "image was not processed",
                        })),
                    )?;
                    skipped.push(SkippedImage {
                        position: index,
                        source: record.source,
                        url: record.url.clone(),
                        kind: "fetch".to_string(),
                    });
                }
            }
        }

        self.enter_phase(RunPhase::ExtractingPalettes)?;
        let num_colors = settings.num_colors;
        let extracted = collect_indexed(
            &to_extract,
            self.workers,
            |_, (position, record, image): &(usize, ImageRecord, RgbImage)| {
                (*position, record.clone(), extract_palette(image, num_colors))
            },
        );

        let mut palettes: Vec<PaletteRecord> = Vec::new();
        for entry in extracted.into_iter().flatten() {
            let (position, record, colors) = entry;
            self.events.record(
                "palette_extracted",
                map_object(json!({
                    "index": position,
                    "source": record.source.name(),
                    "url": record.url,
                    "colors": colors,
                })),
            )?;
            palettes.push(PaletteRecord {
                position,
                source: record.source.name().to_string(),
                url: Some(record.url),
                colors,
            });
        }

        self.finish_run(settings, requested, records.len(), palettes, skipped, warnings)
    }

    fn run_upload(&mut self, settings: &RunSettings) -> Result<RunOutcome> {
        let Some(path) = settings.upload.as_ref() else {
            bail!("upload settings missing a file path");
        };
        let mut warnings: Vec<String> = Vec::new();

        self.enter_phase(RunPhase::DownloadingImages)?;
        let image = match load_upload(path) {
            Ok(image) => Some(image),
            Err(err) => {
                let reason = error_chain_text(&err, 512);
                self.events.record(
                    "upload_decode_failed",
                    map_object(json!({
                        "path": path.to_string_lossy().to_string(),
                        "error": reason,
                    })),
                )?;
                push_unique_warning(
                    &mut warnings,
                    format!("could not decode uploaded image: {reason}"),
                );
                None
            }
        };

        self.enter_phase(RunPhase::ExtractingPalettes)?;
        let mut palettes: Vec<PaletteRecord> = Vec::new();
        if let Some(image) = image {
            let colors = extract_palette(&image, settings.num_colors);
            self.events.record(
                "palette_extracted",
                map_object(json!({
                    "index": 0,
                    "source": "upload",
                    "url": Value::Null,
                    "colors": colors,
                })),
            )?;
            palettes.push(PaletteRecord {
                position: 0,
                source: "upload".to_string(),
                url: None,
                colors,
            });
        }

        self.finish_run(settings, 1, 0, palettes, Vec::new(), warnings)
    }

    fn fetch_urls(
        &self,
        prompt: &str,
        plan: &QuotaPlan,
        warnings: &mut Vec<String>,
    ) -> Result<Vec<ImageRecord>> {
        let shares: Vec<(SourceId, usize)> = plan.iter().filter(|(_, share)| *share > 0).collect();
        let results = collect_indexed(
            &shares,
            shares.len().max(1),
            |_, (source, share): &(SourceId, usize)| match self.sources.get(*source) {
                Some(adapter) => adapter
                    .search(prompt, *share)
                    .map_err(|err| error_chain_text(&err, 512)),
                None => Err(format!("no adapter registered for {}", source.name())),
            },
        );

        let mut records: Vec<ImageRecord> = Vec::new();
        for ((source, share), outcome) in shares.iter().zip(results.into_iter()) {
            match outcome {
                Some(Ok(urls)) => {
                    self.events.record(
                        "source_fetch_completed",
                        map_object(json!({
                            "source": source.name(),
                            "share": share,
                            "returned": urls.len(),
                        })),
                    )?;
                    records.extend(urls.into_iter().map(|url| ImageRecord {
                        url,
                        source: *source,
                    }));
                }
                Some(Err(error)) => {
                    self.events.record(
                        "source_fetch_failed",
                        map_object(json!({
                            "source": source.name(),
                            "error": error,
                        })),
                    )?;
                    push_unique_warning(
                        warnings,
                        format!("{} returned no images: {error}", source.name()),
                    );
                }
                None => {
                    self.events.record(
                        "source_fetch_failed",
                        map_object(json!({
                            "source": source.name(),
                            "error": "source fetch did not complete",
                        })),
                    )?;
                    push_unique_warning(
                        warnings,
                        format!("{} returned no images", source.name()),
                    );
                }
            }
        }
        Ok(records)
    }

    fn finish_run(
        &mut self,
        settings: &RunSettings,
        requested: usize,
        urls_fetched: usize,
        palettes: Vec<PaletteRecord>,
        skipped: Vec<SkippedImage>,
        warnings: Vec<String>,
    ) -> Result<RunOutcome> {
        let report = RunReport {
            run_id: self.run_id.clone(),
            prompt: settings.prompt.trim().to_string(),
            palettes: palettes.clone(),
        };
        let report_path = self.run_dir.join("palettes.json");
        write_report(&report_path, &report)?;

        let summary = RunSummary {
            run_id: self.run_id.clone(),
            started_at: self.started_at.clone(),
            finished_at: now_utc_iso(),
            prompt: settings.prompt.trim().to_string(),
            requested_images: requested as u64,
            urls_fetched: urls_fetched as u64,
            palettes_extracted: palettes.len() as u64,
            images_skipped: skipped.len() as u64,
            warnings: warnings.clone(),
        };
        let summary_path = self.run_dir.join("summary.json");
        write_summary(&summary_path, &summary, None)?;

        self.enter_phase(RunPhase::Done)?;
        self.events.record(
            "run_finished",
            map_object(json!({
                "summary_path": summary_path.to_string_lossy().to_string(),
                "report_path": report_path.to_string_lossy().to_string(),
                "palettes": palettes.len(),
                "skipped": skipped.len(),
            })),
        )?;

        Ok(RunOutcome {
            run_id: self.run_id.clone(),
            phase: RunPhase::Done,
            palettes,
            skipped,
            warnings,
            report_path,
            summary_path,
        })
    }

    fn enter_phase(&mut self, phase: RunPhase) -> Result<()> {
        self.phase = phase;
        self.events.record(
            "phase_changed",
            map_object(json!({ "phase": phase.as_str() })),
        )?;
        Ok(())
    }
}

fn load_upload(path: &Path) -> Result<RgbImage> {
    let bytes = fs::read(path).with_context(|| format!("failed reading {}", path.display()))?;
    let decoded = image::load_from_memory(&bytes)
        .with_context(|| format!("failed decoding {}", path.display()))?;
    Ok(decoded.to_rgb8())
}

/// Runs `job` over `jobs` on up to `workers` threads, returning results
/// slotted by job index so the output order matches sequential execution
/// regardless of completion order.
fn collect_indexed<T, R, F>(jobs: &[T], workers: usize, job: F) -> Vec<Option<R>>
where
    T: Sync,
    R: Send,
    F: Fn(usize, &T) -> R + Sync,
{
    let mut results: Vec<Option<R>> = Vec::with_capacity(jobs.len());
    results.resize_with(jobs.len(), || None);
    if jobs.is_empty() {
        return results;
    }

    let worker_count = workers.max(1).min(jobs.len());
    let cursor = AtomicUsize::new(0);
    let (sender, receiver) = mpsc::channel::<(usize, R)>();
    thread::scope(|scope| {
        for _ in 0..worker_count {
            let sender = sender.clone();
            let cursor = &cursor;
            let job = &job;
            scope.spawn(move || loop {
                let index = cursor.fetch_add(1, Ordering::SeqCst);
                if index >= jobs.len() {
                    break;
                }
                let result = job(index, &jobs[index]);
                if sender.send((index, result)).is_err() {
                    break;
                }
            });
        }
        drop(sender);
        for (index, result) in receiver {
            if let Some(slot) = results.get_mut(index) {
                *slot = Some(result);
            }
        }
    });
    results
}

fn api_base_override(env_name: &str, default: &str) -> String {
    non_empty_env(env_name)
        .map(|value| value.trim_end_matches('/').to_string())
        .unwrap_or_else(|| default.to_string())
}

fn response_json_or_error(source: &str, response: HttpResponse) -> Result<Value> {
    let status = response.status();
    let body = response
        .text()
        .with_context(|| format!("{source} response body read failed"))?;
    if !status.is_success() {
        bail!(
            "{source} request failed ({}): {}",
            status.as_u16(),
            truncate_text(&body, 512)
        );
    }
    serde_json::from_str(&body).with_context(|| format!("{source} returned invalid JSON payload"))
}

fn error_chain_text(err: &anyhow::Error, max_chars: usize) -> String {
    let mut parts: Vec<String> = Vec::new();
    for cause in err.chain() {
        let text = cause.to_string();
        let trimmed = text.trim();
        if trimmed.is_empty() || parts.last().map(String::as_str) == Some(trimmed) {
            continue;
        }
        parts.push(trimmed.to_string());
    }
    if parts.is_empty() {
        return truncate_text(&err.to_string(), max_chars);
    }
    truncate_text(&parts.join(" | caused by: "), max_chars)
}

fn truncate_text(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        return value.to_string();
    }
    value.chars().take(max_chars).collect::<String>() + "…"
}

fn push_unique_warning(warnings: &mut Vec<String>, message: String) {
    if message.trim().is_empty() {
        return;
    }
    if warnings.iter().any(|existing| existing == &message) {
        return;
    }
    warnings.push(message);
}

fn map_object(value: Value) -> Map<String, Value> {
    value.as_object().cloned().unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use anyhow::anyhow;
    use swatch_contracts::error::InvalidInput;

    use super::*;

    struct StaticSource {
        id: SourceId,
        urls: Vec<String>,
    }

    impl SearchProvider for StaticSource {
        fn id(&self) -> SourceId {
            self.id
        }

        fn search(&self, _query: &str, _count: usize) -> Result<Vec<String>> {
            Ok(self.urls.clone())
        }
    }

    struct FailingSource {
        id: SourceId,
    }

    impl SearchProvider for FailingSource {
        fn id(&self) -> SourceId {
            self.id
        }

        fn search(&self, _query: &str, _count: usize) -> Result<Vec<String>> {
            bail!("service unavailable (503)")
        }
    }

    struct CountingSource {
        id: SourceId,
        calls: Arc<AtomicUsize>,
    }

    impl SearchProvider for CountingSource {
        fn id(&self) -> SourceId {
            self.id
        }

        fn search(&self, query: &str, count: usize) -> Result<Vec<String>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok((0..count)
                .map(|idx| dryrun_url(self.id, query, idx))
                .collect())
        }
    }

    fn test_engine(temp: &tempfile::TempDir, sources: SourceRegistry) -> Result<PaletteEngine> {
        PaletteEngine::new(
            temp.path().join("run"),
            temp.path().join("run").join("events.jsonl"),
            sources,
            Duration::from_secs(5),
            4,
        )
    }

    fn solid_image(width: u32, height: u32, color: [u8; 3]) -> RgbImage {
        let mut canvas = RgbImage::new(width, height);
        for pixel in canvas.pixels_mut() {
            *pixel = Rgb(color);
        }
        canvas
    }

    fn gradient_image(width: u32, height: u32) -> RgbImage {
        let mut canvas = RgbImage::new(width, height);
        for (x, y, pixel) in canvas.enumerate_pixels_mut() {
            *pixel = Rgb([
                ((x * 7 + y * 3) % 256) as u8,
                ((x * 13 + 40) % 256) as u8,
                ((y * 11 + 90) % 256) as u8,
            ]);
        }
        canvas
    }

    fn read_events(path: &Path) -> Result<Vec<Value>> {
        let content = fs::read_to_string(path)?;
        content
            .lines()
            .map(|line| Ok(serde_json::from_str(line)?))
            .collect()
    }

    fn event_names(events: &[Value]) -> Vec<String> {
        events
            .iter()
            .filter_map(|event| event.get("event").and_then(Value::as_str))
            .map(str::to_string)
            .collect()
    }

    #[test]
    fn unsplash_rows_yield_regular_urls() {
        let payload = json!({
            "total": 2,
            "results": [
                {"urls": {"raw": "https://images.example/a-raw", "regular": "https://images.example/a"}},
                {"urls": {"regular": "https://images.example/b"}},
            ],
        });
        assert_eq!(
            UnsplashProvider::extract_urls(&payload),
            vec!["https://images.example/a", "https://images.example/b"]
        );
    }

    #[test]
    fn pexels_rows_yield_medium_urls() {
        let payload = json!({
            "photos": [
                {"src": {"original": "https://images.example/a-full", "medium": "https://images.example/a"}},
                {"src": {"medium": "https://images.example/b"}},
            ],
        });
        assert_eq!(
            PexelsProvider::extract_urls(&payload),
            vec!["https://images.example/a", "https://images.example/b"]
        );
    }

    #[test]
    fn pixabay_rows_yield_large_image_urls() {
        let payload = json!({
            "totalHits": 2,
            "hits": [
                {"largeImageURL": "https://images.example/a", "previewURL": "https://images.example/a-small"},
                {"largeImageURL": "https://images.example/b"},
            ],
        });
        assert_eq!(
            PixabayProvider::extract_urls(&payload),
            vec!["https://images.example/a", "https://images.example/b"]
        );
    }

    #[test]
    fn malformed_search_payloads_yield_no_urls() {
        let wrong_shape = json!({"results": "not an array"});
        assert!(UnsplashProvider::extract_urls(&wrong_shape).is_empty());

        let missing_fields = json!({
            "results": [
                {"urls": {"small": "https://images.example/a-small"}},
                {"id": "row-without-urls"},
                {"urls": {"regular": 17}},
            ],
        });
        assert!(UnsplashProvider::extract_urls(&missing_fields).is_empty());

        assert!(PexelsProvider::extract_urls(&json!({})).is_empty());
        assert!(PixabayProvider::extract_urls(&json!({"hits": [{"id": 4}]})).is_empty());
    }

    #[test]
    fn pixabay_pads_requests_below_the_service_floor() {
        assert_eq!(PixabayProvider::padded_count(1), 3);
        assert_eq!(PixabayProvider::padded_count(2), 3);
        assert_eq!(PixabayProvider::padded_count(3), 3);
        assert_eq!(PixabayProvider::padded_count(5), 5);
    }

    #[test]
    fn providers_without_keys_fail_their_search() {
        let provider = UnsplashProvider::new(None, Duration::from_secs(1));
        let err = provider.search("sunset", 2).unwrap_err();
        assert!(err.to_string().contains("not configured"), "{err}");

        let provider = PixabayProvider::new(None, Duration::from_secs(1));
        assert!(provider.search("sunset", 2).is_err());
    }

    /// Serves one canned JSON response on a loopback port and hands back
    /// the raw request head for assertions.
    fn serve_one_json_response(
        body: String,
    ) -> Result<(String, thread::JoinHandle<Result<String>>)> {
        use std::io::{Read, Write};

        let listener = std::net::TcpListener::bind("127.0.0.1:0")?;
        let addr = listener.local_addr()?;
        let handle = thread::spawn(move || -> Result<String> {
            let (mut stream, _) = listener.accept()?;
            let mut request = Vec::new();
            let mut buf = [0u8; 512];
            loop {
                let read = stream.read(&mut buf)?;
                if read == 0 {
                    break;
                }
                request.extend_from_slice(&buf[..read]);
                if request.windows(4).any(|window| window == b"\r\n\r\n") {
                    break;
                }
            }
            let response = format!(
                "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                body.len(),
                body
            );
            stream.write_all(response.as_bytes())?;
            Ok(String::from_utf8_lossy(&request).to_string())
        });
        Ok((format!("http://{addr}"), handle))
    }

    #[test]
    fn unsplash_sends_client_id_auth_to_the_search_endpoint() -> Result<()> {
        let body = json!({
            "results": [
                {"urls": {"regular": "https://images.example/a"}},
                {"urls": {"regular": "https://images.example/b"}},
            ],
        })
        .to_string();
        let (base, server) = serve_one_json_response(body)?;

        std::env::set_var("UNSPLASH_API_BASE", &base);
        let provider = UnsplashProvider::new(Some("test-key".to_string()), Duration::from_secs(5));
        std::env::remove_var("UNSPLASH_API_BASE");

        let urls = provider.search("sunset", 2)?;
        assert_eq!(urls.len(), 2);

        let request = server.join().unwrap()?.to_ascii_lowercase();
        assert!(request.contains("get /search/photos?"), "{request}");
        assert!(request.contains("query=sunset"));
        assert!(request.contains("per_page=2"));
        assert!(request.contains("authorization: client-id test-key"));
        Ok(())
    }

    #[test]
    fn pexels_sends_the_raw_key_header() -> Result<()> {
        let body = json!({
            "photos": [{"src": {"medium": "https://images.example/a"}}],
        })
        .to_string();
        let (base, server) = serve_one_json_response(body)?;

        std::env::set_var("PEXELS_API_BASE", &base);
        let provider = PexelsProvider::new(Some("raw-pexels-key".to_string()), Duration::from_secs(5));
        std::env::remove_var("PEXELS_API_BASE");

        let urls = provider.search("city", 1)?;
        assert_eq!(urls, vec!["https://images.example/a"]);

        let request = server.join().unwrap()?.to_ascii_lowercase();
        assert!(request.contains("get /v1/search?"), "{request}");
        assert!(request.contains("authorization: raw-pexels-key"));
        assert!(!request.contains("client-id"));
        Ok(())
    }

    #[test]
    fn pixabay_requests_the_floor_but_returns_only_the_quota() -> Result<()> {
        let body = json!({
            "hits": [
                {"largeImageURL": "https://images.example/a"},
                {"largeImageURL": "https://images.example/b"},
                {"largeImageURL": "https://images.example/c"},
            ],
        })
        .to_string();
        let (base, server) = serve_one_json_response(body)?;

        std::env::set_var("PIXABAY_API_BASE", &base);
        let provider = PixabayProvider::new(Some("test-key".to_string()), Duration::from_secs(5));
        std::env::remove_var("PIXABAY_API_BASE");

        let urls = provider.search("moss", 1)?;
        assert_eq!(urls, vec!["https://images.example/a"]);

        let request = server.join().unwrap()?;
        assert!(request.contains("GET /api/?"), "{request}");
        assert!(request.contains("key=test-key"));
        assert!(request.contains("q=moss"));
        assert!(request.contains("image_type=photo"));
        assert!(request.contains("per_page=3"));
        Ok(())
    }

    #[test]
    fn registry_dispatches_by_source_id() {
        let registry = dryrun_source_registry();
        assert_eq!(registry.sources(), SourceId::ALL.to_vec());
        let adapter = registry.get(SourceId::Pexels).unwrap();
        assert_eq!(adapter.id(), SourceId::Pexels);

        assert!(SourceRegistry::new().sources().is_empty());
    }

    #[test]
    fn dryrun_urls_are_stable_and_resolvable_offline() {
        let url = dryrun_url(SourceId::Unsplash, "sunset", 0);
        assert_eq!(url, dryrun_url(SourceId::Unsplash, "sunset", 0));
        assert_ne!(url, dryrun_url(SourceId::Unsplash, "sunset", 1));
        assert_ne!(url, dryrun_url(SourceId::Pexels, "sunset", 0));
        assert!(url.starts_with("dryrun://unsplash/"));

        let fetcher = ImageFetcher::new(Duration::from_secs(1));
        let image = fetcher.load(&url).unwrap();
        assert_eq!(image.dimensions(), (DRYRUN_DIM, DRYRUN_DIM));
        assert_eq!(
            image.get_pixel(0, 0).0,
            color_from_query("unsplash", "sunset", 0)
        );
    }

    #[test]
    fn fetcher_failures_carry_their_kind() {
        let fetcher = ImageFetcher::new(Duration::from_millis(500));

        let err = fetcher.load("dryrun://unsplash/zzzzzz/0").unwrap_err();
        assert_eq!(err.kind(), "decode");
        assert_eq!(err.url(), "dryrun://unsplash/zzzzzz/0");

        let err = fetcher.load("http://127.0.0.1:9/image.jpg").unwrap_err();
        assert_eq!(err.kind(), "fetch");
    }

    #[test]
    fn solid_image_repeats_one_color_k_times() {
        let image = solid_image(10, 10, [255, 0, 0]);
        let colors = extract_palette(&image, 3);
        assert_eq!(colors, vec!["#ff0000", "#ff0000", "#ff0000"]);
    }

    #[test]
    fn palette_always_has_exactly_k_well_formed_colors() {
        let image = gradient_image(60, 40);
        for k in 3..=8 {
            let colors = extract_palette(&image, k);
            assert_eq!(colors.len(), k);
            for color in &colors {
                let rgb = parse_hex(color).unwrap_or_else(|| panic!("bad color {color}"));
                assert_eq!(&hex_from_rgb(rgb), color, "not canonical lowercase");
            }
        }
    }

    #[test]
    fn extraction_is_deterministic_for_identical_input() {
        let image = gradient_image(64, 64);
        assert_eq!(extract_palette(&image, 5), extract_palette(&image, 5));
    }

    #[test]
    fn collect_indexed_keeps_job_order_under_parallelism() {
        let jobs: Vec<usize> = (0..12).collect();
        let results = collect_indexed(&jobs, 4, |index, value| {
            thread::sleep(Duration::from_millis(((12 - index) % 4) as u64));
            index * 100 + *value
        });
        assert_eq!(results.len(), 12);
        for (index, slot) in results.iter().enumerate() {
            assert_eq!(*slot, Some(index * 100 + index));
        }

        let empty: Vec<usize> = Vec::new();
        assert!(collect_indexed(&empty, 4, |_, value| *value).is_empty());

        let tiny = vec![7usize];
        assert_eq!(collect_indexed(&tiny, 0, |_, value| *value), vec![Some(7)]);
    }

    #[test]
    fn blank_prompt_fails_validation_and_marks_the_run_failed() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let mut engine = test_engine(&temp, dryrun_source_registry())?;
        let settings = RunSettings::search("   ", vec![SourceId::Unsplash]);

        let err = engine.run(&settings).unwrap_err();
        assert_eq!(
            err.downcast_ref::<InvalidInput>(),
            Some(&InvalidInput::EmptyPrompt)
        );
        assert_eq!(engine.phase(), RunPhase::Failed);

        let events = read_events(engine.events.path())?;
        assert!(event_names(&events).contains(&"run_failed".to_string()));
        Ok(())
    }

    #[test]
    fn end_to_end_dryrun_produces_requested_palettes() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let mut engine = test_engine(&temp, dryrun_source_registry())?;
        let mut settings = RunSettings::search("sunset", vec![SourceId::Unsplash]);
        settings.num_palettes = 2;
        settings.num_colors = 5;

        let outcome = engine.run(&settings)?;
        assert_eq!(outcome.phase, RunPhase::Done);
        assert_eq!(outcome.palettes.len(), 2);
        for (index, palette) in outcome.palettes.iter().enumerate() {
            assert_eq!(palette.position, index);
            assert_eq!(palette.source, "unsplash");
            assert_eq!(palette.colors.len(), 5);
            let expected = hex_from_rgb(color_from_query("unsplash", "sunset", index as u64));
            assert_eq!(palette.colors, vec![expected; 5]);
        }
        assert!(outcome.skipped.is_empty());
        assert!(outcome.report_path.exists());
        assert!(outcome.summary_path.exists());

        let summary: Value = serde_json::from_str(&fs::read_to_string(&outcome.summary_path)?)?;
        assert_eq!(summary["requested_images"], json!(2));
        assert_eq!(summary["urls_fetched"], json!(2));
        assert_eq!(summary["palettes_extracted"], json!(2));
        assert_eq!(summary["images_skipped"], json!(0));

        let events = read_events(engine.events.path())?;
        let names = event_names(&events);
        let position = |name: &str| {
            names
                .iter()
                .position(|event| event == name)
                .unwrap_or_else(|| panic!("missing event {name}"))
        };
        assert!(position("run_started") < position("quota_planned"));
        assert!(position("quota_planned") < position("run_finished"));
        assert_eq!(
            names.iter().filter(|name| *name == "palette_extracted").count(),
            2
        );
        Ok(())
    }

    #[test]
    fn failed_source_is_absorbed_not_fatal() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let mut registry = SourceRegistry::new();
        registry.register(FailingSource {
            id: SourceId::Unsplash,
        });
        registry.register(DryrunSource::new(SourceId::Pexels));
        let mut engine = test_engine(&temp, registry)?;

        let mut settings =
            RunSettings::search("city", vec![SourceId::Unsplash, SourceId::Pexels]);
        settings.num_palettes = 2;
        settings.num_colors = 3;

        let outcome = engine.run(&settings)?;
        assert_eq!(outcome.phase, RunPhase::Done);
        assert_eq!(outcome.palettes.len(), 1);
        assert_eq!(outcome.palettes[0].source, "pexels");
        assert!(outcome
            .warnings
            .iter()
            .any(|warning| warning.contains("unsplash returned no images")));

        let events = read_events(engine.events.path())?;
        assert!(event_names(&events).contains(&"source_fetch_failed".to_string()));
        Ok(())
    }

    #[test]
    fn over_returning_source_is_cut_back_to_the_requested_count() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let mut registry = SourceRegistry::new();
        registry.register(StaticSource {
            id: SourceId::Pixabay,
            urls: (0..3)
                .map(|idx| dryrun_url(SourceId::Pixabay, "moss", idx))
                .collect(),
        });
        let mut engine = test_engine(&temp, registry)?;

        let mut settings = RunSettings::search("moss", vec![SourceId::Pixabay]);
        settings.num_palettes = 1;
        settings.num_colors = 3;

        let outcome = engine.run(&settings)?;
        assert_eq!(outcome.palettes.len(), 1);
        assert_eq!(outcome.palettes[0].position, 0);
        assert!(outcome.skipped.is_empty());
        Ok(())
    }

    #[test]
    fn palettes_keep_merged_list_order_under_parallel_workers() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let mut engine = test_engine(&temp, dryrun_source_registry())?;
        let mut settings = RunSettings::search("ocean", vec![SourceId::Unsplash]);
        settings.num_palettes = 6;
        settings.num_colors = 3;

        let outcome = engine.run(&settings)?;
        assert_eq!(outcome.palettes.len(), 6);
        for (index, palette) in outcome.palettes.iter().enumerate() {
            assert_eq!(palette.position, index);
            let expected = hex_from_rgb(color_from_query("unsplash", "ocean", index as u64));
            assert_eq!(palette.colors[0], expected);
        }
        Ok(())
    }

    #[test]
    fn zero_share_sources_are_never_queried() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let counters: Vec<Arc<AtomicUsize>> =
            (0..3).map(|_| Arc::new(AtomicUsize::new(0))).collect();
        let mut registry = SourceRegistry::new();
        for (source, calls) in SourceId::ALL.into_iter().zip(counters.iter()) {
            registry.register(CountingSource {
                id: source,
                calls: Arc::clone(calls),
            });
        }
        let engine = test_engine(&temp, registry)?;

        let plan = allocate(2, &SourceId::ALL)?;
        assert_eq!(plan.share(SourceId::Pixabay), 0);

        let mut warnings = Vec::new();
        let records = engine.fetch_urls("fog", &plan, &mut warnings)?;
        assert_eq!(records.len(), 2);
        assert_eq!(counters[0].load(Ordering::SeqCst), 1);
        assert_eq!(counters[1].load(Ordering::SeqCst), 1);
        assert_eq!(counters[2].load(Ordering::SeqCst), 0);
        Ok(())
    }

    #[test]
    fn one_bad_image_does_not_sink_the_others() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let mut registry = SourceRegistry::new();
        registry.register(StaticSource {
            id: SourceId::Unsplash,
            urls: vec![
                dryrun_url(SourceId::Unsplash, "dune", 0),
                "dryrun://unsplash/zzzzzz/1".to_string(),
            ],
        });
        let mut engine = test_engine(&temp, registry)?;

        let mut settings = RunSettings::search("dune", vec![SourceId::Unsplash]);
        settings.num_palettes = 2;
        settings.num_colors = 3;

        let outcome = engine.run(&settings)?;
        assert_eq!(outcome.phase, RunPhase::Done);
        assert_eq!(outcome.palettes.len(), 1);
        assert_eq!(outcome.palettes[0].position, 0);
        assert_eq!(outcome.skipped.len(), 1);
        assert_eq!(outcome.skipped[0].position, 1);
        assert_eq!(outcome.skipped[0].kind, "decode");

        let events = read_events(engine.events.path())?;
        let skip = events
            .iter()
            .find(|event| event["event"] == json!("image_skipped"))
            .unwrap();
        assert_eq!(skip["index"], json!(1));
        assert_eq!(skip["kind"], json!("decode"));
        Ok(())
    }

    #[test]
    fn empty_results_warn_but_still_finish() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let mut registry = SourceRegistry::new();
        registry.register(FailingSource {
            id: SourceId::Unsplash,
        });
        let mut engine = test_engine(&temp, registry)?;

        let mut settings = RunSettings::search("mist", vec![SourceId::Unsplash]);
        settings.num_palettes = 1;
        settings.num_colors = 3;

        let outcome = engine.run(&settings)?;
        assert_eq!(outcome.phase, RunPhase::Done);
        assert!(outcome.palettes.is_empty());
        assert!(outcome
            .warnings
            .iter()
            .any(|warning| warning.contains("no images found for 'mist'")));
        Ok(())
    }

    #[test]
    fn upload_mode_extracts_one_palette() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let upload_path = temp.path().join("photo.png");
        solid_image(32, 32, [255, 0, 0]).save(&upload_path)?;

        let mut engine = test_engine(&temp, SourceRegistry::new())?;
        let mut settings = RunSettings::upload(&upload_path);
        settings.num_colors = 3;
        assert_eq!(settings.requested_count(), 1);

        let outcome = engine.run(&settings)?;
        assert_eq!(outcome.phase, RunPhase::Done);
        assert_eq!(outcome.palettes.len(), 1);
        assert_eq!(outcome.palettes[0].position, 0);
        assert_eq!(outcome.palettes[0].source, "upload");
        assert_eq!(outcome.palettes[0].url, None);
        assert_eq!(outcome.palettes[0].colors, vec!["#ff0000"; 3]);
        Ok(())
    }

    #[test]
    fn unreadable_upload_is_recovered_with_a_warning() -> Result<()> {
        let temp = tempfile::tempdir()?;
        let upload_path = temp.path().join("broken.png");
        fs::write(&upload_path, b"definitely not an image")?;

        let mut engine = test_engine(&temp, SourceRegistry::new())?;
        let settings = RunSettings::upload(&upload_path);

        let outcome = engine.run(&settings)?;
        assert_eq!(outcome.phase, RunPhase::Done);
        assert!(outcome.palettes.is_empty());
        assert!(outcome
            .warnings
            .iter()
            .any(|warning| warning.contains("could not decode uploaded image")));

        let events = read_events(engine.events.path())?;
        assert!(event_names(&events).contains(&"upload_decode_failed".to_string()));
        Ok(())
    }

    #[test]
    fn error_chain_text_joins_and_dedupes_causes() {
        let err = anyhow!("root cause").context("middle").context("outer");
        assert_eq!(
            error_chain_text(&err, 512),
            "outer | caused by: middle | caused by: root cause"
        );

        let repeated = anyhow!("same text").context("same text");
        assert_eq!(error_chain_text(&repeated, 512), "same text");

        let long = anyhow!("abcdefghij");
        assert_eq!(error_chain_text(&long, 4), "abcd…");
    }

    #[test]
    fn truncate_text_counts_characters_not_bytes() {
        assert_eq!(truncate_text("short", 10), "short");
        assert_eq!(truncate_text("exactly", 7), "exactly");
        assert_eq!(truncate_text("überlong", 4), "über…");
    }

    #[test]
    fn push_unique_warning_drops_blanks_and_duplicates() {
        let mut warnings = Vec::new();
        push_unique_warning(&mut warnings, "first".to_string());
        push_unique_warning(&mut warnings, "first".to_string());
        push_unique_warning(&mut warnings, "   ".to_string());
        push_unique_warning(&mut warnings, "second".to_string());
        assert_eq!(warnings, vec!["first".to_string(), "second".to_string()]);
    }

    #[test]
    fn api_base_override_trims_trailing_slashes() {
        std::env::set_var("SWATCH_ENGINE_TEST_BASE", "https://mock.example/v2/");
        assert_eq!(
            api_base_override("SWATCH_ENGINE_TEST_BASE", "https://real.example"),
            "https://mock.example/v2"
        );
        assert_eq!(
            api_base_override("SWATCH_ENGINE_TEST_BASE_UNSET", "https://real.example"),
            "https://real.example"
        );
    }
}
