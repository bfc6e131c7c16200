use chrono::{DateTime, Duration, TimeZone, Utc};
use firetrack::core::geometry::geodesic_area_ha;
use firetrack::core::grid::{compute_grid, split_bbox};
use firetrack::core::orchestrator::{SubTileStatus, TileRequest};
use firetrack::io::{FireStore, GeoJsonFireStore, MemoryFireStore};
use firetrack::{
    BoundingBox, CancelToken, FireError, FireRecord, FireResult, FireTracker, GeoTransform, GridRunner, ImageSource,
    ProgressEvent, ProgressSink, RasterDecoder, RasterTile, RgbImage, RunConfig,
};
use geo::polygon;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn start() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 8, 11, 12, 0, 0).unwrap()
}

fn region() -> BoundingBox {
    BoundingBox::new(10.0, 45.0, 10.5, 45.5).unwrap()
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Tile {
    Blank,
    Fire,
    Quiet,
    Fail,
}

type Script = dyn Fn(usize, usize) -> Tile + Send + Sync;

/// Serves tiles according to (timestamp index, sub-tile index)
struct ScriptedSource {
    boxes: Vec<BoundingBox>,
    script: Box<Script>,
    requests: AtomicUsize,
}

impl ScriptedSource {
    fn new(config: &RunConfig, script: Box<Script>) -> Self {
        let grid = compute_grid(&region(), &config.grid_params()).unwrap();
        Self { boxes: split_bbox(&region(), grid), script, requests: AtomicUsize::new(0) }
    }
}

impl ImageSource for ScriptedSource {
    fn fetch(&self, request: &TileRequest) -> FireResult<Vec<u8>> {
        self.requests.fetch_add(1, Ordering::SeqCst);
        let t = ((request.time - start()).num_minutes() / 10) as usize;
        let s = self
            .boxes
            .iter()
            .position(|b| *b == request.bbox)
            .expect("request for unknown sub-tile");
        let b = request.bbox;
        let kind = match (self.script)(t, s) {
            Tile::Fail => return Err(FireError::Transport("service unavailable".to_string())),
            Tile::Blank => "blank",
            Tile::Fire => "fire",
            Tile::Quiet => "quiet",
        };
        Ok(format!("{}|{}|{}|{}|{}", kind, b.min_lon, b.min_lat, b.max_lon, b.max_lat).into_bytes())
    }
}

/// Builds a 40x40 tile over the encoded box
struct SyntheticDecoder;

impl RasterDecoder for SyntheticDecoder {
    fn decode(&self, bytes: &[u8]) -> FireResult<RasterTile> {
        let text = std::str::from_utf8(bytes).map_err(|e| FireError::Decode(e.to_string()))?;
        let parts: Vec<&str> = text.split('|').collect();
        let coords: Vec<f64> = parts[1..].iter().map(|v| v.parse().unwrap()).collect();
        let bbox = BoundingBox::new(coords[0], coords[1], coords[2], coords[3])?;

        let size = 40;
        let mut pixels = match parts[0] {
            "blank" => RgbImage::from_elem((size, size, 3), 255),
            _ => RgbImage::from_shape_fn((size, size, 3), |(i, j, c)| ((i + j + c) % 7) as u8 * 5),
        };
        if parts[0] == "fire" {
            for i in 15..25 {
                for j in 15..25 {
                    pixels[[i, j, 0]] = 255;
                    pixels[[i, j, 1]] = 128;
                    pixels[[i, j, 2]] = 0;
                }
            }
        }
        Ok(RasterTile {
            pixels,
            transform: GeoTransform::for_bbox(&bbox, size, size),
            crs: "EPSG:4326".to_string(),
        })
    }
}

#[derive(Default)]
struct RecordingProgress {
    events: Mutex<Vec<ProgressEvent>>,
    cancel_after: Option<(usize, CancelToken)>,
}

impl ProgressSink for RecordingProgress {
    fn emit(&self, event: &ProgressEvent) {
        let mut events = self.events.lock().unwrap();
        events.push(event.clone());
        if let Some((n, token)) = &self.cancel_after {
            let summaries = events
                .iter()
                .filter(|e| matches!(e, ProgressEvent::TimestampSummary { .. }))
                .count();
            if summaries >= *n {
                token.cancel();
            }
        }
    }
}

fn config() -> RunConfig {
    // 20 km sub-tiles over a ~39 km x 56 km region
    RunConfig { base_px: 40, ..Default::default() }
}

fn run_with(
    script: Box<Script>,
    minutes: i64,
    progress: &RecordingProgress,
    cancel: Option<CancelToken>,
) -> (FireResult<firetrack::RunSummary>, MemoryFireStore, usize) {
    init_logging();
    let config = config();
    let source = ScriptedSource::new(&config, script);
    let mut tracker = FireTracker::new(MemoryFireStore::default(), config.tracker.clone()).unwrap();
    let mut runner = GridRunner::new(&source, &SyntheticDecoder, config).unwrap().with_progress(progress);
    if let Some(token) = cancel {
        runner = runner.with_cancel(token);
    }
    let result = runner.run(&region(), start(), start() + Duration::minutes(minutes), &mut tracker);
    let requests = source.requests.load(Ordering::SeqCst);
    (result, tracker.into_store(), requests)
}

#[test]
fn test_two_blank_timestamps_stop_run() {
    let progress = RecordingProgress::default();
    let (result, store, _) = run_with(Box::new(|_, _| Tile::Blank), 40, &progress, None);
    let summary = result.unwrap();

    assert_eq!(summary.timestamps_total, 5);
    assert_eq!(summary.timestamps_processed, 2);
    assert!(summary.early_stop);
    assert_eq!(summary.blank_timestamps, 2);
    assert!(!store.exists());
}

#[test]
fn test_blank_counter_resets_on_data() {
    let progress = RecordingProgress::default();
    let script = |t: usize, s: usize| match t {
        1 if s == 0 => Tile::Fire,
        1 => Tile::Quiet,
        4 => Tile::Fire,
        _ => Tile::Blank,
    };
    let (result, store, _) = run_with(Box::new(script), 40, &progress, None);
    let summary = result.unwrap();

    // t0 blank, t1 data, t2 + t3 blank -> t4 never processed
    assert_eq!(summary.timestamps_processed, 4);
    assert!(summary.early_stop);
    assert_eq!(summary.detections, 1);
    assert_eq!(store.records().len(), 1);
    assert_eq!(store.records()[0].fire, 1);
    assert_eq!(store.records()[0].time, start() + Duration::minutes(10));
}

#[test]
fn test_subtile_failures_are_isolated() {
    let progress = RecordingProgress::default();
    let script = |_t: usize, s: usize| if s == 0 { Tile::Fail } else { Tile::Fire };
    let (result, store, _) = run_with(Box::new(script), 0, &progress, None);
    let summary = result.unwrap();

    let subtiles = split_bbox(&region(), compute_grid(&region(), &config().grid_params()).unwrap()).len();
    assert!(subtiles > 1);
    assert_eq!(summary.subtile_failures, 1);
    assert_eq!(summary.detections, subtiles - 1);
    // One fire per sub-tile, all disjoint
    let mut ids: Vec<_> = store.records().iter().map(|r| r.fire).collect();
    ids.dedup();
    assert_eq!(ids, (1..subtiles as u32).collect::<Vec<_>>());

    let events = progress.events.lock().unwrap();
    let failed = events
        .iter()
        .filter(|e| matches!(e, ProgressEvent::SubTileResult { status: SubTileStatus::Failed(_), .. }))
        .count();
    assert_eq!(failed, 1);
}

#[test]
fn test_failed_subtile_prevents_blank_classification() {
    let progress = RecordingProgress::default();
    let script = |_t: usize, s: usize| if s == 0 { Tile::Fail } else { Tile::Blank };
    let (result, _, _) = run_with(Box::new(script), 30, &progress, None);
    let summary = result.unwrap();
    assert_eq!(summary.timestamps_processed, 4);
    assert!(!summary.early_stop);
    assert_eq!(summary.blank_timestamps, 0);
}

#[test]
fn test_one_batch_per_timestamp() {
    let progress = RecordingProgress::default();
    let (result, store, requests) = run_with(Box::new(|_, _| Tile::Fire), 20, &progress, None);
    let summary = result.unwrap();
    let subtiles = requests / 3;

    assert_eq!(summary.timestamps_processed, 3);
    // First timestamp creates every fire, the rest re-detect them unchanged
    assert_eq!(summary.records_appended, subtiles);
    assert_eq!(store.saves(), 1);

    let events = progress.events.lock().unwrap();
    assert!(matches!(events.first(), Some(ProgressEvent::Started { timestamps: 3, .. })));
    assert!(matches!(events.last(), Some(ProgressEvent::Finished { .. })));
    let per_timestamp: Vec<usize> = events
        .iter()
        .filter_map(|e| match e {
            ProgressEvent::TimestampSummary { update: Some(u), .. } => Some(u.outcomes.len()),
            _ => None,
        })
        .collect();
    assert_eq!(per_timestamp, vec![subtiles; 3]);

    // Sub-tile results are reported in row-major order
    let indices: Vec<usize> = events
        .iter()
        .filter_map(|e| match e {
            ProgressEvent::SubTileResult { index, .. } => Some(*index),
            _ => None,
        })
        .take(subtiles)
        .collect();
    assert_eq!(indices, (1..=subtiles).collect::<Vec<_>>());
}

#[test]
fn test_cancellation_between_timestamps() {
    let token = CancelToken::new();
    let progress = RecordingProgress { cancel_after: Some((2, token.clone())), ..Default::default() };
    let (result, _, _) = run_with(Box::new(|_, _| Tile::Quiet), 60, &progress, Some(token));
    let summary = result.unwrap();
    assert!(summary.cancelled);
    assert_eq!(summary.timestamps_processed, 2);
    assert!(!summary.early_stop);
}

struct ReadOnlyStore;

impl FireStore for ReadOnlyStore {
    fn location(&self) -> String {
        "read-only".to_string()
    }

    fn exists(&self) -> bool {
        false
    }

    fn load(&self) -> FireResult<Vec<FireRecord>> {
        Ok(Vec::new())
    }

    fn save(&mut self, _records: &[FireRecord]) -> FireResult<()> {
        Err(FireError::Persistence("store is read-only".to_string()))
    }
}

#[test]
fn test_persistence_failure_aborts_run() {
    init_logging();
    let config = config();
    let source = ScriptedSource::new(&config, Box::new(|_, _| Tile::Fire));
    let progress = RecordingProgress::default();
    let mut tracker = FireTracker::new(ReadOnlyStore, config.tracker.clone()).unwrap();
    let runner = GridRunner::new(&source, &SyntheticDecoder, config).unwrap().with_progress(&progress);

    let result = runner.run(&region(), start(), start() + Duration::minutes(30), &mut tracker);
    assert!(matches!(result, Err(FireError::Persistence(_))));

    let events = progress.events.lock().unwrap();
    assert!(events.iter().any(|e| matches!(e, ProgressEvent::Error { .. })));
    assert!(!events.iter().any(|e| matches!(e, ProgressEvent::Finished { .. })));
}

#[test]
fn test_run_writes_geojson_store() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("fires.geojson");
    let config = config();
    let source = ScriptedSource::new(&config, Box::new(|t, s| if t == 0 && s == 1 { Tile::Fire } else { Tile::Quiet }));

    let summary = firetrack::run(
        &source,
        &SyntheticDecoder,
        &region(),
        start(),
        start() + Duration::minutes(10),
        GeoJsonFireStore::new(&path),
        config,
    )
    .unwrap();
    assert_eq!(summary.timestamps_processed, 2);
    assert_eq!(summary.records_appended, 1);

    let records = GeoJsonFireStore::new(&path).load().unwrap();
    assert_eq!(records.len(), 1);
    // The 10x10 px hot block covers 1/16 of its 40x40 px sub-tile, less the
    // rim lost to blurring and re-thresholding
    let b = split_bbox(&region(), compute_grid(&region(), &crate::config().grid_params()).unwrap())[1];
    let subtile = geodesic_area_ha(&polygon![
        (x: b.min_lon, y: b.min_lat),
        (x: b.max_lon, y: b.min_lat),
        (x: b.max_lon, y: b.max_lat),
        (x: b.min_lon, y: b.max_lat),
        (x: b.min_lon, y: b.min_lat),
    ]);
    let area = records[0].acc_area.unwrap();
    assert!(area > 0.025 * subtile && area < 0.0625 * subtile, "area {} of sub-tile {}", area, subtile);
    assert_eq!(records[0].time_area, records[0].acc_area);
}
