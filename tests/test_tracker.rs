use chrono::{DateTime, Duration, TimeZone, Utc};
use firetrack::core::geometry::{geodesic_area_ha, round_to};
use firetrack::io::{FireStore, GeoJsonFireStore};
use firetrack::{Detection, FireTracker, TrackerConfig};
use geo::{polygon, Polygon};

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn t1() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 8, 11, 12, 0, 0).unwrap()
}

const LAT0: f64 = 45.0;
const HEIGHT: f64 = 0.001;

fn strip(x0: f64, width: f64) -> Polygon<f64> {
    polygon![
        (x: x0, y: LAT0),
        (x: x0 + width, y: LAT0),
        (x: x0 + width, y: LAT0 + HEIGHT),
        (x: x0, y: LAT0 + HEIGHT),
        (x: x0, y: LAT0),
    ]
}

/// Width of a strip starting at `x0` whose geodesic area is `target_ha`
fn width_for_area(x0: f64, target_ha: f64) -> f64 {
    let (mut lo, mut hi) = (0.0, 0.1);
    for _ in 0..80 {
        let mid = (lo + hi) / 2.0;
        if geodesic_area_ha(&strip(x0, mid)) < target_ha {
            lo = mid;
        } else {
            hi = mid;
        }
    }
    (lo + hi) / 2.0
}

fn detection(polygon: Polygon<f64>, time: DateTime<Utc>) -> Detection {
    let area_ha = geodesic_area_ha(&polygon);
    Detection { polygon, area_ha, time }
}

#[test]
fn test_two_timestamp_growth_scenario() {
    init_logging();
    let dir = tempfile::tempdir().expect("Failed to create temp dir");
    let path = dir.path().join("fires.geojson");
    let mut tracker = FireTracker::new(GeoJsonFireStore::new(&path), TrackerConfig::default()).unwrap();

    let first = strip(10.0, width_for_area(10.0, 2.0));
    let summary = tracker.update(&[detection(first, t1())]).expect("First update failed");
    assert_eq!(summary.created, 1);
    assert!(path.exists());

    // Overlapping polygon whose union with the first covers 3.5 ha
    let union_width = width_for_area(10.0, 3.5);
    let second = strip(10.0005, union_width - 0.0005);
    let own_area = round_to(geodesic_area_ha(&second), 2);
    let t2 = t1() + Duration::minutes(10);
    let summary = tracker.update(&[detection(second, t2)]).expect("Second update failed");
    assert_eq!(summary.merged, 1);

    let records = GeoJsonFireStore::new(&path).load().expect("Failed to reload store");
    assert_eq!(records.len(), 2);

    assert_eq!(records[0].fire, 1);
    assert_eq!(records[0].time, t1());
    assert_eq!(records[0].time_area, Some(2.0));
    assert_eq!(records[0].acc_area, Some(2.0));

    assert_eq!(records[1].fire, 1);
    assert_eq!(records[1].time, t2);
    assert_eq!(records[1].time_area, Some(own_area));
    assert_eq!(records[1].acc_area, Some(3.5));
}

#[test]
fn test_repeated_batch_adds_nothing() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("fires.geojson");
    let mut tracker = FireTracker::new(GeoJsonFireStore::new(&path), TrackerConfig::default()).unwrap();

    let batch = |time| vec![detection(strip(10.0, 0.01), time), detection(strip(10.2, 0.01), time)];
    let first = tracker.update(&batch(t1())).unwrap();
    assert_eq!(first.created, 2);

    let second = tracker.update(&batch(t1() + Duration::minutes(10))).unwrap();
    assert_eq!(second.unchanged, 2);
    assert_eq!(second.appended(), 0);
    assert_eq!(GeoJsonFireStore::new(&path).load().unwrap().len(), 2);
}

#[test]
fn test_acc_area_is_monotonic_per_fire() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("fires.geojson");
    let mut tracker = FireTracker::new(GeoJsonFireStore::new(&path), TrackerConfig::default()).unwrap();

    // Growing, shrinking and shifting detections of one fire
    let widths = [0.004, 0.006, 0.003, 0.008, 0.002, 0.009];
    for (i, w) in widths.iter().enumerate() {
        let x0 = 10.0 + 0.0005 * i as f64;
        let time = t1() + Duration::minutes(10 * i as i64);
        tracker.update(&[detection(strip(x0, *w), time)]).unwrap();
    }

    let mut records = GeoJsonFireStore::new(&path).load().unwrap();
    assert!(records.iter().all(|r| r.fire == 1));
    records.sort_by_key(|r| r.time);
    for pair in records.windows(2) {
        assert!(
            pair[1].acc_area.unwrap() >= pair[0].acc_area.unwrap(),
            "acc_area decreased: {:?} -> {:?}",
            pair[0].acc_area,
            pair[1].acc_area
        );
    }
}

#[test]
fn test_disjoint_detection_gets_next_identity() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("fires.geojson");
    let mut tracker = FireTracker::new(GeoJsonFireStore::new(&path), TrackerConfig::default()).unwrap();

    tracker.update(&[detection(strip(10.0, 0.01), t1())]).unwrap();
    tracker.update(&[detection(strip(10.3, 0.01), t1() + Duration::minutes(10))]).unwrap();

    let records = GeoJsonFireStore::new(&path).load().unwrap();
    let ids: Vec<_> = records.iter().map(|r| r.fire).collect();
    assert_eq!(ids, vec![1, 2]);
}

#[test]
fn test_legacy_store_with_id_column() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("legacy.geojson");
    let legacy = r#"{
      "type": "FeatureCollection",
      "features": [
        {
          "type": "Feature",
          "properties": {"id": 4, "time": "2025-08-11T11:50:00", "area": 12.0},
          "geometry": {"type": "Polygon", "coordinates": [[[10.0, 45.0], [10.01, 45.0], [10.01, 45.01], [10.0, 45.01], [10.0, 45.0]]]}
        }
      ]
    }"#;
    std::fs::write(&path, legacy).unwrap();

    let store = GeoJsonFireStore::new(&path);
    let records = store.load().unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].fire, 4);
    assert_eq!(records[0].acc_area, None);

    let mut tracker = FireTracker::new(store, TrackerConfig::default()).unwrap();
    let summary = tracker
        .update(&[
            detection(strip(10.005, 0.01), t1()),
            detection(strip(10.4, 0.01), t1()),
        ])
        .unwrap();
    assert_eq!(summary.merged, 1);
    assert_eq!(summary.created, 1);

    let records = GeoJsonFireStore::new(&path).load().unwrap();
    assert_eq!(records.len(), 3);
    assert_eq!(records[1].fire, 4);
    assert_eq!(records[2].fire, 5);
}

#[test]
fn test_written_columns_in_fixed_order() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("fires.geojson");
    let mut tracker = FireTracker::new(GeoJsonFireStore::new(&path), TrackerConfig::default()).unwrap();
    tracker.update(&[detection(strip(10.0, 0.01), t1())]).unwrap();

    let text = std::fs::read_to_string(&path).unwrap();
    let positions: Vec<usize> = ["\"fire\"", "\"time\"", "\"time_area\"", "\"acc_area\""]
        .iter()
        .map(|k| text.find(k).unwrap_or_else(|| panic!("missing column {}", k)))
        .collect();
    assert!(positions.windows(2).all(|w| w[0] < w[1]), "{:?}", positions);
    assert!(text.contains("2025-08-11T12:00:00Z"));

    // No stray temporary files next to the store
    let entries: Vec<_> = std::fs::read_dir(dir.path()).unwrap().collect();
    assert_eq!(entries.len(), 1);
}
