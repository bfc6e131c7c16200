//! Persisted fire history.
//!
//! Stores are read and written whole. Writers emit the columns in
//! [`FIRE_COLUMNS`] order and replace the previous file atomically, so a
//! crash mid-write leaves the last complete state on disk.

use crate::types::{format_timestamp, parse_timestamp, FireError, FireId, FireRecord, FireResult, FIRE_COLUMNS};
use geo::{Geometry, MultiPolygon};
use geojson::{Feature, FeatureCollection, GeoJson, JsonObject, JsonValue};
use std::io::Write;
use std::path::{Path, PathBuf};

/// Whole-collection persistence for fire records
pub trait FireStore: Send {
    /// Human readable location, used in log messages
    fn location(&self) -> String;

    fn exists(&self) -> bool;

    /// All records in stored order; an absent store reads as empty
    fn load(&self) -> FireResult<Vec<FireRecord>>;

    /// Replace the stored collection
    fn save(&mut self, records: &[FireRecord]) -> FireResult<()>;
}

/// In-memory store, mainly for tests and dry runs
#[derive(Debug, Default, Clone)]
pub struct MemoryFireStore {
    records: Option<Vec<FireRecord>>,
    saves: usize,
}

impl MemoryFireStore {
    pub fn with_records(records: Vec<FireRecord>) -> Self {
        Self { records: Some(records), saves: 0 }
    }

    pub fn records(&self) -> &[FireRecord] {
        self.records.as_deref().unwrap_or(&[])
    }

    /// Number of completed writes
    pub fn saves(&self) -> usize {
        self.saves
    }
}

impl FireStore for MemoryFireStore {
    fn location(&self) -> String {
        "<memory>".to_string()
    }

    fn exists(&self) -> bool {
        self.records.is_some()
    }

    fn load(&self) -> FireResult<Vec<FireRecord>> {
        Ok(self.records.clone().unwrap_or_default())
    }

    fn save(&mut self, records: &[FireRecord]) -> FireResult<()> {
        self.records = Some(records.to_vec());
        self.saves += 1;
        Ok(())
    }
}

/// Keep polygonal parts only; anything else in a stored geometry is dropped
fn to_multipolygon(geometry: Geometry<f64>) -> Option<MultiPolygon<f64>> {
    match geometry {
        Geometry::Polygon(p) => Some(MultiPolygon::new(vec![p])),
        Geometry::MultiPolygon(mp) => Some(mp),
        Geometry::GeometryCollection(gc) => {
            let polys: Vec<_> = gc
                .into_iter()
                .filter_map(to_multipolygon)
                .flat_map(|mp| mp.0)
                .collect();
            if polys.is_empty() {
                None
            } else {
                Some(MultiPolygon::new(polys))
            }
        }
        _ => None,
    }
}

/// Write through a temporary sibling and rename it over `path`
fn write_atomic(path: &Path, contents: &[u8]) -> FireResult<()> {
    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    std::fs::create_dir_all(&parent)?;
    let mut temp = tempfile::NamedTempFile::new_in(&parent)?;
    temp.write_all(contents)?;
    temp.as_file().sync_all()?;
    temp.persist(path)
        .map_err(|e| FireError::Persistence(format!("Failed to replace {}: {}", path.display(), e.error)))?;
    Ok(())
}

fn identity_from_json(value: Option<&JsonValue>) -> Option<FireId> {
    match value? {
        JsonValue::Number(n) => n
            .as_u64()
            .or_else(|| n.as_f64().filter(|f| *f >= 0.0 && f.fract() == 0.0).map(|f| f as u64))
            .and_then(|v| FireId::try_from(v).ok()),
        JsonValue::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// GeoJSON FeatureCollection on disk
#[derive(Debug, Clone)]
pub struct GeoJsonFireStore {
    path: PathBuf,
}

impl GeoJsonFireStore {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self { path: path.as_ref().to_path_buf() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn record_from_feature(&self, index: usize, feature: Feature) -> FireResult<Option<FireRecord>> {
        let geometry = match feature.geometry {
            Some(g) => {
                let geometry = Geometry::<f64>::try_from(g.value)
                    .map_err(|e| FireError::Persistence(format!("Feature {}: {}", index, e)))?;
                to_multipolygon(geometry)
            }
            None => None,
        };
        let geometry = match geometry {
            Some(g) => g,
            None => {
                log::warn!("Feature {} in {} has no polygon geometry, ignored", index, self.path.display());
                return Ok(None);
            }
        };

        let props = feature.properties.unwrap_or_default();
        // Older stores name the identity column `id`
        let fire = identity_from_json(props.get("fire"))
            .or_else(|| identity_from_json(props.get("id")))
            .unwrap_or(1);

        let time = match props.get("time") {
            Some(JsonValue::String(s)) => parse_timestamp(s)
                .map_err(|e| FireError::Persistence(format!("Feature {}: {}", index, e)))?,
            _ => {
                return Err(FireError::Persistence(format!(
                    "Feature {} in {} has no time attribute",
                    index,
                    self.path.display()
                )))
            }
        };

        Ok(Some(FireRecord {
            fire,
            time,
            time_area: props.get("time_area").and_then(JsonValue::as_f64),
            acc_area: props.get("acc_area").and_then(JsonValue::as_f64),
            geometry,
        }))
    }

    fn feature_from_record(record: &FireRecord) -> Feature {
        let mut props = JsonObject::new();
        for column in FIRE_COLUMNS.iter().filter(|c| **c != "geometry") {
            let value = match *column {
                "fire" => JsonValue::from(record.fire),
                "time" => JsonValue::from(format_timestamp(&record.time)),
                "time_area" => record.time_area.map_or(JsonValue::Null, JsonValue::from),
                "acc_area" => record.acc_area.map_or(JsonValue::Null, JsonValue::from),
                _ => JsonValue::Null,
            };
            props.insert(column.to_string(), value);
        }
        Feature {
            bbox: None,
            geometry: Some(geojson::Geometry::new(geojson::Value::from(&record.geometry))),
            id: None,
            properties: Some(props),
            foreign_members: None,
        }
    }
}

impl FireStore for GeoJsonFireStore {
    fn location(&self) -> String {
        self.path.display().to_string()
    }

    fn exists(&self) -> bool {
        self.path.is_file()
    }

    fn load(&self) -> FireResult<Vec<FireRecord>> {
        if !self.exists() {
            return Ok(Vec::new());
        }
        let text = std::fs::read_to_string(&self.path)?;
        let geojson: GeoJson = text
            .parse()
            .map_err(|e| FireError::Persistence(format!("Failed to parse {}: {}", self.path.display(), e)))?;

        let features = match geojson {
            GeoJson::FeatureCollection(fc) => fc.features,
            GeoJson::Feature(f) => vec![f],
            GeoJson::Geometry(_) => {
                return Err(FireError::Persistence(format!(
                    "{} holds a bare geometry, expected features",
                    self.path.display()
                )))
            }
        };

        let mut records = Vec::with_capacity(features.len());
        for (index, feature) in features.into_iter().enumerate() {
            if let Some(record) = self.record_from_feature(index, feature)? {
                records.push(record);
            }
        }
        log::debug!("Loaded {} fire records from {}", records.len(), self.path.display());
        Ok(records)
    }

    fn save(&mut self, records: &[FireRecord]) -> FireResult<()> {
        let collection = FeatureCollection {
            bbox: None,
            features: records.iter().map(Self::feature_from_record).collect(),
            foreign_members: None,
        };
        let body = serde_json::to_vec_pretty(&collection)?;
        write_atomic(&self.path, &body)
            .map_err(|e| FireError::Persistence(format!("Failed to write {}: {}", self.path.display(), e)))?;
        log::debug!("Wrote {} fire records to {}", records.len(), self.path.display());
        Ok(())
    }
}

#[cfg(feature = "gdal")]
pub use ogr::GdalFireStore;

#[cfg(feature = "gdal")]
mod ogr {
    use super::to_multipolygon;
    use crate::types::{format_timestamp, parse_timestamp, FireError, FireId, FireRecord, FireResult, FIRE_COLUMNS};
    use gdal::spatial_ref::SpatialRef;
    use gdal::vector::{Feature, FieldValue, LayerAccess, LayerOptions, ToGdal};
    use gdal::{Dataset, DriverManager};
    use gdal_sys::{OGRFieldType, OGRwkbGeometryType};
    use std::path::{Path, PathBuf};

    /// Vector store written through OGR (ESRI Shapefile, GeoPackage, ...)
    #[derive(Debug, Clone)]
    pub struct GdalFireStore {
        path: PathBuf,
        driver: String,
    }

    impl GdalFireStore {
        pub fn new<P: AsRef<Path>>(path: P, driver: &str) -> Self {
            Self { path: path.as_ref().to_path_buf(), driver: driver.to_string() }
        }

        pub fn shapefile<P: AsRef<Path>>(path: P) -> Self {
            Self::new(path, "ESRI Shapefile")
        }

        pub fn geopackage<P: AsRef<Path>>(path: P) -> Self {
            Self::new(path, "GPKG")
        }

        pub fn path(&self) -> &Path {
            &self.path
        }

        fn layer_name(&self) -> String {
            self.path
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_else(|| "fires".to_string())
        }

        /// Files that make up the dataset at `path`
        fn sidecars(&self, path: &Path) -> Vec<PathBuf> {
            if self.driver == "ESRI Shapefile" {
                ["shp", "shx", "dbf", "prj", "cpg"]
                    .iter()
                    .map(|ext| path.with_extension(ext))
                    .collect()
            } else {
                vec![path.to_path_buf()]
            }
        }

        fn write_dataset(&self, target: &Path, records: &[FireRecord]) -> FireResult<()> {
            let driver = DriverManager::get_driver_by_name(&self.driver)?;
            let mut dataset = driver.create_vector_only(target)?;
            let srs = SpatialRef::from_epsg(4326)?;
            let layer = dataset.create_layer(LayerOptions {
                name: &self.layer_name(),
                srs: Some(&srs),
                ty: OGRwkbGeometryType::wkbMultiPolygon,
                options: None,
            })?;

            let fields: Vec<(&str, u32)> = FIRE_COLUMNS
                .iter()
                .filter_map(|c| match *c {
                    "fire" => Some((*c, OGRFieldType::OFTInteger)),
                    "time" => Some((*c, OGRFieldType::OFTString)),
                    "time_area" | "acc_area" => Some((*c, OGRFieldType::OFTReal)),
                    _ => None,
                })
                .collect();
            layer.create_defn_fields(&fields)?;

            for record in records {
                let mut feature = Feature::new(layer.defn())?;
                feature.set_geometry(geo::Geometry::MultiPolygon(record.geometry.clone()).to_gdal()?)?;
                feature.set_field_integer("fire", record.fire as i32)?;
                feature.set_field_string("time", &format_timestamp(&record.time))?;
                if let Some(v) = record.time_area {
                    feature.set_field_double("time_area", v)?;
                }
                if let Some(v) = record.acc_area {
                    feature.set_field_double("acc_area", v)?;
                }
                feature.create(&layer)?;
            }
            Ok(())
        }
    }

    fn field_identity(value: Option<FieldValue>) -> Option<FireId> {
        match value? {
            FieldValue::IntegerValue(v) => FireId::try_from(v).ok(),
            FieldValue::Integer64Value(v) => FireId::try_from(v).ok(),
            FieldValue::RealValue(v) if v >= 0.0 && v.fract() == 0.0 => Some(v as FireId),
            FieldValue::StringValue(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    fn field_real(value: Option<FieldValue>) -> Option<f64> {
        match value? {
            FieldValue::RealValue(v) => Some(v),
            FieldValue::IntegerValue(v) => Some(f64::from(v)),
            FieldValue::Integer64Value(v) => Some(v as f64),
            FieldValue::StringValue(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    impl super::FireStore for GdalFireStore {
        fn location(&self) -> String {
            self.path.display().to_string()
        }

        fn exists(&self) -> bool {
            self.path.exists()
        }

        fn load(&self) -> FireResult<Vec<FireRecord>> {
            if !self.exists() {
                return Ok(Vec::new());
            }
            let dataset = Dataset::open(&self.path)?;
            let mut layer = dataset.layer(0)?;
            let names: Vec<String> = layer.defn().fields().map(|f| f.name()).collect();
            let has = |name: &str| names.iter().any(|n| n == name);
            // Older stores name the identity column `id`
            let identity_column = if has("fire") {
                Some("fire")
            } else if has("id") {
                Some("id")
            } else {
                None
            };

            let mut records = Vec::new();
            for (index, feature) in layer.features().enumerate() {
                let geometry = match feature.geometry() {
                    Some(g) => to_multipolygon(g.to_geo()?),
                    None => None,
                };
                let geometry = match geometry {
                    Some(g) => g,
                    None => {
                        log::warn!("Feature {} in {} has no polygon geometry, ignored", index, self.path.display());
                        continue;
                    }
                };

                let fire = match identity_column {
                    Some(col) => field_identity(feature.field(col)?).unwrap_or(1),
                    None => 1,
                };
                let time = match if has("time") { feature.field("time")? } else { None } {
                    Some(FieldValue::StringValue(s)) => parse_timestamp(&s)
                        .map_err(|e| FireError::Persistence(format!("Feature {}: {}", index, e)))?,
                    Some(FieldValue::DateTimeValue(dt)) => dt.with_timezone(&chrono::Utc),
                    _ => {
                        return Err(FireError::Persistence(format!(
                            "Feature {} in {} has no time attribute",
                            index,
                            self.path.display()
                        )))
                    }
                };
                let time_area = if has("time_area") { field_real(feature.field("time_area")?) } else { None };
                let acc_area = if has("acc_area") { field_real(feature.field("acc_area")?) } else { None };

                records.push(FireRecord { fire, time, time_area, acc_area, geometry });
            }
            log::debug!("Loaded {} fire records from {}", records.len(), self.path.display());
            Ok(records)
        }

        fn save(&mut self, records: &[FireRecord]) -> FireResult<()> {
            let parent = match self.path.parent() {
                Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
                _ => PathBuf::from("."),
            };
            std::fs::create_dir_all(&parent)?;
            let staging = tempfile::tempdir_in(&parent)?;
            let file_name = self
                .path
                .file_name()
                .ok_or_else(|| FireError::Persistence(format!("Invalid store path {}", self.path.display())))?;
            let staged = staging.path().join(file_name);

            self.write_dataset(&staged, records)
                .map_err(|e| FireError::Persistence(format!("Failed to write {}: {}", self.path.display(), e)))?;

            for (from, to) in self.sidecars(&staged).into_iter().zip(self.sidecars(&self.path)) {
                if from.exists() {
                    std::fs::rename(&from, &to).map_err(|e| {
                        FireError::Persistence(format!("Failed to replace {}: {}", to.display(), e))
                    })?;
                }
            }
            log::debug!("Wrote {} fire records to {}", records.len(), self.path.display());
            Ok(())
        }
    }
}

/// Pick a store back-end from the file extension. GeoJSON is always
/// available; Shapefile and GeoPackage need the `gdal` feature.
pub fn open_store<P: AsRef<Path>>(path: P) -> FireResult<Box<dyn FireStore>> {
    let path = path.as_ref();
    let ext = path
        .extension()
        .map(|e| e.to_string_lossy().to_lowercase())
        .unwrap_or_default();

    match ext.as_str() {
        "geojson" | "json" => Ok(Box::new(GeoJsonFireStore::new(path))),
        #[cfg(feature = "gdal")]
        "shp" => Ok(Box::new(GdalFireStore::shapefile(path))),
        #[cfg(feature = "gdal")]
        "gpkg" => Ok(Box::new(GdalFireStore::geopackage(path))),
        other => Err(FireError::InvalidConfig(format!(
            "Unsupported store format '{}' for {}",
            other,
            path.display()
        ))),
    }
}

impl FireStore for Box<dyn FireStore> {
    fn location(&self) -> String {
        (**self).location()
    }

    fn exists(&self) -> bool {
        (**self).exists()
    }

    fn load(&self) -> FireResult<Vec<FireRecord>> {
        (**self).load()
    }

    fn save(&mut self, records: &[FireRecord]) -> FireResult<()> {
        (**self).save(records)
    }
}
