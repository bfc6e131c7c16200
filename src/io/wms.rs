use crate::core::orchestrator::{ImageSource, TileRequest};
use crate::types::{format_timestamp, BoundingBox, FireError, FireResult};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// WMS endpoint and layer settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct WmsConfig {
    pub url: String,
    pub layer: String,
    pub version: String,
    pub crs: String,
    pub format: String,
    pub timeout_secs: u64,
}

impl Default for WmsConfig {
    fn default() -> Self {
        Self {
            url: "https://view.eumetsat.int/geoserver/wms".to_string(),
            layer: "mtg_fd:rgb_firetemperature".to_string(),
            version: "1.3.0".to_string(),
            crs: "EPSG:4326".to_string(),
            format: "image/geotiff".to_string(),
            timeout_secs: 30,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ServiceExceptionReport {
    #[serde(rename = "ServiceException", default)]
    exceptions: Vec<ServiceException>,
}

#[derive(Debug, Deserialize)]
struct ServiceException {
    #[serde(rename = "@code", default)]
    code: Option<String>,
    #[serde(rename = "$text", default)]
    message: String,
}

/// Message of an OGC service exception document, if `body` is one
pub fn parse_service_exception(body: &[u8]) -> Option<String> {
    let text = std::str::from_utf8(body).ok()?;
    if !text.contains("ServiceException") {
        return None;
    }
    let report: ServiceExceptionReport = match quick_xml::de::from_str(text) {
        Ok(r) => r,
        Err(e) => {
            log::debug!("Unparseable service exception document: {}", e);
            return Some(text.trim().chars().take(200).collect());
        }
    };
    let messages: Vec<String> = report
        .exceptions
        .iter()
        .map(|e| match &e.code {
            Some(code) => format!("{}: {}", code, e.message.trim()),
            None => e.message.trim().to_string(),
        })
        .collect();
    Some(if messages.is_empty() {
        "empty service exception report".to_string()
    } else {
        messages.join("; ")
    })
}

/// GetMap client for a time-enabled WMS layer
pub struct WmsImageSource {
    config: WmsConfig,
    client: reqwest::blocking::Client,
}

impl WmsImageSource {
    pub fn new(config: WmsConfig) -> FireResult<Self> {
        if config.url.is_empty() || config.layer.is_empty() {
            return Err(FireError::InvalidConfig("WMS url and layer are required".to_string()));
        }
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .user_agent(concat!("firetrack/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| FireError::Transport(format!("Failed to create HTTP client: {}", e)))?;
        Ok(Self { config, client })
    }

    pub fn config(&self) -> &WmsConfig {
        &self.config
    }

    /// WMS 1.3.0 uses the CRS axis order, which is lat/lon for EPSG:4326
    fn bbox_param(&self, bbox: &BoundingBox) -> String {
        let latlon = self.config.version.starts_with("1.3") && self.config.crs.eq_ignore_ascii_case("EPSG:4326");
        if latlon {
            format!("{},{},{},{}", bbox.min_lat, bbox.min_lon, bbox.max_lat, bbox.max_lon)
        } else {
            format!("{},{},{},{}", bbox.min_lon, bbox.min_lat, bbox.max_lon, bbox.max_lat)
        }
    }

    /// GetMap query parameters, in request order
    pub fn query(&self, request: &TileRequest) -> Vec<(&'static str, String)> {
        let crs_key = if self.config.version.starts_with("1.3") { "CRS" } else { "SRS" };
        vec![
            ("SERVICE", "WMS".to_string()),
            ("VERSION", self.config.version.clone()),
            ("REQUEST", "GetMap".to_string()),
            ("LAYERS", self.config.layer.clone()),
            ("STYLES", String::new()),
            (crs_key, self.config.crs.clone()),
            ("BBOX", self.bbox_param(&request.bbox)),
            ("WIDTH", request.width.to_string()),
            ("HEIGHT", request.height.to_string()),
            ("FORMAT", self.config.format.clone()),
            ("TIME", format_timestamp(&request.time)),
            ("TRANSPARENT", "TRUE".to_string()),
        ]
    }
}

impl ImageSource for WmsImageSource {
    fn fetch(&self, request: &TileRequest) -> FireResult<Vec<u8>> {
        let time = format_timestamp(&request.time);
        log::debug!("Requesting {} for {} at {}x{}", time, request.bbox, request.width, request.height);

        let response = self
            .client
            .get(&self.config.url)
            .query(&self.query(request))
            .send()
            .map_err(|e| FireError::Transport(format!("Request for {} failed: {}", time, e)))?;

        let status = response.status();
        let is_xml = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map_or(false, |ct| ct.contains("xml"));
        let body = response
            .bytes()
            .map_err(|e| FireError::Transport(format!("Failed to read response for {}: {}", time, e)))?;

        if !status.is_success() {
            let detail = parse_service_exception(&body).unwrap_or_default();
            return Err(FireError::Transport(format!(
                "HTTP {} {} for {} {}",
                status.as_u16(),
                status.canonical_reason().unwrap_or(""),
                time,
                detail
            )));
        }
        if is_xml || body.starts_with(b"<?xml") {
            if let Some(message) = parse_service_exception(&body) {
                return Err(FireError::Transport(format!("WMS exception for {}: {}", time, message)));
            }
        }
        if body.is_empty() {
            return Err(FireError::Transport(format!("Empty response for {}", time)));
        }

        log::debug!("Downloaded {} bytes for {}", body.len(), time);
        Ok(body.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Utc};

    fn request() -> TileRequest {
        TileRequest {
            bbox: BoundingBox::new(10.0, 45.0, 10.5, 45.5).unwrap(),
            time: Utc.with_ymd_and_hms(2025, 8, 11, 12, 10, 0).unwrap(),
            width: 79,
            height: 111,
        }
    }

    #[test]
    fn test_getmap_query() {
        let source = WmsImageSource::new(WmsConfig::default()).unwrap();
        let query = source.query(&request());
        let get = |k: &str| query.iter().find(|(key, _)| *key == k).map(|(_, v)| v.clone());

        assert_eq!(get("REQUEST").as_deref(), Some("GetMap"));
        assert_eq!(get("LAYERS").as_deref(), Some("mtg_fd:rgb_firetemperature"));
        assert_eq!(get("CRS").as_deref(), Some("EPSG:4326"));
        assert_eq!(get("BBOX").as_deref(), Some("45,10,45.5,10.5"));
        assert_eq!(get("WIDTH").as_deref(), Some("79"));
        assert_eq!(get("TIME").as_deref(), Some("2025-08-11T12:10:00Z"));
        assert!(get("SRS").is_none());
    }

    #[test]
    fn test_legacy_version_uses_srs_and_lonlat() {
        let config = WmsConfig { version: "1.1.1".to_string(), ..Default::default() };
        let source = WmsImageSource::new(config).unwrap();
        let query = source.query(&request());
        assert!(query.iter().any(|(k, v)| *k == "SRS" && v == "EPSG:4326"));
        assert!(query.iter().any(|(k, v)| *k == "BBOX" && v == "10,45,10.5,45.5"));
    }

    #[test]
    fn test_service_exception_parsing() {
        let body = br#"<?xml version="1.0" encoding="UTF-8"?>
<ServiceExceptionReport version="1.3.0" xmlns="http://www.opengis.net/ogc">
  <ServiceException code="InvalidDimensionValue">
    Time value out of range
  </ServiceException>
</ServiceExceptionReport>"#;
        assert_eq!(
            parse_service_exception(body).as_deref(),
            Some("InvalidDimensionValue: Time value out of range")
        );
        assert!(parse_service_exception(b"II*\x00binary").is_none());
    }

    #[test]
    fn test_missing_layer_rejected() {
        let config = WmsConfig { layer: String::new(), ..Default::default() };
        assert!(WmsImageSource::new(config).is_err());
    }
}
