use crate::core::orchestrator::RasterDecoder;
use crate::types::{FireError, FireResult, GeoTransform, RasterTile, RgbImage};
use std::io::Write;

/// Decodes GeoTIFF (or any GDAL-readable raster) bytes returned by the
/// image source. Bands 1-3 are read as red, green and blue.
#[derive(Debug, Default, Clone, Copy)]
pub struct GdalRasterDecoder;

impl GdalRasterDecoder {
    pub fn new() -> Self {
        Self
    }
}

impl RasterDecoder for GdalRasterDecoder {
    fn decode(&self, bytes: &[u8]) -> FireResult<RasterTile> {
        use tempfile::NamedTempFile;

        if bytes.is_empty() {
            return Err(FireError::Decode("Empty image payload".to_string()));
        }

        // GDAL reads from a path; stage the payload in a temporary file
        let mut temp_file = NamedTempFile::new()?;
        temp_file.write_all(bytes)?;
        temp_file.flush()?;

        let dataset = gdal::Dataset::open(temp_file.path())
            .map_err(|e| FireError::Decode(format!("Failed to open raster with GDAL: {}", e)))?;

        let (width, height) = dataset.raster_size();
        let band_count = dataset.raster_count();
        log::debug!("Raster dimensions: {} x {}, bands: {}", width, height, band_count);
        if band_count < 3 {
            return Err(FireError::Decode(format!(
                "Expected at least 3 bands, got {}",
                band_count
            )));
        }

        let mut pixels = RgbImage::zeros((height, width, 3));
        for band_index in 1..=3 {
            let band = dataset
                .rasterband(band_index)
                .map_err(|e| FireError::Decode(format!("Failed to get band {}: {}", band_index, e)))?;
            let buffer = band
                .read_as::<u8>((0, 0), (width, height), (width, height), None)
                .map_err(|e| FireError::Decode(format!("Failed to read band {}: {}", band_index, e)))?;
            if buffer.data.len() != width * height {
                return Err(FireError::Decode(format!(
                    "Band {} holds {} samples, expected {}",
                    band_index,
                    buffer.data.len(),
                    width * height
                )));
            }
            let channel = (band_index - 1) as usize;
            for (idx, value) in buffer.data.iter().enumerate() {
                pixels[[idx / width, idx % width, channel]] = *value;
            }
        }

        let transform = dataset
            .geo_transform()
            .map(GeoTransform::from_gdal)
            .map_err(|e| FireError::Decode(format!("Raster has no geotransform: {}", e)))?;
        let crs = dataset.projection();

        Ok(RasterTile { pixels, transform, crs })
    }
}
