use crate::core::contour::Contour;
use crate::core::detection::DetectionParams;
use crate::core::geometry::{
    close_ring, geodesic_area_ha, is_empty_polygon, is_valid_polygon, orient_ccw, simplify_preserving,
};
use crate::types::GeoTransform;
use geo::{Coord, LineString, Polygon};

/// Accepted polygons and their hectare areas, index-aligned
#[derive(Debug, Clone, Default)]
pub struct ExtractedPolygons {
    pub polygons: Vec<Polygon<f64>>,
    pub areas_ha: Vec<f64>,
}

impl ExtractedPolygons {
    pub fn len(&self) -> usize {
        self.polygons.len()
    }

    pub fn is_empty(&self) -> bool {
        self.polygons.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&Polygon<f64>, f64)> {
        self.polygons.iter().zip(self.areas_ha.iter().copied())
    }
}

/// Pixel contours to simplified, area-filtered geographic polygons
#[derive(Debug, Clone)]
pub struct PolygonExtractor {
    pub min_area_ha: f64,
    pub simplify_tolerance: f64,
}

impl Default for PolygonExtractor {
    fn default() -> Self {
        Self {
            min_area_ha: 1.0,
            simplify_tolerance: 0.001,
        }
    }
}

impl PolygonExtractor {
    pub fn from_params(params: &DetectionParams) -> Self {
        Self {
            min_area_ha: params.min_area_ha,
            simplify_tolerance: params.simplify_tolerance,
        }
    }

    /// Geographic polygon through the pixel centres of a contour, exterior
    /// counter-clockwise in lon/lat
    pub fn contour_to_polygon(contour: &Contour, transform: &GeoTransform) -> Polygon<f64> {
        let mut coords: Vec<Coord<f64>> = contour
            .points
            .iter()
            .map(|p| {
                let (x, y) = transform.pixel_center(p.x as f64, p.y as f64);
                Coord { x, y }
            })
            .collect();
        close_ring(&mut coords);
        orient_ccw(&Polygon::new(LineString::new(coords), vec![]))
    }

    /// Convert, validate, simplify, measure and filter one contour
    pub fn process_contour(&self, contour: &Contour, transform: &GeoTransform) -> Option<(Polygon<f64>, f64)> {
        let polygon = Self::contour_to_polygon(contour, transform);
        if is_empty_polygon(&polygon) || !is_valid_polygon(&polygon) {
            log::debug!("Dropping invalid contour with {} points", contour.len());
            return None;
        }

        let simplified = simplify_preserving(&polygon, self.simplify_tolerance);
        if is_empty_polygon(&simplified) || !is_valid_polygon(&simplified) {
            log::debug!("Dropping contour invalidated by simplification");
            return None;
        }

        let area_ha = geodesic_area_ha(&simplified);
        if area_ha < self.min_area_ha {
            log::debug!("Dropping polygon of {:.3} ha (< {} ha)", area_ha, self.min_area_ha);
            return None;
        }
        Some((simplified, area_ha))
    }

    pub fn extract(&self, contours: &[Contour], transform: &GeoTransform) -> ExtractedPolygons {
        let mut out = ExtractedPolygons::default();
        for contour in contours {
            if let Some((polygon, area)) = self.process_contour(contour, transform) {
                out.polygons.push(polygon);
                out.areas_ha.push(area);
            }
        }
        log::debug!("Kept {} of {} contours as polygons", out.len(), contours.len());
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::contour::PixelPoint;
    use geo::Winding;

    fn rectangle_contour(x0: i64, y0: i64, x1: i64, y1: i64) -> Contour {
        let mut points = Vec::new();
        for x in x0..=x1 {
            points.push(PixelPoint::new(x, y0));
        }
        for y in (y0 + 1)..=y1 {
            points.push(PixelPoint::new(x1, y));
        }
        for x in (x0..x1).rev() {
            points.push(PixelPoint::new(x, y1));
        }
        for y in ((y0 + 1)..y1).rev() {
            points.push(PixelPoint::new(x0, y));
        }
        Contour { points }
    }

    // ~0.00125 degree pixels, roughly 100 m x 140 m at 45N
    fn transform() -> GeoTransform {
        GeoTransform::from_gdal([10.0, 0.00125, 0.0, 45.5, 0.0, -0.00125])
    }

    #[test]
    fn test_ring_closed_and_area_filtered() {
        let extractor = PolygonExtractor { min_area_ha: 5.0, simplify_tolerance: 0.001 };
        // The 2x2 block covers a single pixel spacing, ~1.4 ha
        let contours = vec![rectangle_contour(0, 0, 40, 40), rectangle_contour(60, 60, 61, 61)];
        let out = extractor.extract(&contours, &transform());

        assert_eq!(out.len(), 1);
        assert_eq!(out.areas_ha.len(), out.polygons.len());
        let ring = &out.polygons[0].exterior().0;
        assert_eq!(ring.first(), ring.last());
        // Traced clockwise on screen, stored counter-clockwise in lon/lat
        assert!(out.polygons[0].exterior().is_ccw());
        assert!(out.areas_ha[0] >= extractor.min_area_ha);
        // 0.05 x 0.05 deg at 45.45N, ~3.9 km x 5.6 km
        assert!(out.areas_ha[0] > 2100.0 && out.areas_ha[0] < 2250.0, "area {}", out.areas_ha[0]);
    }

    #[test]
    fn test_small_block_below_min_area_is_dropped() {
        // One pixel spacing each way, ~1.4 ha
        let extractor = PolygonExtractor { min_area_ha: 5.0, simplify_tolerance: 0.0 };
        assert!(extractor.process_contour(&rectangle_contour(60, 60, 61, 61), &transform()).is_none());

        let keep_all = PolygonExtractor { min_area_ha: 0.0, simplify_tolerance: 0.0 };
        let (_, area) = keep_all.process_contour(&rectangle_contour(60, 60, 61, 61), &transform()).unwrap();
        assert!(area > 1.2 && area < 1.6, "area {}", area);
    }

    #[test]
    fn test_simplification_reduces_vertices() {
        let extractor = PolygonExtractor { min_area_ha: 0.0, simplify_tolerance: 0.001 };
        let contour = rectangle_contour(0, 0, 40, 40);
        let (poly, _) = extractor.process_contour(&contour, &transform()).unwrap();
        assert_eq!(poly.exterior().0.len(), 5);
    }

    #[test]
    fn test_degenerate_contours_dropped() {
        let extractor = PolygonExtractor { min_area_ha: 0.0, simplify_tolerance: 0.0 };
        let single = Contour { points: vec![PixelPoint::new(3, 3)] };
        let line = Contour {
            points: vec![PixelPoint::new(0, 0), PixelPoint::new(1, 1), PixelPoint::new(2, 2), PixelPoint::new(1, 1)],
        };
        let out = extractor.extract(&[single, line], &transform());
        assert!(out.is_empty());
    }

    #[test]
    fn test_min_area_threshold_is_inclusive() {
        let contour = rectangle_contour(0, 0, 10, 10);
        let probe = PolygonExtractor { min_area_ha: 0.0, simplify_tolerance: 0.0 };
        let (_, area) = probe.process_contour(&contour, &transform()).unwrap();

        let exact = PolygonExtractor { min_area_ha: area, simplify_tolerance: 0.0 };
        assert!(exact.process_contour(&contour, &transform()).is_some());
        let above = PolygonExtractor { min_area_ha: area + 0.01, simplify_tolerance: 0.0 };
        assert!(above.process_contour(&contour, &transform()).is_none());
    }
}
