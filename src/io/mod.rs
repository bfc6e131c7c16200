//! Image source, raster decoding and fire store back-ends

pub mod store;
pub mod wms;
#[cfg(feature = "gdal")]
pub mod raster;

pub use store::{open_store, FireStore, GeoJsonFireStore, MemoryFireStore};
#[cfg(feature = "gdal")]
pub use store::GdalFireStore;
pub use wms::{WmsConfig, WmsImageSource};
#[cfg(feature = "gdal")]
pub use raster::GdalRasterDecoder;
