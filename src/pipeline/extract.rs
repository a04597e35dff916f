//! Figure extraction: crop service-reported regions out of rendered pages.
//!
//! Extraction runs speculatively: every region is cropped, then the crop's
//! pixel variance goes into [`GeometryFilter::classify`] together with its
//! shape. Regions judged decorative are discarded before anything is
//! encoded, so they never reach the package.

use crate::error::ExtractionError;
use crate::pipeline::encode::encode_png;
use crate::pipeline::geometry::{GeometryFilter, PageGeometry, Verdict};
use crate::pipeline::render::PageSource;
use crate::structuring::types::ImageRegion;
use image::{DynamicImage, GenericImageView};
use std::collections::BTreeMap;
use tracing::{debug, warn};

/// A figure cropped, converted to RGB and encoded as PNG.
#[derive(Debug, Clone, PartialEq)]
pub struct ExtractedImage {
    /// Path relative to the content root, e.g. `images/sec03-01.png`.
    pub href: String,
    pub width: u32,
    pub height: u32,
    pub source_region: ImageRegion,
    pub bytes: Vec<u8>,
}

impl ExtractedImage {
    /// Manifest id derived from the file name: `img-sec03-01`.
    pub fn manifest_id(&self) -> String {
        let stem = self
            .href
            .rsplit('/')
            .next()
            .unwrap_or(&self.href)
            .trim_end_matches(".png");
        format!("img-{stem}")
    }
}

/// What happened to one declared region.
#[derive(Debug, Clone, PartialEq)]
pub enum RegionOutcome {
    Extracted(ExtractedImage),
    Decorative(Verdict),
    Failed(ExtractionError),
}

impl RegionOutcome {
    pub fn image(&self) -> Option<&ExtractedImage> {
        match self {
            RegionOutcome::Extracted(img) => Some(img),
            _ => None,
        }
    }
}

/// Image file name for the `seq`-th kept figure of section `order`.
pub fn image_href(order: usize, seq: usize) -> String {
    format!("images/sec{order:02}-{seq:02}.png")
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ImageExtractor {
    filter: GeometryFilter,
}

impl ImageExtractor {
    pub fn new(filter: GeometryFilter) -> Self {
        Self { filter }
    }

    /// Crop `region` from a rendered `page`.
    ///
    /// The inner `Err` carries the verdict when the region is decorative.
    pub fn extract(
        &self,
        page: &DynamicImage,
        region: &ImageRegion,
        href: String,
    ) -> Result<Result<ExtractedImage, Verdict>, ExtractionError> {
        let (x, y, w, h) = denormalize(region, page.width(), page.height())?;
        let crop = page.view(x, y, w, h).to_image();
        let crop = DynamicImage::ImageRgba8(crop);

        let geometry = PageGeometry::new(page.width(), page.height());
        let verdict = self
            .filter
            .classify(&region.bbox, &geometry, Some(luma_variance(&crop)));
        if verdict.is_decorative() {
            debug!("Region {:?} on page {} is {:?}", region.bbox, region.page_index, verdict);
            return Ok(Err(verdict));
        }

        let bytes = encode_png(&crop).map_err(|e| ExtractionError::Encode(e.to_string()))?;
        Ok(Ok(ExtractedImage {
            href,
            width: w,
            height: h,
            source_region: region.clone(),
            bytes,
        }))
    }

    /// Extract every region of one section, in declaration order.
    ///
    /// Each page is rendered at most once. Failures are logged and recorded
    /// per region; they never fail the section.
    pub fn extract_section(
        &self,
        source: &dyn PageSource,
        order: usize,
        regions: &[ImageRegion],
    ) -> Vec<RegionOutcome> {
        let mut rendered: BTreeMap<usize, Result<DynamicImage, ExtractionError>> = BTreeMap::new();
        let mut seq = 0;
        regions
            .iter()
            .map(|region| {
                if !region.bbox.is_valid() {
                    let b = region.bbox;
                    let err = ExtractionError::OutOfBounds {
                        x0: b.x0,
                        y0: b.y0,
                        x1: b.x1,
                        y1: b.y1,
                    };
                    warn!("Section {}: skipping image: {}", order, err);
                    return RegionOutcome::Failed(err);
                }
                let page = rendered
                    .entry(region.page_index)
                    .or_insert_with(|| source.render_page(region.page_index));
                let page = match page {
                    Ok(p) => p,
                    Err(e) => {
                        warn!("Section {}: skipping image: {}", order, e);
                        return RegionOutcome::Failed(e.clone());
                    }
                };
                match self.extract(page, region, image_href(order, seq + 1)) {
                    Ok(Ok(img)) => {
                        seq += 1;
                        RegionOutcome::Extracted(img)
                    }
                    Ok(Err(verdict)) => RegionOutcome::Decorative(verdict),
                    Err(e) => {
                        warn!("Section {}: skipping image: {}", order, e);
                        RegionOutcome::Failed(e)
                    }
                }
            })
            .collect()
    }
}

/// Pixel rectangle `(x, y, w, h)` covering `region` on a `width`×`height` page.
///
/// Start edges round down and end edges round up, so the crop never loses
/// a partially covered pixel.
pub fn denormalize(
    region: &ImageRegion,
    width: u32,
    height: u32,
) -> Result<(u32, u32, u32, u32), ExtractionError> {
    let b = region.bbox;
    let out_of_bounds = || ExtractionError::OutOfBounds {
        x0: b.x0,
        y0: b.y0,
        x1: b.x1,
        y1: b.y1,
    };
    if !b.is_valid() {
        return Err(out_of_bounds());
    }
    let (wf, hf) = (width as f64, height as f64);
    // Products like 0.3 * 600 land a hair off the integer.
    let snap = |v: f64| if (v - v.round()).abs() < 1e-6 { v.round() } else { v };
    let x0 = (snap(b.x0 * wf).floor() as u32).min(width);
    let y0 = (snap(b.y0 * hf).floor() as u32).min(height);
    let x1 = (snap(b.x1 * wf).ceil() as u32).min(width);
    let y1 = (snap(b.y1 * hf).ceil() as u32).min(height);
    if x1 <= x0 || y1 <= y0 {
        return Err(out_of_bounds());
    }
    Ok((x0, y0, x1 - x0, y1 - y0))
}

/// Variance of the luma channel; 0 for an empty image.
pub fn luma_variance(img: &DynamicImage) -> f64 {
    let luma = img.to_luma8();
    let n = luma.pixels().len() as f64;
    if n == 0.0 {
        return 0.0;
    }
    let (sum, sum_sq) = luma.pixels().fold((0.0f64, 0.0f64), |(s, sq), p| {
        let v = p.0[0] as f64;
        (s + v, sq + v * v)
    });
    let mean = sum / n;
    (sum_sq / n - mean * mean).max(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::render::StaticPages;
    use crate::structuring::types::NormalizedBox;
    use image::{Rgb, RgbImage};

    /// 200x100 white page with a noisy block at x 40..120, y 20..80.
    fn page() -> DynamicImage {
        let mut img = RgbImage::from_pixel(200, 100, Rgb([255, 255, 255]));
        for y in 20..80 {
            for x in 40..120 {
                let v = ((x * 37 + y * 91) % 256) as u8;
                img.put_pixel(x, y, Rgb([v, 255 - v, v / 2]));
            }
        }
        DynamicImage::ImageRgb8(img)
    }

    fn region(x0: f64, y0: f64, x1: f64, y1: f64, page_index: usize) -> ImageRegion {
        ImageRegion {
            bbox: NormalizedBox::new(x0, y0, x1, y1),
            page_index,
            label: None,
            filename_hint: None,
        }
    }

    #[test]
    fn denormalize_rounds_outward_and_clamps() {
        let r = region(0.101, 0.2, 0.599, 1.0, 0);
        assert_eq!(denormalize(&r, 200, 100).unwrap(), (20, 20, 100, 80));
    }

    #[test]
    fn denormalize_rejects_out_of_range() {
        let r = region(0.1, 0.2, 1.3, 0.9, 0);
        assert!(matches!(
            denormalize(&r, 200, 100),
            Err(ExtractionError::OutOfBounds { .. })
        ));
    }

    #[test]
    fn figure_is_cropped_to_rgb_png() {
        let r = region(0.2, 0.2, 0.6, 0.8, 0);
        let img = ImageExtractor::default()
            .extract(&page(), &r, image_href(3, 1))
            .unwrap()
            .unwrap();
        assert_eq!((img.width, img.height), (80, 60));
        assert_eq!(img.href, "images/sec03-01.png");
        assert_eq!(img.manifest_id(), "img-sec03-01");
        let decoded = image::load_from_memory(&img.bytes).unwrap();
        assert_eq!(decoded.color(), image::ColorType::Rgb8);
    }

    #[test]
    fn blank_frame_at_margin_is_rejected() {
        let blank = DynamicImage::ImageRgb8(RgbImage::from_pixel(200, 100, Rgb([250, 250, 250])));
        let r = region(0.0, 0.0, 1.0, 1.0, 0);
        let out = ImageExtractor::default()
            .extract(&blank, &r, image_href(1, 1))
            .unwrap();
        assert_eq!(out.unwrap_err(), Verdict::Border);
    }

    #[test]
    fn section_extraction_records_each_region() {
        let source = StaticPages::new(vec![page(), page()]);
        let regions = vec![
            region(0.2, 0.2, 0.6, 0.8, 1),
            region(0.0, 0.5, 1.0, 0.51, 0),
            region(0.2, 0.2, 0.6, 0.8, 7),
            region(0.2, 0.2, 0.6, 0.8, 0),
        ];
        let out = ImageExtractor::default().extract_section(&source, 2, &regions);
        assert_eq!(out.len(), 4);
        assert_eq!(out[0].image().unwrap().href, "images/sec02-01.png");
        assert!(matches!(out[1], RegionOutcome::Decorative(Verdict::Separator)));
        assert!(matches!(
            out[2],
            RegionOutcome::Failed(ExtractionError::PageOutOfRange { page: 7, total: 2 })
        ));
        assert_eq!(out[3].image().unwrap().href, "images/sec02-02.png");
    }

    #[test]
    fn variance_of_flat_image_is_zero() {
        let flat = DynamicImage::ImageRgb8(RgbImage::from_pixel(5, 5, Rgb([9, 9, 9])));
        assert_eq!(luma_variance(&flat), 0.0);
        assert!(luma_variance(&page()) > 100.0);
    }
}
