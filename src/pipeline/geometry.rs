//! Decorative-region filter.
//!
//! Models asked for figures also report borders, horizontal rules and
//! highlight boxes. These heuristics decide, from shape and position alone
//! (plus an optional pixel-variance sample), whether a candidate region is a
//! real figure. Everything here is a pure function: no I/O, no state, and
//! every input, including NaN coordinates, gets a verdict.

use crate::structuring::types::NormalizedBox;

/// Tunable limits for [`GeometryFilter`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FilterThresholds {
    /// Minimum region area as a fraction of page area.
    pub min_area_ratio: f64,
    /// Minimum short-side / long-side ratio; thinner regions are separators.
    pub min_aspect: f64,
    /// Minimum short side in rendered pixels.
    pub min_side_px: f64,
    /// Distance from a page edge (normalised) that counts as touching it.
    pub margin_epsilon: f64,
    /// Luma variance below which a region is visually empty.
    pub min_variance: f64,
}

impl Default for FilterThresholds {
    fn default() -> Self {
        Self {
            min_area_ratio: 0.01,
            min_aspect: 0.02,
            min_side_px: 4.0,
            margin_epsilon: 0.02,
            min_variance: 25.0,
        }
    }
}

/// Rendered page size in pixels.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PageGeometry {
    pub width: f64,
    pub height: f64,
}

impl PageGeometry {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            width: width as f64,
            height: height as f64,
        }
    }
}

/// Classification of a candidate region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Figure,
    /// Below the minimum figure area.
    TooSmall,
    /// A thin line.
    Separator,
    /// Flush against a margin with no visual content.
    Border,
}

impl Verdict {
    pub fn is_decorative(self) -> bool {
        self != Verdict::Figure
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct GeometryFilter {
    pub thresholds: FilterThresholds,
}

impl GeometryFilter {
    pub fn new(thresholds: FilterThresholds) -> Self {
        Self { thresholds }
    }

    /// Shape-only check. Border detection needs a variance sample, so a
    /// region that merely touches a margin counts as a figure here.
    pub fn is_decorative(&self, region: &NormalizedBox, page: &PageGeometry) -> bool {
        self.classify(region, page, None).is_decorative()
    }

    /// Full classification. `variance` is the luma variance of the region's
    /// pixels when they have been sampled.
    pub fn classify(
        &self,
        region: &NormalizedBox,
        page: &PageGeometry,
        variance: Option<f64>,
    ) -> Verdict {
        let t = &self.thresholds;
        let w = (region.x1 - region.x0) * page.width;
        let h = (region.y1 - region.y0) * page.height;
        let short = w.min(h);
        let long = w.max(h);

        // Negated comparisons so NaN lands on the decorative side.
        if !(short >= t.min_side_px) || !(short / long >= t.min_aspect) {
            return Verdict::Separator;
        }
        let area_ratio = (w * h) / (page.width * page.height);
        if !(area_ratio >= t.min_area_ratio) {
            return Verdict::TooSmall;
        }
        let touches_margin = region.x0 <= t.margin_epsilon
            || region.y0 <= t.margin_epsilon
            || region.x1 >= 1.0 - t.margin_epsilon
            || region.y1 >= 1.0 - t.margin_epsilon;
        match variance {
            Some(v) if touches_margin && !(v >= t.min_variance) => Verdict::Border,
            _ => Verdict::Figure,
        }
    }
}
