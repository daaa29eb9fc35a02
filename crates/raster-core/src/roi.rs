//! Region of interest types.
//!
//! [`Roi`] describes a rectangular (optionally volumetric) pixel region
//! together with a channel range. It is the unit of iteration, copying and
//! I/O requests throughout the workspace.
//!
//! # Coordinate convention
//!
//! All ranges are half-open intervals `[begin, end)`: begin included, end
//! excluded. Coordinates are signed - image data windows may start at
//! negative origins (overscan).
//!
//! ```text
//! (xbegin, ybegin) ──────► x
//!   │   ┌──────────┐
//!   │   │  region  │
//!   │   └──────────┘ (xend, yend) exclusive
//!   ▼ y
//! ```
//!
//! # Usage
//!
//! ```rust
//! use raster_core::Roi;
//!
//! // x=[100,200), y=[50,150), one z slice, channels [0,4)
//! let roi = Roi::new(100, 200, 50, 150, 0, 1, 0, 4);
//! assert_eq!(roi.width(), 100);
//! assert_eq!(roi.npixels(), 10_000);
//! assert!(roi.contains(150, 100, 0));
//! ```

/// Rectangular region with channel bounds.
///
/// The special value [`Roi::all`] stands for "the entire image" without
/// knowing its dimensions; operations that take a region treat it as
/// "use the image's own data window".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Roi {
    /// X begin (inclusive).
    pub xbegin: i32,
    /// X end (exclusive).
    pub xend: i32,
    /// Y begin (inclusive).
    pub ybegin: i32,
    /// Y end (exclusive).
    pub yend: i32,
    /// Z begin (inclusive, for volumetric images).
    pub zbegin: i32,
    /// Z end (exclusive).
    pub zend: i32,
    /// Channel begin (inclusive).
    pub chbegin: i32,
    /// Channel end (exclusive).
    pub chend: i32,
}

impl Default for Roi {
    fn default() -> Self {
        Self::all()
    }
}

impl Roi {
    /// Creates a region with all bounds specified.
    #[allow(clippy::too_many_arguments)]
    #[inline]
    pub const fn new(
        xbegin: i32,
        xend: i32,
        ybegin: i32,
        yend: i32,
        zbegin: i32,
        zend: i32,
        chbegin: i32,
        chend: i32,
    ) -> Self {
        Self {
            xbegin,
            xend,
            ybegin,
            yend,
            zbegin,
            zend,
            chbegin,
            chend,
        }
    }

    /// Creates a 2D region (one z slice, unbounded channels).
    #[inline]
    pub const fn new_2d(xbegin: i32, xend: i32, ybegin: i32, yend: i32) -> Self {
        Self::new(xbegin, xend, ybegin, yend, 0, 1, 0, i32::MAX)
    }

    /// Creates a 2D region at origin (0, 0).
    #[inline]
    pub const fn from_size(width: i32, height: i32) -> Self {
        Self::new_2d(0, width, 0, height)
    }

    /// The "everything" sentinel: undefined bounds matching any image.
    #[inline]
    pub const fn all() -> Self {
        Self {
            xbegin: i32::MIN,
            xend: i32::MAX,
            ybegin: i32::MIN,
            yend: i32::MAX,
            zbegin: i32::MIN,
            zend: i32::MAX,
            chbegin: 0,
            chend: i32::MAX,
        }
    }

    /// Returns true if this is the "everything" sentinel.
    #[inline]
    pub const fn is_all(&self) -> bool {
        self.xbegin == i32::MIN && self.xend == i32::MAX
    }

    /// Returns true if the region has concrete, finite bounds.
    #[inline]
    pub const fn defined(&self) -> bool {
        !self.is_all()
    }

    /// Width (`xend - xbegin`).
    #[inline]
    pub const fn width(&self) -> i32 {
        self.xend - self.xbegin
    }

    /// Height (`yend - ybegin`).
    #[inline]
    pub const fn height(&self) -> i32 {
        self.yend - self.ybegin
    }

    /// Depth (`zend - zbegin`).
    #[inline]
    pub const fn depth(&self) -> i32 {
        self.zend - self.zbegin
    }

    /// Number of channels (`chend - chbegin`).
    #[inline]
    pub const fn nchannels(&self) -> i32 {
        self.chend - self.chbegin
    }

    /// Total number of pixels; 0 for the "everything" sentinel or any
    /// degenerate region.
    #[inline]
    pub fn npixels(&self) -> u64 {
        if self.is_all() || self.width() <= 0 || self.height() <= 0 || self.depth() <= 0 {
            0
        } else {
            self.width() as u64 * self.height() as u64 * self.depth() as u64
        }
    }

    /// Returns true if (x, y, z) lies inside the region.
    #[inline]
    pub const fn contains(&self, x: i32, y: i32, z: i32) -> bool {
        x >= self.xbegin
            && x < self.xend
            && y >= self.ybegin
            && y < self.yend
            && z >= self.zbegin
            && z < self.zend
    }

    /// Returns true if (x, y, z, ch) lies inside the region, channel included.
    #[inline]
    pub const fn contains_channel(&self, x: i32, y: i32, z: i32, ch: i32) -> bool {
        self.contains(x, y, z) && ch >= self.chbegin && ch < self.chend
    }

    /// Returns true if `other` lies entirely inside this region.
    #[inline]
    pub const fn contains_roi(&self, other: &Roi) -> bool {
        other.xbegin >= self.xbegin
            && other.xend <= self.xend
            && other.ybegin >= self.ybegin
            && other.yend <= self.yend
            && other.zbegin >= self.zbegin
            && other.zend <= self.zend
            && other.chbegin >= self.chbegin
            && other.chend <= self.chend
    }

    /// Bounding region containing both operands.
    pub fn union(&self, other: &Roi) -> Roi {
        if self.is_all() || other.is_all() {
            return Roi::all();
        }
        Roi {
            xbegin: self.xbegin.min(other.xbegin),
            xend: self.xend.max(other.xend),
            ybegin: self.ybegin.min(other.ybegin),
            yend: self.yend.max(other.yend),
            zbegin: self.zbegin.min(other.zbegin),
            zend: self.zend.max(other.zend),
            chbegin: self.chbegin.min(other.chbegin),
            chend: self.chend.max(other.chend),
        }
    }

    /// Intersection of two regions, or `None` if they do not overlap.
    pub fn intersection(&self, other: &Roi) -> Option<Roi> {
        if self.is_all() {
            return Some(*other);
        }
        if other.is_all() {
            return Some(*self);
        }
        let r = Roi {
            xbegin: self.xbegin.max(other.xbegin),
            xend: self.xend.min(other.xend),
            ybegin: self.ybegin.max(other.ybegin),
            yend: self.yend.min(other.yend),
            zbegin: self.zbegin.max(other.zbegin),
            zend: self.zend.min(other.zend),
            chbegin: self.chbegin.max(other.chbegin),
            chend: self.chend.min(other.chend),
        };
        if r.width() > 0 && r.height() > 0 && r.depth() > 0 && r.nchannels() > 0 {
            Some(r)
        } else {
            None
        }
    }

    /// Copy of this region with a different channel range.
    #[inline]
    pub const fn with_channels(&self, chbegin: i32, chend: i32) -> Roi {
        let mut r = *self;
        r.chbegin = chbegin;
        r.chend = chend;
        r
    }
}

impl std::fmt::Display for Roi {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_all() {
            return write!(f, "Roi::all");
        }
        write!(
            f,
            "Roi(x[{},{}) y[{},{}) z[{},{}) ch[{},{}))",
            self.xbegin,
            self.xend,
            self.ybegin,
            self.yend,
            self.zbegin,
            self.zend,
            self.chbegin,
            self.chend
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dimensions() {
        let roi = Roi::new(100, 200, 50, 150, 0, 1, 0, 4);
        assert_eq!(roi.width(), 100);
        assert_eq!(roi.height(), 100);
        assert_eq!(roi.depth(), 1);
        assert_eq!(roi.nchannels(), 4);
        assert_eq!(roi.npixels(), 10_000);
    }

    #[test]
    fn test_all_sentinel() {
        let roi = Roi::all();
        assert!(roi.is_all());
        assert!(!roi.defined());
        assert_eq!(roi.npixels(), 0);

        let concrete = Roi::from_size(8, 8);
        assert!(concrete.defined());
        assert_eq!(roi.intersection(&concrete), Some(concrete));
    }

    #[test]
    fn test_contains() {
        let roi = Roi::new_2d(-5, 5, -5, 5);
        assert!(roi.contains(-5, -5, 0));
        assert!(roi.contains(4, 4, 0));
        assert!(!roi.contains(5, 0, 0));
        assert!(!roi.contains(0, 0, 1));
        assert!(roi.contains_channel(0, 0, 0, 3));
    }

    #[test]
    fn test_union_intersection() {
        let a = Roi::new_2d(0, 10, 0, 10);
        let b = Roi::new_2d(5, 15, 5, 15);

        let u = a.union(&b);
        assert_eq!((u.xbegin, u.xend, u.ybegin, u.yend), (0, 15, 0, 15));

        let i = a.intersection(&b).unwrap();
        assert_eq!((i.xbegin, i.xend, i.ybegin, i.yend), (5, 10, 5, 10));

        let c = Roi::new_2d(20, 30, 20, 30);
        assert_eq!(a.intersection(&c), None);
    }

    #[test]
    fn test_with_channels() {
        let roi = Roi::from_size(4, 4).with_channels(1, 3);
        assert_eq!(roi.chbegin, 1);
        assert_eq!(roi.chend, 3);
        assert_eq!(roi.nchannels(), 2);
    }
}
