//! Page identity for Kestrel storage files.

use crate::error::{KestrelError, Result};
use serde::{Deserialize, Serialize};

/// Default page size in bytes (4 KB).
pub const DEFAULT_PAGE_SIZE: usize = 4 * 1024;

/// Smallest supported page size.
pub const MIN_PAGE_SIZE: usize = 512;

/// Largest supported page size. Index page item counts are stored as u16.
pub const MAX_PAGE_SIZE: usize = 64 * 1024;

/// Identifier of a page: its byte offset in the storage file.
///
/// Offset 0 is the storage header page and never holds index data, so
/// `PageId::NULL` doubles as "no page" (for example the root of an empty tree).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
pub struct PageId(u64);

impl PageId {
    /// The null page id.
    pub const NULL: PageId = PageId(0);

    /// Creates a PageId from a raw file offset.
    #[inline]
    pub const fn from_offset(offset: u64) -> Self {
        Self(offset)
    }

    /// Creates a PageId from a page number.
    #[inline]
    pub const fn from_page_num(page_num: u64, page_size: usize) -> Self {
        Self(page_num * page_size as u64)
    }

    /// Returns the byte offset of this page in the file.
    #[inline]
    pub const fn offset(&self) -> u64 {
        self.0
    }

    /// Returns the page number of this page.
    #[inline]
    pub const fn page_num(&self, page_size: usize) -> u64 {
        self.0 / page_size as u64
    }

    /// Returns true if this is the null page id.
    #[inline]
    pub const fn is_null(&self) -> bool {
        self.0 == 0
    }

    /// Checks that the offset is a multiple of the page size.
    pub fn check_aligned(&self, page_size: usize) -> Result<()> {
        if self.0 % page_size as u64 != 0 {
            return Err(KestrelError::UnalignedPage {
                offset: self.0,
                page_size,
            });
        }
        Ok(())
    }
}

impl std::fmt::Display for PageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "@{}", self.0)
    }
}

/// Validates a page size: a power of two between MIN_PAGE_SIZE and MAX_PAGE_SIZE.
pub fn validate_page_size(page_size: usize) -> Result<()> {
    if !page_size.is_power_of_two() || !(MIN_PAGE_SIZE..=MAX_PAGE_SIZE).contains(&page_size) {
        return Err(KestrelError::ConfigError(format!(
            "page size {} must be a power of two in {}..={}",
            page_size, MIN_PAGE_SIZE, MAX_PAGE_SIZE
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_id_offsets() {
        let page_id = PageId::from_page_num(3, 4096);
        assert_eq!(page_id.offset(), 3 * 4096);
        assert_eq!(page_id.page_num(4096), 3);
        assert_eq!(PageId::from_offset(8192), PageId::from_page_num(2, 4096));
    }

    #[test]
    fn test_page_id_null() {
        assert!(PageId::NULL.is_null());
        assert!(PageId::default().is_null());
        assert!(!PageId::from_page_num(1, 512).is_null());
    }

    #[test]
    fn test_page_id_alignment() {
        assert!(PageId::from_offset(8192).check_aligned(4096).is_ok());
        let err = PageId::from_offset(100).check_aligned(4096).unwrap_err();
        assert!(matches!(
            err,
            KestrelError::UnalignedPage {
                offset: 100,
                page_size: 4096
            }
        ));
    }

    #[test]
    fn test_page_id_ordering() {
        let mut ids = vec![
            PageId::from_offset(8192),
            PageId::from_offset(0),
            PageId::from_offset(4096),
        ];
        ids.sort();
        assert_eq!(
            ids,
            vec![
                PageId::from_offset(0),
                PageId::from_offset(4096),
                PageId::from_offset(8192)
            ]
        );
    }

    #[test]
    fn test_page_id_display() {
        assert_eq!(PageId::from_offset(4096).to_string(), "@4096");
    }

    #[test]
    fn test_validate_page_size() {
        assert!(validate_page_size(DEFAULT_PAGE_SIZE).is_ok());
        assert!(validate_page_size(MIN_PAGE_SIZE).is_ok());
        assert!(validate_page_size(MAX_PAGE_SIZE).is_ok());
        assert!(validate_page_size(3000).is_err());
        assert!(validate_page_size(256).is_err());
        assert!(validate_page_size(128 * 1024).is_err());
    }

    #[test]
    fn test_page_id_serde_roundtrip() {
        let original = PageId::from_page_num(10, 4096);
        let serialized = serde_json::to_string(&original).unwrap();
        let deserialized: PageId = serde_json::from_str(&serialized).unwrap();
        assert_eq!(original, deserialized);
    }
}
