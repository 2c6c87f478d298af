//! Property tests for page windows.
//!
//! Walking every page of a result set must visit each row exactly once, and
//! the page count must agree with the window arithmetic.

#![allow(clippy::unwrap_used)]

use courier_core::{models::MAX_PAGE_SIZE, PageRequest};
use proptest::prelude::*;

proptest! {
    #[test]
    fn pages_cover_every_row_once(total in 0i64..2_000, page_size in 1u32..=MAX_PAGE_SIZE) {
        let first = PageRequest::new(1, page_size).unwrap();
        let pages = first.total_pages(total);

        let mut covered = 0i64;
        for page in 1..=pages {
            let request = PageRequest::new(u32::try_from(page).unwrap(), page_size).unwrap();
            prop_assert_eq!(request.offset(), covered);
            let rows = request.limit().min(total - request.offset());
            prop_assert!(rows > 0);
            covered += rows;
        }
        prop_assert_eq!(covered, total);
    }

    #[test]
    fn out_of_range_windows_are_rejected(page_size in (MAX_PAGE_SIZE + 1)..u32::MAX) {
        prop_assert!(PageRequest::new(1, page_size).is_err());
        prop_assert!(PageRequest::new(0, 10).is_err());
    }
}

#[test]
fn empty_result_has_no_pages() {
    assert_eq!(PageRequest::default().total_pages(0), 0);
    assert_eq!(PageRequest::default().total_pages(-3), 0);
}
