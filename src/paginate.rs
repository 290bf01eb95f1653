use serde::{Deserialize, Serialize};

pub const DEFAULT_PAGE_SIZE: usize = 10;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    /// 1-based page actually served after clamping.
    pub page: usize,
    pub total_pages: usize,
    pub total_items: usize,
}

/// Total pages for `len` rows; never less than 1 so an empty table still
/// reads "page 1 of 1".
pub fn total_pages(len: usize, page_size: usize) -> usize {
    len.div_ceil(page_size.max(1)).max(1)
}

/// Slices out one page, clamping `page` into `[1, total_pages]`.
pub fn paginate<T: Clone>(rows: &[T], page_size: usize, page: usize) -> Page<T> {
    let page_size = page_size.max(1);
    let total = total_pages(rows.len(), page_size);
    let page = page.clamp(1, total);
    let start = ((page - 1) * page_size).min(rows.len());
    let end = (start + page_size).min(rows.len());
    Page {
        items: rows[start..end].to_vec(),
        page,
        total_pages: total,
        total_items: rows.len(),
    }
}

/// Case-insensitive substring search over each row's JSON form.
pub fn filter_rows<T: Serialize + Clone>(rows: &[T], term: &str) -> Vec<T> {
    if term.is_empty() {
        return rows.to_vec();
    }
    let needle = term.to_lowercase();
    rows.iter()
        .filter(|row| match serde_json::to_string(row) {
            Ok(s) => s.to_lowercase().contains(&needle),
            Err(_) => false,
        })
        .cloned()
        .collect()
}

/// Search box plus pager for one table or card.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableState {
    pub filter: String,
    pub page: usize,
    pub page_size: usize,
}

impl Default for TableState {
    fn default() -> Self {
        Self::new(DEFAULT_PAGE_SIZE)
    }
}

impl TableState {
    pub fn new(page_size: usize) -> Self {
        Self {
            filter: String::new(),
            page: 1,
            page_size: page_size.max(1),
        }
    }

    /// Changing the search text always jumps back to the first page.
    pub fn set_filter(&mut self, filter: &str) {
        if self.filter != filter {
            self.filter = filter.to_string();
            self.page = 1;
        }
    }

    pub fn set_page(&mut self, page: usize) {
        self.page = page.max(1);
    }

    /// Filters, then paginates. The stored page follows the clamp so that
    /// shrinking data does not leave the pager past the end.
    pub fn apply<T: Serialize + Clone>(&mut self, rows: &[T]) -> Page<T> {
        let filtered = filter_rows(rows, &self.filter);
        let page = paginate(&filtered, self.page_size, self.page);
        self.page = page.page;
        page
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_third_page_of_25() {
        let rows: Vec<u32> = (1..=25).collect();
        let page = paginate(&rows, 10, 3);
        assert_eq!(page.items, (21..=25).collect::<Vec<_>>());
        assert_eq!(page.total_pages, 3);
        assert_eq!(page.page, 3);
    }

    #[test]
    fn test_empty_input_is_one_page() {
        let rows: Vec<u32> = vec![];
        let page = paginate(&rows, 10, 5);
        assert!(page.items.is_empty());
        assert_eq!(page.total_pages, 1);
        assert_eq!(page.page, 1);
    }

    #[test]
    fn test_page_clamped() {
        let rows: Vec<u32> = (1..=5).collect();
        assert_eq!(paginate(&rows, 2, 0).items, vec![1, 2]);
        assert_eq!(paginate(&rows, 2, 99).items, vec![5]);
        assert_eq!(paginate(&rows, 0, 2).items, vec![2]);
    }

    #[test]
    fn test_total_pages() {
        assert_eq!(total_pages(0, 10), 1);
        assert_eq!(total_pages(10, 10), 1);
        assert_eq!(total_pages(11, 10), 2);
    }

    #[test]
    fn test_filter_is_case_insensitive_over_serialized_rows() {
        let rows = vec![
            json!({"symbol": "AAPL", "price": 190}),
            json!({"symbol": "MSFT", "price": 410}),
            json!({"symbol": "aapl.ne", "price": 12}),
        ];
        assert_eq!(filter_rows(&rows, "aapl").len(), 2);
        assert_eq!(filter_rows(&rows, "410").len(), 1);
        // Keys are part of the serialized text too.
        assert_eq!(filter_rows(&rows, "PRICE").len(), 3);
        assert_eq!(filter_rows(&rows, "").len(), 3);
    }

    #[test]
    fn test_filter_change_resets_page() {
        let rows: Vec<String> = (0..30).map(|i| format!("row-{i}")).collect();
        let mut state = TableState::new(10);
        state.set_page(3);
        assert_eq!(state.apply(&rows).page, 3);

        state.set_filter("row-1");
        assert_eq!(state.page, 1);
        let page = state.apply(&rows);
        // row-1, row-10..row-19
        assert_eq!(page.total_items, 11);
        assert_eq!(page.items.len(), 10);

        // Same text again does not move the pager.
        state.set_page(2);
        state.set_filter("row-1");
        assert_eq!(state.page, 2);
    }

    #[test]
    fn test_apply_follows_clamp() {
        let rows: Vec<u32> = (0..5).collect();
        let mut state = TableState::new(10);
        state.set_page(4);
        state.apply(&rows);
        assert_eq!(state.page, 1);
    }
}
