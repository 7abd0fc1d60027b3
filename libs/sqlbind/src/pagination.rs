//! Page-at-a-time queries through a routing session.

use sea_orm::{EntityTrait, QuerySelect, Select};

use crate::session::RoutingSession;
use crate::{DbError, Result};

const DEFAULT_PER_PAGE: u64 = 20;
const DEFAULT_MAX_PER_PAGE: u64 = 100;

/// Requested page and paging rules.
///
/// `page` and `per_page` are signed so out-of-range input from a request can
/// be reported (or corrected) rather than rejected at parse time.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PageRequest {
    pub page: i64,
    pub per_page: i64,
    /// Upper bound applied to `per_page`; `None` disables it.
    pub max_per_page: Option<u64>,
    /// Fail with `NotFound` instead of correcting invalid input or an empty page.
    pub error_out: bool,
    /// Run a count query to fill `total`.
    pub count: bool,
}

impl Default for PageRequest {
    fn default() -> Self {
        Self {
            page: 1,
            per_page: 20,
            max_per_page: Some(DEFAULT_MAX_PER_PAGE),
            error_out: true,
            count: true,
        }
    }
}

impl PageRequest {
    #[must_use]
    pub fn page(page: i64, per_page: i64) -> Self {
        Self {
            page,
            per_page,
            ..Self::default()
        }
    }

    fn normalized(&self) -> Result<(u64, u64)> {
        let mut per_page = self.per_page;
        if let Some(max) = self.max_per_page {
            per_page = per_page.min(i64::try_from(max).unwrap_or(i64::MAX));
        }
        let page = match u64::try_from(self.page) {
            Ok(page) if page >= 1 => page,
            _ if self.error_out => return Err(DbError::NotFound(None)),
            _ => 1,
        };
        let per_page = match u64::try_from(per_page) {
            Ok(per_page) if per_page >= 1 => per_page,
            _ if self.error_out => return Err(DbError::NotFound(None)),
            _ => DEFAULT_PER_PAGE,
        };
        Ok((page, per_page))
    }
}

/// One page of `E` rows plus the numbers a pagination widget needs.
#[derive(Debug)]
pub struct Paginator<E: EntityTrait> {
    select: Select<E>,
    pub page: u64,
    pub per_page: u64,
    pub max_per_page: Option<u64>,
    pub items: Vec<E::Model>,
    pub total: Option<u64>,
}

impl<E> Paginator<E>
where
    E: EntityTrait,
    E::Model: Sync,
{
    /// Fetch the requested page of `select`.
    ///
    /// # Errors
    /// Returns `DbError::NotFound` with `error_out` for an invalid page or
    /// per-page value, or for an empty page other than the first; routing
    /// and driver errors otherwise.
    pub async fn new(
        session: &RoutingSession,
        select: Select<E>,
        request: PageRequest,
    ) -> Result<Self> {
        let (page, per_page) = request.normalized()?;
        // pages past the addressable range are empty
        let items = match page_offset(page, per_page) {
            Some(offset) => {
                session
                    .all(select.clone().limit(per_page).offset(offset))
                    .await?
            }
            None => Vec::new(),
        };
        if items.is_empty() && page != 1 && request.error_out {
            return Err(DbError::NotFound(None));
        }
        let total = if request.count {
            Some(session.scalar_count(select.clone()).await?)
        } else {
            None
        };
        Ok(Self {
            select,
            page,
            per_page,
            max_per_page: request.max_per_page,
            items,
            total,
        })
    }

    /// Number of the first item on the page (from 1), or 0 without items.
    #[must_use]
    pub fn first(&self) -> u64 {
        if self.items.is_empty() {
            0
        } else {
            page_offset(self.page, self.per_page).map_or(0, |offset| offset + 1)
        }
    }

    /// Number of the last item on the page, inclusive, or 0 without items.
    #[must_use]
    pub fn last(&self) -> u64 {
        let first = self.first();
        let count = u64::try_from(self.items.len()).unwrap_or(u64::MAX);
        first.max(first.saturating_add(count).saturating_sub(1))
    }

    #[must_use]
    pub fn pages(&self) -> u64 {
        match self.total {
            None | Some(0) => 0,
            Some(total) => total.div_ceil(self.per_page),
        }
    }

    #[must_use]
    pub fn has_prev(&self) -> bool {
        self.page > 1
    }

    #[must_use]
    pub fn prev_num(&self) -> Option<u64> {
        self.has_prev().then(|| self.page - 1)
    }

    #[must_use]
    pub fn has_next(&self) -> bool {
        self.page < self.pages()
    }

    #[must_use]
    pub fn next_num(&self) -> Option<u64> {
        self.has_next().then(|| self.page + 1)
    }

    async fn sibling(&self, session: &RoutingSession, page: u64, error_out: bool) -> Result<Self> {
        let request = PageRequest {
            page: i64::try_from(page).unwrap_or(i64::MAX),
            per_page: i64::try_from(self.per_page).unwrap_or(i64::MAX),
            max_per_page: self.max_per_page,
            error_out,
            count: false,
        };
        let mut sibling = Self::new(session, self.select.clone(), request).await?;
        sibling.total = self.total;
        Ok(sibling)
    }

    /// The previous page, without counting again.
    ///
    /// # Errors
    /// See [`Paginator::new`].
    pub async fn prev(&self, session: &RoutingSession, error_out: bool) -> Result<Self> {
        self.sibling(session, self.page.saturating_sub(1), error_out).await
    }

    /// The next page, without counting again.
    ///
    /// # Errors
    /// See [`Paginator::new`].
    pub async fn next(&self, session: &RoutingSession, error_out: bool) -> Result<Self> {
        self.sibling(session, self.page + 1, error_out).await
    }

    /// Page numbers for a widget with the default edges (2, 2, 4, 2).
    #[must_use]
    pub fn iter_pages(&self) -> Vec<Option<u64>> {
        self.iter_pages_with(2, 2, 4, 2)
    }

    /// Page numbers for a widget; `None` marks skipped pages.
    ///
    /// With 20 pages on page 7 the defaults give
    /// `1, 2, None, 5, 6, 7, 8, 9, 10, 11, None, 19, 20`.
    #[must_use]
    pub fn iter_pages_with(
        &self,
        left_edge: u64,
        left_current: u64,
        right_current: u64,
        right_edge: u64,
    ) -> Vec<Option<u64>> {
        page_numbers(self.page, self.pages(), left_edge, left_current, right_current, right_edge)
    }
}

/// Row offset of `page`, or `None` when it doesn't fit a query's signed offset.
fn page_offset(page: u64, per_page: u64) -> Option<u64> {
    page.checked_sub(1)?
        .checked_mul(per_page)
        .filter(|offset| i64::try_from(*offset).is_ok())
}

fn page_numbers(
    page: u64,
    pages: u64,
    left_edge: u64,
    left_current: u64,
    right_current: u64,
    right_edge: u64,
) -> Vec<Option<u64>> {
    let pages_end = pages + 1;
    let mut out = Vec::new();
    if pages_end == 1 {
        return out;
    }
    let left_end = (1 + left_edge).min(pages_end);
    out.extend((1..left_end).map(Some));
    if left_end == pages_end {
        return out;
    }
    let mid_start = left_end.max(page.saturating_sub(left_current));
    let mid_end = (page + right_current + 1).min(pages_end);
    if mid_start > left_end {
        out.push(None);
    }
    out.extend((mid_start..mid_end).map(Some));
    if mid_end == pages_end {
        return out;
    }
    let right_start = mid_end.max(pages_end.saturating_sub(right_edge));
    if right_start > mid_end {
        out.push(None);
    }
    out.extend((right_start..pages_end).map(Some));
    out
}
