use futures::stream::{self, BoxStream, StreamExt};

use crate::fetcher::FetchError;
use crate::platform::{PageRequest, PlatformApi};
use crate::records::{decode, DecodeError, FetchedRecord};

#[derive(Debug)]
pub enum StopReason {
    /// The platform returned no further cursor.
    Exhausted,
    /// The page ceiling was reached with a cursor still outstanding.
    PageLimit,
    /// A page fetch failed after retries; earlier pages stand.
    FetchFailed(FetchError),
}

impl StopReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Exhausted => "exhausted",
            Self::PageLimit => "page_limit",
            Self::FetchFailed(_) => "fetch_failed",
        }
    }
}

#[derive(Debug)]
pub struct CollectedPage {
    /// 1-based.
    pub number: usize,
    pub records: Vec<FetchedRecord>,
    pub decode_errors: Vec<DecodeError>,
}

/// Items of [`PaginatedCollector::pages`]. The stream always ends with exactly
/// one `Stopped`.
#[derive(Debug)]
pub enum PageEvent {
    Page(CollectedPage),
    Stopped(StopReason),
}

#[derive(Debug)]
pub struct Collected {
    pub records: Vec<FetchedRecord>,
    pub pages_fetched: usize,
    pub decode_errors: Vec<DecodeError>,
    pub stop: StopReason,
}

enum Cursor {
    Fetch { request: PageRequest, fetched: usize },
    Exhausted,
    Done,
}

/// Walks a cursor-paginated list endpoint up to a page ceiling.
pub struct PaginatedCollector<'a> {
    api: &'a dyn PlatformApi,
    credential: &'a str,
    max_pages: usize,
}

impl<'a> PaginatedCollector<'a> {
    pub fn new(api: &'a dyn PlatformApi, credential: &'a str, max_pages: usize) -> Self {
        Self {
            api,
            credential,
            max_pages,
        }
    }

    /// Lazily fetch and decode pages starting at `first`.
    ///
    /// Records that fail to decode are reported on their page and skipped.
    pub fn pages(&self, first: PageRequest) -> BoxStream<'a, PageEvent> {
        let api = self.api;
        let credential = self.credential;
        let max_pages = self.max_pages;

        stream::unfold(
            Cursor::Fetch {
                request: first,
                fetched: 0,
            },
            move |state| async move {
                match state {
                    Cursor::Done => None,
                    Cursor::Exhausted => {
                        Some((PageEvent::Stopped(StopReason::Exhausted), Cursor::Done))
                    }
                    Cursor::Fetch { fetched, .. } if fetched >= max_pages => {
                        Some((PageEvent::Stopped(StopReason::PageLimit), Cursor::Done))
                    }
                    Cursor::Fetch { request, fetched } => {
                        match api.list_page(credential, &request).await {
                            Ok(page) => {
                                let number = fetched + 1;
                                let (records, decode_errors) =
                                    decode_page(&request, page.records);
                                if !decode_errors.is_empty() {
                                    tracing::warn!(
                                        entity_type = %request.entity_type,
                                        page = number,
                                        count = decode_errors.len(),
                                        "skipping undecodable records"
                                    );
                                }
                                let next = match page.next_cursor.filter(|c| !c.is_empty()) {
                                    Some(cursor) => Cursor::Fetch {
                                        request: request.next(cursor),
                                        fetched: number,
                                    },
                                    None => Cursor::Exhausted,
                                };
                                let page = CollectedPage {
                                    number,
                                    records,
                                    decode_errors,
                                };
                                Some((PageEvent::Page(page), next))
                            }
                            Err(e) => {
                                tracing::warn!(
                                    entity_type = %request.entity_type,
                                    page = fetched + 1,
                                    error = %e,
                                    "page fetch failed, stopping pagination"
                                );
                                Some((PageEvent::Stopped(StopReason::FetchFailed(e)), Cursor::Done))
                            }
                        }
                    }
                }
            },
        )
        .boxed()
    }

    /// Drain [`pages`](Self::pages) into memory.
    pub async fn collect(&self, first: PageRequest) -> Collected {
        let mut pages = self.pages(first);
        let mut collected = Collected {
            records: Vec::new(),
            pages_fetched: 0,
            decode_errors: Vec::new(),
            stop: StopReason::Exhausted,
        };

        while let Some(event) = pages.next().await {
            match event {
                PageEvent::Page(page) => {
                    collected.pages_fetched = page.number;
                    collected.records.extend(page.records);
                    collected.decode_errors.extend(page.decode_errors);
                }
                PageEvent::Stopped(reason) => collected.stop = reason,
            }
        }
        collected
    }
}

fn decode_page(
    request: &PageRequest,
    raw: Vec<serde_json::Value>,
) -> (Vec<FetchedRecord>, Vec<DecodeError>) {
    let mut records = Vec::with_capacity(raw.len());
    let mut errors = Vec::new();
    for value in raw {
        match decode(request.entity_type, value) {
            Ok(record) => records.push(record),
            Err(e) => errors.push(e),
        }
    }
    (records, errors)
}
