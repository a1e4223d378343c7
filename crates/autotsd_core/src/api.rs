use std::collections::{BTreeSet, VecDeque};

use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Document {
    pub id: String,
    pub title: String,
    pub version: u64,
    pub space_key: Option<String>,
    pub markup: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DocumentRef {
    pub id: String,
    pub title: String,
    pub web_url: Option<String>,
}

#[derive(Debug, Clone)]
pub struct DocumentUpdate<'a> {
    pub id: &'a str,
    pub title: &'a str,
    pub markup: &'a str,
    /// Version read at fetch time. The write targets `expected_version + 1`.
    pub expected_version: u64,
}

#[derive(Debug, Clone, Default)]
pub struct SearchPage {
    pub results: Vec<DocumentRef>,
    /// Opaque cursor for the next page; `None` once the query is exhausted.
    pub next: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ApiError {
    #[error("not found: {0}")]
    NotFound(String),
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    #[error("version conflict writing over version {expected}: {detail}")]
    VersionConflict { expected: u64, detail: String },
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("unexpected response: {0}")]
    Decode(String),
}

/// Remote content service. Calls may run concurrently from scoped threads.
pub trait ContentApi: Sync {
    fn fetch_document(&self, id: &str) -> Result<Document, ApiError>;
    fn fetch_labels(&self, id: &str) -> Result<BTreeSet<String>, ApiError>;
    /// Must be a no-op for an empty set.
    fn add_labels(&self, id: &str, labels: &BTreeSet<String>) -> Result<(), ApiError>;
    fn remove_label(&self, id: &str, label: &str) -> Result<(), ApiError>;
    /// Returns the new version number.
    fn update_document(&self, update: &DocumentUpdate<'_>) -> Result<u64, ApiError>;
    fn search_page(&self, query: &str, cursor: Option<&str>) -> Result<SearchPage, ApiError>;
    fn request_count(&self) -> usize;
}

/// Lazy walk over every result of a search, following cursors to exhaustion.
///
/// The walk ends after the first error; resuming mid-stream is not supported, so a
/// caller that wants to retry starts a new walk.
pub struct SearchWalk<'a, A: ContentApi + ?Sized> {
    api: &'a A,
    query: String,
    buffer: VecDeque<DocumentRef>,
    cursor: Option<String>,
    started: bool,
    finished: bool,
}

impl<'a, A: ContentApi + ?Sized> SearchWalk<'a, A> {
    pub fn new(api: &'a A, query: &str) -> Self {
        Self {
            api,
            query: query.to_string(),
            buffer: VecDeque::new(),
            cursor: None,
            started: false,
            finished: false,
        }
    }
}

impl<A: ContentApi + ?Sized> Iterator for SearchWalk<'_, A> {
    type Item = Result<DocumentRef, ApiError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(item) = self.buffer.pop_front() {
                return Some(Ok(item));
            }
            if self.finished || (self.started && self.cursor.is_none()) {
                self.finished = true;
                return None;
            }
            match self.api.search_page(&self.query, self.cursor.as_deref()) {
                Ok(page) => {
                    self.started = true;
                    self.buffer.extend(page.results);
                    // A cursor that does not advance would loop forever.
                    if page.next.is_some() && page.next == self.cursor {
                        self.cursor = None;
                    } else {
                        self.cursor = page.next;
                    }
                }
                Err(error) => {
                    self.finished = true;
                    return Some(Err(error));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;
    use std::sync::Mutex;

    use super::{
        ApiError, ContentApi, Document, DocumentRef, DocumentUpdate, SearchPage, SearchWalk,
    };

    struct PagedSearch {
        pages: Vec<Result<SearchPage, ApiError>>,
        cursors_seen: Mutex<Vec<Option<String>>>,
    }

    fn doc_ref(id: &str) -> DocumentRef {
        DocumentRef {
            id: id.to_string(),
            title: format!("Page {id}"),
            web_url: None,
        }
    }

    impl ContentApi for PagedSearch {
        fn fetch_document(&self, id: &str) -> Result<Document, ApiError> {
            Err(ApiError::NotFound(id.to_string()))
        }

        fn fetch_labels(&self, _id: &str) -> Result<BTreeSet<String>, ApiError> {
            Ok(BTreeSet::new())
        }

        fn add_labels(&self, _id: &str, _labels: &BTreeSet<String>) -> Result<(), ApiError> {
            Ok(())
        }

        fn remove_label(&self, _id: &str, _label: &str) -> Result<(), ApiError> {
            Ok(())
        }

        fn update_document(&self, update: &DocumentUpdate<'_>) -> Result<u64, ApiError> {
            Ok(update.expected_version + 1)
        }

        fn search_page(&self, _query: &str, cursor: Option<&str>) -> Result<SearchPage, ApiError> {
            let mut seen = self.cursors_seen.lock().expect("lock");
            seen.push(cursor.map(ToString::to_string));
            let index = seen.len() - 1;
            self.pages
                .get(index)
                .cloned()
                .unwrap_or_else(|| Ok(SearchPage::default()))
        }

        fn request_count(&self) -> usize {
            self.cursors_seen.lock().expect("lock").len()
        }
    }

    #[test]
    fn walk_follows_cursors_to_exhaustion() {
        let api = PagedSearch {
            pages: vec![
                Ok(SearchPage {
                    results: vec![doc_ref("1"), doc_ref("2")],
                    next: Some("/wiki/rest/api/content/search?cursor=a".to_string()),
                }),
                Ok(SearchPage {
                    results: Vec::new(),
                    next: Some("/wiki/rest/api/content/search?cursor=b".to_string()),
                }),
                Ok(SearchPage {
                    results: vec![doc_ref("3")],
                    next: None,
                }),
            ],
            cursors_seen: Mutex::new(Vec::new()),
        };

        let ids = SearchWalk::new(&api, "type=page")
            .map(|item| item.expect("page").id)
            .collect::<Vec<_>>();
        assert_eq!(ids, vec!["1", "2", "3"]);
        assert_eq!(
            *api.cursors_seen.lock().expect("lock"),
            vec![
                None,
                Some("/wiki/rest/api/content/search?cursor=a".to_string()),
                Some("/wiki/rest/api/content/search?cursor=b".to_string()),
            ]
        );
    }

    #[test]
    fn walk_stops_after_first_error() {
        let api = PagedSearch {
            pages: vec![
                Ok(SearchPage {
                    results: vec![doc_ref("1")],
                    next: Some("c1".to_string()),
                }),
                Err(ApiError::Transport("connection reset".to_string())),
            ],
            cursors_seen: Mutex::new(Vec::new()),
        };

        let mut walk = SearchWalk::new(&api, "q");
        assert!(matches!(walk.next(), Some(Ok(_))));
        assert!(matches!(walk.next(), Some(Err(ApiError::Transport(_)))));
        assert!(walk.next().is_none());
        assert_eq!(api.request_count(), 2);
    }

    #[test]
    fn walk_stops_on_repeated_cursor() {
        let api = PagedSearch {
            pages: vec![
                Ok(SearchPage {
                    results: vec![doc_ref("1")],
                    next: Some("same".to_string()),
                }),
                Ok(SearchPage {
                    results: vec![doc_ref("2")],
                    next: Some("same".to_string()),
                }),
            ],
            cursors_seen: Mutex::new(Vec::new()),
        };
        assert_eq!(SearchWalk::new(&api, "q").count(), 2);
    }
}
