use std::sync::Arc;

use anyhow::Result;
use tokio::select;
use tokio::sync::mpsc::Sender;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::error::StorageError;
use crate::events::{FilterMode, Page, PhotoRef};
use crate::index::{IndexCursor, PhotoIndex};

/// Reads fixed-size pages from one open cursor.
///
/// The reader remembers where the cursor stands, so reading the page that
/// starts where the previous one ended never repositions the cursor. A row
/// peeked to compute `has_more` is held back and served first on the next page.
pub struct PageReader {
    cursor: Box<dyn IndexCursor>,
    batch_size: usize,
    position: usize,
    lookahead: Option<PhotoRef>,
}

impl PageReader {
    pub fn new(cursor: Box<dyn IndexCursor>, batch_size: usize) -> Self {
        Self {
            cursor,
            batch_size: batch_size.max(1),
            position: 0,
            lookahead: None,
        }
    }

    /// Read up to `batch_size` rows starting at row `start`.
    ///
    /// `has_more` is true only when the page is full and a further row exists.
    ///
    /// # Errors
    /// Any cursor failure aborts the page; no partial page is returned.
    pub fn read_page(&mut self, start: usize) -> Result<Page, StorageError> {
        let rows = self.cursor.row_count();
        if start >= rows {
            self.lookahead = None;
            self.position = rows;
            return Ok(Page {
                items: Vec::new(),
                has_more: false,
                next_cursor: start,
            });
        }

        if start != self.position {
            debug!(from = self.position, to = start, "repositioning cursor");
            self.lookahead = None;
            self.cursor.seek(start)?;
            self.position = start;
        }

        let mut items = Vec::with_capacity(self.batch_size);
        while items.len() < self.batch_size {
            let next = match self.lookahead.take() {
                Some(row) => Some(row),
                None => self.cursor.next_row()?,
            };
            match next {
                Some(row) => {
                    items.push(row);
                    self.position += 1;
                }
                None => break,
            }
        }

        let has_more = if items.len() == self.batch_size {
            self.lookahead = self.cursor.next_row()?;
            self.lookahead.is_some()
        } else {
            false
        };

        Ok(Page {
            next_cursor: start + items.len(),
            items,
            has_more,
        })
    }
}

/// Page producer: opens the index and emits pages until the index runs dry.
///
/// The channel is expected to be small (the pipeline uses capacity 1), so the
/// producer only reads the next page once the previous one has been taken.
/// A storage failure is sent as the last message.
#[instrument(skip(index, to_pipeline, cancel))]
pub async fn run(
    index: Arc<dyn PhotoIndex>,
    filter: FilterMode,
    batch_size: usize,
    start: usize,
    to_pipeline: Sender<Result<Page, StorageError>>,
    cancel: CancellationToken,
) -> Result<()> {
    let opened = {
        let index = Arc::clone(&index);
        tokio::task::spawn_blocking(move || index.open(filter)).await
    };
    let cursor = match opened {
        Ok(Ok(cursor)) => cursor,
        Ok(Err(err)) => {
            warn!("photo index unavailable: {err}");
            let _ = to_pipeline.send(Err(err)).await;
            return Ok(());
        }
        Err(join_err) => {
            let err = StorageError::Unavailable(join_err.to_string());
            let _ = to_pipeline.send(Err(err)).await;
            return Ok(());
        }
    };

    let mut reader = Some(PageReader::new(cursor, batch_size));
    let mut next = start;
    let mut pages = 0usize;

    loop {
        let Some(mut current) = reader.take() else {
            break;
        };
        let read = tokio::task::spawn_blocking(move || {
            let page = current.read_page(next);
            (current, page)
        });

        let (returned, page) = select! {
            _ = cancel.cancelled() => {
                debug!("cancel received; exiting page producer");
                break;
            }
            joined = read => match joined {
                Ok(pair) => pair,
                Err(join_err) => {
                    let err = StorageError::Unavailable(join_err.to_string());
                    let _ = to_pipeline.send(Err(err)).await;
                    break;
                }
            }
        };
        reader = Some(returned);

        match page {
            Ok(page) => {
                pages += 1;
                let has_more = page.has_more;
                next = page.next_cursor;
                debug!(
                    items = page.items.len(),
                    next_cursor = page.next_cursor,
                    has_more,
                    "page read"
                );
                let sent = select! {
                    _ = cancel.cancelled() => break,
                    sent = to_pipeline.send(Ok(page)) => sent,
                };
                if sent.is_err() {
                    debug!("pipeline dropped the page channel");
                    break;
                }
                if !has_more {
                    break;
                }
            }
            Err(err) => {
                warn!("page read failed: {err}");
                let _ = to_pipeline.send(Err(err)).await;
                break;
            }
        }
    }

    info!(pages, next_cursor = next, "page producer finished");
    Ok(())
}
