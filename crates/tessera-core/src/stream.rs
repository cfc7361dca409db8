//! Lazily paged event streams.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, BoxStream, StreamExt, TryStreamExt};

use crate::error::StorageError;

/// A lazy sequence of records. Nothing is fetched until the stream is polled,
/// and at most one page is held in memory at a time.
pub type EventStream<T> = BoxStream<'static, Result<T, StorageError>>;

/// What a paged stream does when a page comes back empty.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum OnEmptyPage {
    /// End the stream.
    Finish,
    /// Sleep, then poll the same cursor again.
    Poll(Duration),
}

struct PageState<C> {
    cursor: C,
    finished: bool,
}

/// Builds a stream that repeatedly calls `fetch` with a cursor. `fetch`
/// returns one page plus the cursor to resume from.
pub(crate) fn paged<C, T, F, Fut>(
    start: C,
    page_size: u32,
    on_empty: OnEmptyPage,
    fetch: F,
) -> EventStream<T>
where
    C: Clone + Send + 'static,
    T: Send + 'static,
    F: Fn(C) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(Vec<T>, C), StorageError>> + Send + 'static,
{
    let fetch = Arc::new(fetch);
    let page_len = usize::try_from(page_size).unwrap_or(usize::MAX);

    stream::try_unfold(
        PageState {
            cursor: start,
            finished: false,
        },
        move |state| {
            let fetch = Arc::clone(&fetch);
            async move {
                if state.finished {
                    return Ok(None);
                }
                loop {
                    let (rows, next) = fetch(state.cursor.clone()).await?;
                    if rows.is_empty() {
                        match on_empty {
                            OnEmptyPage::Finish => return Ok(None),
                            OnEmptyPage::Poll(interval) => {
                                tokio::time::sleep(interval).await;
                                continue;
                            }
                        }
                    }
                    // A short page means the visible end was reached.
                    let finished = on_empty == OnEmptyPage::Finish && rows.len() < page_len;
                    return Ok(Some((
                        rows,
                        PageState {
                            cursor: next,
                            finished,
                        },
                    )));
                }
            }
        },
    )
    .map_ok(|rows| stream::iter(rows.into_iter().map(Ok)))
    .try_flatten()
    .boxed()
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use futures::TryStreamExt;

    use super::*;

    fn page_of(source: &[u32], after: usize, limit: u32) -> (Vec<u32>, usize) {
        let rows: Vec<u32> = source
            .iter()
            .skip(after)
            .take(limit as usize)
            .copied()
            .collect();
        let next = after + rows.len();
        (rows, next)
    }

    #[tokio::test]
    async fn test_paged_stream_walks_every_page_in_order() {
        // Arrange
        let source: Arc<Vec<u32>> = Arc::new((0..7).collect());
        let calls = Arc::new(AtomicUsize::new(0));
        let counted = Arc::clone(&calls);

        // Act
        let items: Vec<u32> = paged(0usize, 3, OnEmptyPage::Finish, move |after| {
            let source = Arc::clone(&source);
            counted.fetch_add(1, Ordering::SeqCst);
            async move { Ok(page_of(&source, after, 3)) }
        })
        .try_collect()
        .await
        .unwrap();

        // Assert
        assert_eq!(items, (0..7).collect::<Vec<_>>());
        // Pages of 3, 3, 1; the short page ends the stream without a fourth call.
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_paged_stream_is_lazy() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counted = Arc::clone(&calls);

        let stream = paged(0usize, 10, OnEmptyPage::Finish, move |after| {
            counted.fetch_add(1, Ordering::SeqCst);
            async move { Ok((Vec::<u32>::new(), after)) }
        });

        assert_eq!(calls.load(Ordering::SeqCst), 0);
        drop(stream);
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_paged_stream_surfaces_fetch_errors() {
        let result: Result<Vec<u32>, _> = paged(0usize, 10, OnEmptyPage::Finish, |_| async {
            Err::<(Vec<u32>, usize), _>(StorageError::CorruptRecord("bad row".into()))
        })
        .try_collect()
        .await;

        assert!(matches!(result, Err(StorageError::CorruptRecord(_))));
    }

    #[tokio::test]
    async fn test_polling_stream_waits_for_new_rows() {
        // Arrange: the first poll sees nothing, later polls see one row.
        let source = Arc::new(Mutex::new(Vec::<u32>::new()));
        let shared = Arc::clone(&source);
        let mut stream = paged(0usize, 10, OnEmptyPage::Poll(Duration::from_millis(5)), {
            move |after| {
                let (rows, next) = page_of(&shared.lock().unwrap(), after, 10);
                async move { Ok((rows, next)) }
            }
        });

        // Act
        let writer = Arc::clone(&source);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            writer.lock().unwrap().push(99);
        });
        let first = stream.try_next().await.unwrap();

        // Assert
        assert_eq!(first, Some(99));
    }
}
