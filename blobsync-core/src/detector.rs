//! Source/destination comparison driving bulk reconciliation.

use std::fmt;
use std::sync::Arc;

use tracing::debug;

use blobsync_model::ObjectMetadata;

use crate::error::Result;
use crate::storage::{ListOptions, Storage};

/// Page size for source enumeration.
const LIST_PAGE_SIZE: usize = 1000;

/// Enumerates the source store and decides which keys need replication.
pub struct ChangeDetector {
    source: Arc<dyn Storage>,
    dest: Arc<dyn Storage>,
}

impl fmt::Debug for ChangeDetector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChangeDetector").finish()
    }
}

impl ChangeDetector {
    pub fn new(source: Arc<dyn Storage>, dest: Arc<dyn Storage>) -> Self {
        ChangeDetector { source, dest }
    }

    /// Returns every source key under `prefix` whose object differs from
    /// the destination, in listing order.
    ///
    /// Source listing errors fail the pass; a destination metadata error
    /// (typically *not found*) counts the key as changed.
    pub async fn detect_changes(&self, prefix: &str) -> Result<Vec<String>> {
        let mut changed = Vec::new();
        let mut continue_from = None;

        loop {
            let page = self
                .source
                .list(ListOptions {
                    prefix: prefix.to_string(),
                    max_results: LIST_PAGE_SIZE,
                    continue_from: continue_from.clone(),
                })
                .await?;

            for entry in page.objects {
                match self.dest.get_metadata(&entry.key).await {
                    Ok(dest_meta) => {
                        if has_changed(&entry.metadata, Some(&dest_meta)) {
                            changed.push(entry.key);
                        }
                    }
                    Err(err) => {
                        debug!(
                            "destination metadata for {} unavailable ({err}), \
                             scheduling copy",
                            entry.key
                        );
                        changed.push(entry.key);
                    }
                }
            }

            if !page.truncated {
                break;
            }
            continue_from = page.next_token;
        }

        Ok(changed)
    }
}

/// Last-writer-wins change test. The first firing rule wins: a missing
/// destination, then ETag inequality (both sides non-empty), then size,
/// then source mtime strictly newer.
pub fn has_changed(
    src: &ObjectMetadata,
    dest: Option<&ObjectMetadata>,
) -> bool {
    let Some(dest) = dest else {
        return true;
    };
    if !src.etag.is_empty() && !dest.etag.is_empty() && src.etag != dest.etag {
        return true;
    }
    if src.size != dest.size {
        return true;
    }
    if src.last_modified > dest.last_modified {
        return true;
    }
    false
}

#[cfg(test)]
mod tests {
    use chrono::{Duration as ChronoDuration, Utc};

    use crate::testing::MemoryStorage;

    use super::*;

    fn meta(size: u64, etag: &str) -> ObjectMetadata {
        ObjectMetadata::new(size, etag)
    }

    #[test]
    fn test_has_changed_missing_destination() {
        assert!(has_changed(&meta(5, "x"), None));
    }

    #[test]
    fn test_has_changed_etag_dominates() {
        let src = meta(5, "aaa");
        let mut dest = meta(5, "bbb");
        // An older source mtime does not rescue a differing etag.
        dest.last_modified = src.last_modified + ChronoDuration::hours(1);
        assert!(has_changed(&src, Some(&dest)));
    }

    #[test]
    fn test_has_changed_empty_etags_fall_through_to_size() {
        let src = meta(5, "");
        let dest = meta(6, "");
        assert!(has_changed(&src, Some(&dest)));

        let mut same_size = meta(5, "");
        same_size.last_modified = src.last_modified;
        assert!(!has_changed(&src, Some(&same_size)));
    }

    #[test]
    fn test_has_changed_mtime_breaks_ties() {
        let now = Utc::now();
        let mut src = meta(5, "x");
        src.last_modified = now;
        let mut dest = meta(5, "x");
        dest.last_modified = now - ChronoDuration::minutes(10);
        assert!(has_changed(&src, Some(&dest)));

        // Destination newer or equal: unchanged.
        dest.last_modified = now;
        assert!(!has_changed(&src, Some(&dest)));
        dest.last_modified = now + ChronoDuration::minutes(10);
        assert!(!has_changed(&src, Some(&dest)));
    }

    #[tokio::test]
    async fn test_detect_changes_follows_pagination() {
        let source = Arc::new(MemoryStorage::new());
        let dest = Arc::new(MemoryStorage::new());

        // More keys than one page so the continuation token is exercised.
        for i in 0..2500 {
            source.insert(
                format!("obj-{i:04}"),
                vec![0u8; 4],
                meta(4, &format!("etag-{i}")),
            );
        }
        let detector = ChangeDetector::new(source, dest);
        let changed = detector.detect_changes("").await.expect("detect");
        assert_eq!(changed.len(), 2500);
        assert_eq!(changed[0], "obj-0000");
        assert_eq!(changed[2499], "obj-2499");
    }

    #[tokio::test]
    async fn test_detect_changes_honours_prefix_and_skips_unchanged() {
        let source = Arc::new(MemoryStorage::new());
        let dest = Arc::new(MemoryStorage::new());

        let shared = meta(3, "same");
        source.insert("docs/a".to_string(), vec![1, 2, 3], shared.clone());
        dest.insert("docs/a".to_string(), vec![1, 2, 3], shared);
        source.insert("docs/b".to_string(), vec![1], meta(1, "new"));
        source.insert("media/c".to_string(), vec![1], meta(1, "out"));

        let detector = ChangeDetector::new(source, dest);
        let changed = detector.detect_changes("docs/").await.expect("detect");
        assert_eq!(changed, vec!["docs/b".to_string()]);
    }
}
