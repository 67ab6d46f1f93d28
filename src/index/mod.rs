use std::collections::HashMap;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum IndexError {
    #[error("index row out of order: minute {minute} offset {offset} after minute {prev_minute} offset {prev_offset}")]
    OutOfOrder {
        minute: i64,
        offset: u64,
        prev_minute: i64,
        prev_offset: u64,
    },
}

/// Local snapshot of one file's remote sidecar index.
///
/// Entries map a wall-clock minute to the byte offset of the first complete
/// line whose timestamp falls in that minute. Strictly increasing in both
/// dimensions; the last bucket may be stale while the file grows.
#[derive(Debug, Clone, Default)]
pub struct FileIndex {
    entries: Vec<(i64, u64)>,
}

impl FileIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Append one `(minute, offset)` row, enforcing the ordering invariant.
    pub fn push(&mut self, minute: i64, offset: u64) -> Result<(), IndexError> {
        if let Some(&(prev_minute, prev_offset)) = self.entries.last() {
            if minute <= prev_minute || offset <= prev_offset {
                return Err(IndexError::OutOfOrder {
                    minute,
                    offset,
                    prev_minute,
                    prev_offset,
                });
            }
        }
        self.entries.push((minute, offset));
        Ok(())
    }

    /// The byte window covering `[from_minute, to_minute]`.
    ///
    /// Start is the offset of the last entry at or before `from_minute`
    /// (zero when the range starts before the first entry). End is the
    /// offset of the first entry after `to_minute`, or `None` for EOF.
    pub fn byte_range(&self, from_minute: i64, to_minute: i64) -> (u64, Option<u64>) {
        let start_idx = self.entries.partition_point(|&(m, _)| m <= from_minute);
        let start = if start_idx == 0 {
            0
        } else {
            self.entries[start_idx - 1].1
        };

        let end_idx = self.entries.partition_point(|&(m, _)| m <= to_minute);
        let end = self.entries.get(end_idx).map(|&(_, offset)| offset);

        (start, end)
    }

    /// Minute of the last recorded bucket, if any.
    pub fn last_minute(&self) -> Option<i64> {
        self.entries.last().map(|&(minute, _)| minute)
    }
}

/// Per-file index snapshots for one logstream.
#[derive(Debug, Clone, Default)]
pub struct IndexSet {
    files: HashMap<String, FileIndex>,
}

impl IndexSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, file: &str) -> Option<&FileIndex> {
        self.files.get(file)
    }

    /// Replace one file's snapshot wholesale (the remote always replies the
    /// full current index).
    pub fn replace(&mut self, file: &str, index: FileIndex) {
        self.files.insert(file.to_string(), index);
    }

    /// Drop every snapshot, forcing refresh on the next query.
    pub fn clear(&mut self) {
        self.files.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> FileIndex {
        let mut index = FileIndex::new();
        index.push(100, 0).unwrap();
        index.push(101, 500).unwrap();
        index.push(103, 900).unwrap();
        index.push(110, 4000).unwrap();
        index
    }

    #[test]
    fn test_range_inside() {
        let index = sample();
        assert_eq!(index.byte_range(101, 102), (500, Some(900)));
    }

    #[test]
    fn test_range_spanning_gap() {
        let index = sample();
        // Minute 102 has no entry; scanning [102, 103] starts at the last
        // entry at or before 102.
        assert_eq!(index.byte_range(102, 103), (500, Some(4000)));
    }

    #[test]
    fn test_range_before_first_entry() {
        let index = sample();
        assert_eq!(index.byte_range(50, 99), (0, Some(0)));
    }

    #[test]
    fn test_range_past_last_entry() {
        let index = sample();
        assert_eq!(index.byte_range(110, 200), (4000, None));
    }

    #[test]
    fn test_range_whole_file() {
        let index = sample();
        assert_eq!(index.byte_range(90, 200), (0, None));
    }

    #[test]
    fn test_single_minute_window() {
        let index = sample();
        // [t, t] contains every line in bucket 101 and nothing outside it.
        assert_eq!(index.byte_range(101, 101), (500, Some(900)));
    }

    #[test]
    fn test_empty_index_scans_everything() {
        let index = FileIndex::new();
        assert_eq!(index.byte_range(0, 1000), (0, None));
    }

    #[test]
    fn test_out_of_order_minute_rejected() {
        let mut index = sample();
        assert!(matches!(
            index.push(110, 9000),
            Err(IndexError::OutOfOrder { .. })
        ));
        assert!(matches!(
            index.push(109, 9000),
            Err(IndexError::OutOfOrder { .. })
        ));
    }

    #[test]
    fn test_out_of_order_offset_rejected() {
        let mut index = sample();
        assert!(matches!(
            index.push(120, 4000),
            Err(IndexError::OutOfOrder { .. })
        ));
    }

    #[test]
    fn test_index_set_replace() {
        let mut set = IndexSet::new();
        set.replace("/var/log/syslog", sample());
        assert_eq!(set.get("/var/log/syslog").unwrap().len(), 4);

        let mut rebuilt = FileIndex::new();
        rebuilt.push(200, 0).unwrap();
        set.replace("/var/log/syslog", rebuilt);
        assert_eq!(set.get("/var/log/syslog").unwrap().len(), 1);
        assert_eq!(set.get("/var/log/syslog").unwrap().last_minute(), Some(200));

        set.clear();
        assert!(set.get("/var/log/syslog").is_none());
    }
}
