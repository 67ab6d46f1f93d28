use crate::agent::StreamError;
use crate::protocol::LogMessage;
use std::cmp::{Ordering, Reverse};
use std::collections::{BinaryHeap, BTreeMap, HashMap};

/// Outcome of one stream's slice of a query.
#[derive(Debug, Clone, Default)]
pub struct StreamSummary {
    pub total: u64,
    pub messages_returned: usize,
    pub error: Option<StreamError>,
}

/// The merged result of one fan-out query.
#[derive(Debug, Clone)]
pub struct AggregatedResult {
    /// Minute buckets in ascending order, counts summed across streams.
    pub histogram: Vec<(i64, u64)>,
    /// Ascending by (timestamp, stream id, offset), at most `max_messages`.
    pub messages: Vec<LogMessage>,
    pub per_stream: HashMap<String, StreamSummary>,
}

impl AggregatedResult {
    pub fn succeeded_count(&self) -> usize {
        self.per_stream.values().filter(|s| s.error.is_none()).count()
    }

    pub fn failed_count(&self) -> usize {
        self.per_stream.values().filter(|s| s.error.is_some()).count()
    }
}

struct HeapEntry(LogMessage);

impl HeapEntry {
    fn key(&self) -> (chrono::DateTime<chrono::Utc>, &str, u64) {
        (self.0.timestamp, self.0.stream_id.as_str(), self.0.offset)
    }
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.key() == other.key()
    }
}

impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        self.key().cmp(&other.key())
    }
}

/// Accumulates per-stream frames into one deterministic aggregate.
///
/// Messages ride a bounded min-heap: once full, an incoming message only
/// displaces the smallest key, so the newest `max_messages` across all
/// streams survive. Histogram buckets are never truncated.
pub struct ResultMerger {
    max_messages: usize,
    histogram: BTreeMap<i64, u64>,
    heap: BinaryHeap<Reverse<HeapEntry>>,
    per_stream: HashMap<String, StreamSummary>,
    messages_seen: HashMap<String, usize>,
}

impl ResultMerger {
    pub fn new(max_messages: usize) -> Self {
        Self {
            max_messages,
            histogram: BTreeMap::new(),
            heap: BinaryHeap::new(),
            per_stream: HashMap::new(),
            messages_seen: HashMap::new(),
        }
    }

    pub fn add_histogram(&mut self, minute: i64, count: u64) {
        *self.histogram.entry(minute).or_insert(0) += count;
    }

    pub fn add_message(&mut self, message: LogMessage) {
        *self
            .messages_seen
            .entry(message.stream_id.clone())
            .or_insert(0) += 1;

        self.heap.push(Reverse(HeapEntry(message)));
        if self.heap.len() > self.max_messages {
            self.heap.pop();
        }
    }

    /// Record a stream's terminal frame.
    pub fn complete_stream(&mut self, stream_id: &str, total: u64, error: Option<StreamError>) {
        let returned = self.messages_seen.get(stream_id).copied().unwrap_or(0);
        self.per_stream.insert(
            stream_id.to_string(),
            StreamSummary {
                total,
                messages_returned: returned,
                error,
            },
        );
    }

    /// Record a stream that failed before producing any frames.
    pub fn fail_stream(&mut self, stream_id: &str, error: StreamError) {
        self.per_stream.insert(
            stream_id.to_string(),
            StreamSummary {
                total: 0,
                messages_returned: 0,
                error: Some(error),
            },
        );
    }

    pub fn finalize(self) -> AggregatedResult {
        let mut messages: Vec<LogMessage> = self
            .heap
            .into_iter()
            .map(|Reverse(HeapEntry(message))| message)
            .collect();
        messages.sort_by(|a, b| {
            (a.timestamp, a.stream_id.as_str(), a.offset)
                .cmp(&(b.timestamp, b.stream_id.as_str(), b.offset))
        });

        AggregatedResult {
            histogram: self.histogram.into_iter().collect(),
            messages,
            per_stream: self.per_stream,
        }
    }
}
