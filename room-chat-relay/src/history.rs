use std::collections::{HashMap, VecDeque};

/// Per-room chat logs keyed by room name.
///
/// A log outlives the room it belongs to: when the last member leaves and the
/// room is later recreated, joiners still see everything said under that
/// name. Entries are only ever appended; with a `limit` set, the oldest
/// entries are evicted first so replay order is unchanged.
#[derive(Debug, Default)]
pub struct ChatHistory {
    logs: HashMap<String, VecDeque<String>>,
    limit: Option<usize>,
}

impl ChatHistory {
    pub fn new(limit: Option<usize>) -> Self {
        Self {
            logs: HashMap::new(),
            limit,
        }
    }

    pub fn append(&mut self, room: &str, message: String) {
        if self.limit == Some(0) {
            return;
        }

        let log = self.logs.entry(room.to_string()).or_default();
        log.push_back(message);
        if let Some(limit) = self.limit {
            while log.len() > limit {
                log.pop_front();
            }
        }
    }

    /// Messages logged for `room`, oldest first.
    pub fn replay(&self, room: &str) -> impl Iterator<Item = &str> {
        self.logs
            .get(room)
            .into_iter()
            .flat_map(|log| log.iter().map(String::as_str))
    }

    pub fn len(&self, room: &str) -> usize {
        self.logs.get(room).map_or(0, VecDeque::len)
    }
}
