use std::collections::VecDeque;

/// Keep-last-N view over a job's output, for rendering only.
///
/// The runner's log stays complete; this buffer evicts the oldest line once
/// `capacity` is exceeded.
#[derive(Debug, Clone)]
pub struct DisplayTail {
    lines: VecDeque<String>,
    capacity: usize,
    evicted: u64,
}

impl DisplayTail {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            lines: VecDeque::with_capacity(capacity),
            capacity,
            evicted: 0,
        }
    }

    pub fn push(&mut self, line: impl Into<String>) {
        self.lines.push_back(line.into());
        while self.lines.len() > self.capacity {
            self.lines.pop_front();
            self.evicted += 1;
        }
    }

    pub fn extend<I, S>(&mut self, lines: I)
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        for line in lines {
            self.push(line);
        }
    }

    pub fn lines(&self) -> impl Iterator<Item = &str> {
        self.lines.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }

    /// Lines dropped from the front so far.
    pub fn evicted(&self) -> u64 {
        self.evicted
    }

    pub fn render(&self) -> String {
        self.lines().collect::<Vec<_>>().join("\n")
    }
}

impl Default for DisplayTail {
    fn default() -> Self {
        Self::new(50)
    }
}
