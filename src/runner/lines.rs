/// Incremental line splitter with universal-newline handling.
///
/// `\n`, `\r` and `\r\n` all end a line, so carriage-return progress bars
/// come out as one line per redraw. A `\r\n` split across two reads still
/// counts once.
#[derive(Debug, Default)]
pub(crate) struct LineSplitter {
    pending: Vec<u8>,
    after_cr: bool,
}

impl LineSplitter {
    pub(crate) fn feed(&mut self, chunk: &[u8]) -> Vec<String> {
        let mut out = Vec::new();
        for &b in chunk {
            match b {
                b'\n' if self.after_cr => {
                    self.after_cr = false;
                }
                b'\n' | b'\r' => {
                    out.push(self.take_line());
                    self.after_cr = b == b'\r';
                }
                _ => {
                    self.after_cr = false;
                    self.pending.push(b);
                }
            }
        }
        out
    }

    /// Unterminated trailing text, once the stream has closed.
    pub(crate) fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            None
        } else {
            Some(self.take_line())
        }
    }

    fn take_line(&mut self) -> String {
        let line = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        line
    }
}
