use std::collections::BTreeMap;

/// Orders and deduplicates one direction of a TCP stream.
///
/// Staged segments are keyed by sequence number. A re-send at an already
/// staged seq keeps the longer payload, which absorbs the common
/// probe-then-replace pattern; `drain(hold_last = true)` additionally keeps
/// the newest segment pending so a replacement can still land.
pub struct Reassembler {
    /// Staged segments keyed by starting sequence number.
    staged: BTreeMap<u32, Vec<u8>>,
    /// Next expected sequence number once initialized.
    next_seq: u32,
    initialized: bool,
}

impl Default for Reassembler {
    fn default() -> Self {
        Self::new()
    }
}

impl Reassembler {
    pub fn new() -> Self {
        Reassembler {
            staged: BTreeMap::new(),
            next_seq: 0,
            initialized: false,
        }
    }

    /// Pin the next expected sequence number (from a SYN or from the end of
    /// the pre-handshake byte stream), discarding any stale initialization.
    pub fn init(&mut self, seq: u32) {
        self.next_seq = seq;
        self.initialized = true;
    }

    pub fn next_seq(&self) -> u32 {
        self.next_seq
    }

    /// Stage a segment. At an already-staged seq the longer payload wins.
    pub fn add_segment(&mut self, seq: u32, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        if !self.initialized {
            self.initialized = true;
            self.next_seq = seq;
        }
        match self.staged.get(&seq) {
            Some(existing) if existing.len() >= data.len() => {}
            _ => {
                self.staged.insert(seq, data.to_vec());
            }
        }
    }

    /// Deliver the contiguous byte run starting at `next_seq`.
    ///
    /// Comparisons are done in signed 32-bit space so the walk survives TCP
    /// sequence wrap-around (the map's key order does not). With `hold_last`
    /// the final staged segment stays pending for replacement protection.
    pub fn drain(&mut self, hold_last: bool) -> Vec<u8> {
        let mut out = Vec::new();

        loop {
            let mut selected: Option<u32> = None;
            let mut stale: Vec<u32> = Vec::new();
            for (&seq, data) in &self.staged {
                let end = seq.wrapping_add(data.len() as u32);

                // Ends at or before next_seq: already delivered.
                if (end.wrapping_sub(self.next_seq) as i32) <= 0 {
                    stale.push(seq);
                    continue;
                }
                // Starts at or before next_seq: deliverable.
                if (seq.wrapping_sub(self.next_seq) as i32) <= 0 {
                    selected = Some(seq);
                    break;
                }
            }
            for seq in stale {
                self.staged.remove(&seq);
            }

            let Some(seq) = selected else { break };
            if hold_last && self.staged.len() <= 1 {
                break;
            }
            let Some(data) = self.staged.remove(&seq) else {
                break;
            };
            let offset = self.next_seq.wrapping_sub(seq) as usize;
            out.extend_from_slice(&data[offset..]);
            self.next_seq = seq.wrapping_add(data.len() as u32);
        }

        out
    }

    /// Total bytes currently staged (pending delivery).
    pub fn staged_bytes(&self) -> usize {
        self.staged.values().map(|v| v.len()).sum()
    }
}
