/// Chooses which resident frame the eviction sweep looks at next.
///
/// Positions index the frame table's list of resident user frames.
pub trait PageReplacementPolicy {
    /// The position to inspect next, or `None` if nothing is resident.
    fn next_candidate(&mut self, resident: usize) -> Option<usize>;

    /// The frame at `idx` left the list and everything after it moved down
    /// by one.
    fn frame_removed(&mut self, idx: usize);
}

/// Second-chance clock: the hand sweeps the resident list circularly and
/// remembers where it stopped across calls.
#[derive(Debug, Default)]
pub struct Clock {
    hand: Option<usize>,
}

impl Clock {
    #[cfg(test)]
    pub fn hand(&self) -> Option<usize> {
        self.hand
    }
}

impl PageReplacementPolicy for Clock {
    fn next_candidate(&mut self, resident: usize) -> Option<usize> {
        if resident == 0 {
            return None;
        }
        // An unset or stale hand starts over at the head of the list.
        let idx = self.hand.filter(|&hand| hand < resident).unwrap_or(0);
        self.hand = Some((idx + 1) % resident);
        Some(idx)
    }

    fn frame_removed(&mut self, idx: usize) {
        if let Some(hand) = self.hand.as_mut() {
            if *hand > idx {
                *hand -= 1;
            }
        }
    }
}
