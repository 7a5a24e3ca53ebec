/// Hands out positive 32-bit IDs, wrapping back to 1 after `u32::MAX`.
#[derive(Debug, Clone)]
pub struct Incrementor {
    next: u32,
}

impl Incrementor {
    pub const fn new() -> Self {
        Self { next: 1 }
    }

    /// Start counting from `next` (0 is bumped to 1).
    pub const fn starting_at(next: u32) -> Self {
        Self {
            next: if next == 0 { 1 } else { next },
        }
    }

    pub fn next_id(&mut self) -> u32 {
        let id = self.next;
        self.next = self.next.wrapping_add(1).max(1);
        id
    }
}

impl Default for Incrementor {
    fn default() -> Self {
        Self::new()
    }
}
