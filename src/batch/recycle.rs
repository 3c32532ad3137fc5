/// Adaptive window for out-of-order group reclaim.
///
/// The engine scans the `size` oldest in-flight groups for one that has already
/// completed. A hit in the far half of the window means completions run ahead of
/// submission order, so the window widens; having to block on the oldest group
/// means the scan is wasted work, so it narrows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecycleWindow {
    size: usize,
    max: usize,
}

impl RecycleWindow {
    #[must_use]
    pub fn new(initial: usize, max: usize) -> Self {
        let max = max.max(1);
        Self {
            size: initial.clamp(1, max),
            max,
        }
    }

    /// Strict FIFO: only the oldest group is ever considered.
    #[must_use]
    pub const fn fifo() -> Self {
        Self { size: 1, max: 1 }
    }

    #[must_use]
    pub const fn size(&self) -> usize {
        self.size
    }

    /// A completed group was found at `position` (0 = oldest) inside the window.
    pub fn hit(&mut self, position: usize) {
        if (position + 1) * 2 > self.size && self.size < self.max {
            self.size += 1;
        }
    }

    /// Nothing in the window had completed.
    pub fn miss(&mut self) {
        if self.size > 1 {
            self.size -= 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn initial_size_is_clamped() {
        assert_eq!(RecycleWindow::new(25, 80).size(), 25);
        assert_eq!(RecycleWindow::new(25, 4).size(), 4);
        assert_eq!(RecycleWindow::new(0, 4).size(), 1);
    }

    #[test]
    fn far_hits_grow_near_hits_do_not() {
        let mut window = RecycleWindow::new(10, 80);
        window.hit(2);
        assert_eq!(window.size(), 10);
        window.hit(7);
        assert_eq!(window.size(), 11);
    }

    #[test]
    fn misses_shrink_to_one() {
        let mut window = RecycleWindow::new(2, 80);
        window.miss();
        window.miss();
        window.miss();
        assert_eq!(window.size(), 1);
        window.hit(0);
        assert_eq!(window.size(), 2);
    }

    #[test]
    fn fifo_never_grows() {
        let mut window = RecycleWindow::fifo();
        window.hit(0);
        assert_eq!(window.size(), 1);
    }
}
