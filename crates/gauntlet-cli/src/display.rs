//! Post-hoc display of captured output on stderr

use gauntlet_core::OutputLine;
use std::io::Write;

/// Which captured lines to show after the document
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DisplayOptions {
    pub head: Option<usize>,
    pub tail: Option<usize>,
    pub verbose: bool,
}

impl DisplayOptions {
    pub fn is_empty(&self) -> bool {
        !self.verbose && self.head.is_none() && self.tail.is_none()
    }

    /// Indices of the lines to show, in order and without duplicates
    pub fn select(&self, total: usize) -> Vec<usize> {
        if self.verbose {
            return (0..total).collect();
        }
        let head_end = self.head.unwrap_or(0).min(total);
        let tail_start = total.saturating_sub(self.tail.unwrap_or(0)).max(head_end);
        (0..head_end).chain(tail_start..total).collect()
    }
}

/// Write the selected lines to stderr, marking any gap
pub fn print_lines(lines: &[OutputLine], options: DisplayOptions) {
    if options.is_empty() || lines.is_empty() {
        return;
    }
    let stderr = std::io::stderr();
    let mut out = stderr.lock();
    let mut previous: Option<usize> = None;
    for idx in options.select(lines.len()) {
        if previous.is_some_and(|p| idx > p + 1) {
            let _ = writeln!(out, "... {} lines omitted ...", idx - previous.unwrap_or(0) - 1);
        }
        let _ = writeln!(out, "{}", lines[idx].text);
        previous = Some(idx);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_head_and_tail_do_not_overlap() {
        let options = DisplayOptions {
            head: Some(3),
            tail: Some(3),
            verbose: false,
        };
        assert_eq!(options.select(4), vec![0, 1, 2, 3]);
        assert_eq!(options.select(10), vec![0, 1, 2, 7, 8, 9]);
    }

    #[test]
    fn test_verbose_shows_everything() {
        let options = DisplayOptions {
            head: Some(1),
            tail: None,
            verbose: true,
        };
        assert_eq!(options.select(3), vec![0, 1, 2]);
    }

    #[test]
    fn test_nothing_requested() {
        let options = DisplayOptions::default();
        assert!(options.is_empty());
        assert!(options.select(5).is_empty());
    }
}
