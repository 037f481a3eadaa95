//! Canonical word counting.
//!
//! Every count shown to a writer, whether computed while typing or when a
//! version is stored, goes through [`compute_word_count`]. Two slightly
//! different counters would make the displayed deltas drift apart.
//!
//! Aggregates (chapter / manuscript totals) are maintained incrementally via
//! [`apply_delta`] on each save and corrected by a periodic full recount,
//! see [`WordCountTotals`].

/// Number of incremental updates after which the aggregate asks for a recount.
pub const RECONCILE_EVERY_SAVES: u32 = 50;

/// Count the words in a piece of scene text.
///
/// Markup tags (`<...>`) are replaced by whitespace, then maximal runs of
/// non-whitespace characters are counted. A `<` without a closing `>` is
/// ordinary text.
pub fn compute_word_count(text: &str) -> usize {
    let mut count = 0;
    let mut in_word = false;
    let mut rest = text;

    while let Some(c) = rest.chars().next() {
        if c == '<' {
            if let Some(end) = rest.find('>') {
                // The whole tag acts as a separator.
                in_word = false;
                rest = &rest[end + 1..];
                continue;
            }
        }

        if c.is_whitespace() {
            in_word = false;
        } else if !in_word {
            in_word = true;
            count += 1;
        }
        rest = &rest[c.len_utf8()..];
    }

    count
}

/// Apply a single scene's count change to an aggregate.
///
/// Returns `aggregate + (new_count - old_count)`, clamped to `0..=usize::MAX`
/// when an already drifted aggregate would leave that range.
#[inline]
pub fn apply_delta(aggregate: usize, old_count: usize, new_count: usize) -> usize {
    if new_count >= old_count {
        aggregate.saturating_add(new_count - old_count)
    } else {
        aggregate.saturating_sub(old_count - new_count)
    }
}

/// Running word-count aggregate updated incrementally on every save.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WordCountTotals {
    total: usize,
    saves_since_reconcile: u32,
    reconcile_every: u32,
}

impl WordCountTotals {
    pub fn new(initial_total: usize) -> Self {
        Self {
            total: initial_total,
            saves_since_reconcile: 0,
            reconcile_every: RECONCILE_EVERY_SAVES,
        }
    }

    /// Create with a custom recount interval (for testing).
    pub fn with_interval(initial_total: usize, reconcile_every: u32) -> Self {
        Self {
            reconcile_every: reconcile_every.max(1),
            ..Self::new(initial_total)
        }
    }

    /// Apply one saved scene's change. Returns the new total.
    pub fn record_save(&mut self, old_count: usize, new_count: usize) -> usize {
        self.total = apply_delta(self.total, old_count, new_count);
        self.saves_since_reconcile = self.saves_since_reconcile.saturating_add(1);
        self.total
    }

    /// Whether enough incremental updates happened to warrant a full recount.
    pub fn needs_reconcile(&self) -> bool {
        self.saves_since_reconcile >= self.reconcile_every
    }

    /// Replace the running total with a full recount.
    ///
    /// Returns the drift that had accumulated (`recount - running total`).
    pub fn reconcile(&mut self, recount: usize) -> i64 {
        let drift = recount as i64 - self.total as i64;
        if drift != 0 {
            log::warn!("Word count aggregate drifted by {drift} (running {}, recount {recount})", self.total);
        }
        self.total = recount;
        self.saves_since_reconcile = 0;
        drift
    }

    /// Overwrite the total without counting it as a reconcile (initial load).
    pub fn seed(&mut self, total: usize) {
        self.total = total;
        self.saves_since_reconcile = 0;
    }

    pub fn total(&self) -> usize {
        self.total
    }

    pub fn saves_since_reconcile(&self) -> u32 {
        self.saves_since_reconcile
    }
}

impl Default for WordCountTotals {
    fn default() -> Self {
        Self::new(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_text() {
        assert_eq!(compute_word_count(""), 0);
        assert_eq!(compute_word_count("   \n\t "), 0);
    }

    #[test]
    fn test_collapses_whitespace_runs() {
        assert_eq!(compute_word_count("Hello   world"), 2);
        assert_eq!(compute_word_count("  leading and trailing  "), 3);
        assert_eq!(compute_word_count("line\nbreak\ttab"), 3);
    }

    #[test]
    fn test_strips_tags() {
        assert_eq!(compute_word_count("<b>Hi</b> there"), 2);
        assert_eq!(compute_word_count("<p>one</p><p>two</p>"), 2);
        assert_eq!(compute_word_count("<p class=\"x\"></p>"), 0);
    }

    #[test]
    fn test_unterminated_tag_is_text() {
        assert_eq!(compute_word_count("a < b"), 3);
        assert_eq!(compute_word_count("x <y"), 2);
    }

    #[test]
    fn test_punctuation_belongs_to_word() {
        assert_eq!(compute_word_count("Well, well... she said."), 4);
        assert_eq!(compute_word_count("don't stop—ever"), 2);
    }

    #[test]
    fn test_unicode_text() {
        assert_eq!(compute_word_count("café au lait"), 3);
        assert_eq!(compute_word_count("Привет мир"), 2);
        // Non-breaking space counts as whitespace.
        assert_eq!(compute_word_count("a\u{00A0}b"), 2);
    }

    #[test]
    fn test_apply_delta() {
        assert_eq!(apply_delta(100, 10, 15), 105);
        assert_eq!(apply_delta(100, 15, 10), 95);
        assert_eq!(apply_delta(100, 7, 7), 100);
    }

    #[test]
    fn test_apply_delta_clamps_at_zero() {
        assert_eq!(apply_delta(3, 10, 0), 0);
    }

    #[test]
    fn test_apply_delta_near_max() {
        assert_eq!(apply_delta(usize::MAX, 5, 3), usize::MAX - 2);
        assert_eq!(apply_delta(usize::MAX - 1, 0, 10), usize::MAX);
        assert_eq!(apply_delta(10, usize::MAX, usize::MAX), 10);

        let mut totals = WordCountTotals::new(usize::MAX);
        assert_eq!(totals.record_save(100, 40), usize::MAX - 60);
    }

    #[test]
    fn test_totals_record_and_reconcile() {
        let mut totals = WordCountTotals::with_interval(100, 2);
        assert_eq!(totals.record_save(10, 15), 105);
        assert!(!totals.needs_reconcile());
        assert_eq!(totals.record_save(0, 5), 110);
        assert!(totals.needs_reconcile());

        let drift = totals.reconcile(108);
        assert_eq!(drift, -2);
        assert_eq!(totals.total(), 108);
        assert!(!totals.needs_reconcile());
        assert_eq!(totals.saves_since_reconcile(), 0);
    }

    #[test]
    fn test_totals_seed() {
        let mut totals = WordCountTotals::default();
        totals.record_save(0, 4);
        totals.seed(1_000);
        assert_eq!(totals.total(), 1_000);
        assert_eq!(totals.saves_since_reconcile(), 0);
    }
}
