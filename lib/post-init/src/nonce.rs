// SPDX-FileCopyrightText: Copyright (c) 2024-2025 NVIDIA CORPORATION & AFFILIATES. All rights reserved.
// SPDX-License-Identifier: Apache-2.0

//! Best-nonce retention.
//!
//! The oracle flags positions whose label is below the difficulty threshold.
//! Among those, the engine retains the one with the numerically smallest
//! 16-byte value, compared byte-wise as unsigned big-endian.

use crate::config::BYTES_PER_LABEL;
use crate::error::{InitError, Result};

pub type NonceValue = [u8; 16];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Nonce {
    pub position: u64,

    /// None when the record was written without the value; any known value
    /// compares as better.
    pub value: Option<NonceValue>,
}

impl Nonce {
    fn is_better_than(&self, other: &Nonce) -> bool {
        match (self.value, other.value) {
            (Some(a), Some(b)) => a < b,
            (Some(_), None) => true,
            (None, _) => false,
        }
    }
}

/// Retained nonce plus the extended-search checkpoint.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NonceSearch {
    best: Option<Nonce>,
    last_position: Option<u64>,
}

impl NonceSearch {
    pub fn new(best: Option<Nonce>, last_position: Option<u64>) -> Self {
        Self {
            best,
            last_position,
        }
    }

    pub fn best(&self) -> Option<Nonce> {
        self.best
    }

    pub fn last_position(&self) -> Option<u64> {
        self.last_position
    }

    /// Offer a candidate; returns true when it replaced the retained best.
    pub fn offer(&mut self, candidate: Nonce) -> bool {
        let improved = match &self.best {
            None => true,
            Some(best) => candidate.is_better_than(best),
        };
        if improved {
            self.best = Some(candidate);
        }
        improved
    }

    pub fn set_last_position(&mut self, position: u64) {
        self.last_position = Some(position);
    }

    /// Where the extended search starts: never inside the written label space,
    /// and never behind an earlier checkpoint.
    pub fn extended_start(&self, total_labels: u64) -> u64 {
        self.last_position
            .map_or(total_labels, |last| last.max(total_labels))
    }
}

/// Phases of one `initialize` run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchPhase {
    /// Label files are being written; candidates come from each batch.
    WritingFiles,

    /// All assigned files are complete but no nonce is retained yet.
    SearchingNonce { next_position: u64 },

    Done,
}

impl SearchPhase {
    /// Transition out of `WritingFiles` once every assigned file is complete.
    pub fn after_files(search: &NonceSearch, total_labels: u64, search_beyond_end: bool) -> Self {
        if search.best().is_some() || !search_beyond_end {
            SearchPhase::Done
        } else {
            SearchPhase::SearchingNonce {
                next_position: search.extended_start(total_labels),
            }
        }
    }
}

/// Extract the 16-byte label of `nonce` from an oracle batch starting at `start`.
pub fn candidate_value(output: &[u8], start: u64, nonce: u64) -> Result<NonceValue> {
    let label = BYTES_PER_LABEL as usize;
    let offset = nonce
        .checked_sub(start)
        .and_then(|i| usize::try_from(i).ok())
        .and_then(|i| i.checked_mul(label))
        .ok_or_else(|| {
            InitError::InvalidOracleOutput(format!(
                "nonce {} precedes batch start {}",
                nonce, start
            ))
        })?;

    let bytes = output.get(offset..offset.saturating_add(label)).ok_or_else(|| {
        InitError::InvalidOracleOutput(format!(
            "nonce {} outside batch of {} labels starting at {}",
            nonce,
            output.len() / label,
            start
        ))
    })?;

    let mut value = [0u8; 16];
    value.copy_from_slice(bytes);
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nonce(position: u64, first_byte: u8) -> Nonce {
        let mut value = [0xffu8; 16];
        value[0] = first_byte;
        Nonce {
            position,
            value: Some(value),
        }
    }

    #[test]
    fn test_first_candidate_is_retained() {
        let mut search = NonceSearch::default();
        assert!(search.offer(nonce(5, 0x80)));
        assert_eq!(search.best().unwrap().position, 5);
    }

    #[test]
    fn test_only_strictly_smaller_replaces() {
        let mut search = NonceSearch::default();
        search.offer(nonce(5, 0x80));

        assert!(!search.offer(nonce(9, 0x90)));
        assert!(!search.offer(nonce(11, 0x80)));
        assert_eq!(search.best().unwrap().position, 5);

        assert!(search.offer(nonce(20, 0x10)));
        assert_eq!(search.best().unwrap().position, 20);
    }

    #[test]
    fn test_retained_value_is_minimum_regardless_of_order() {
        let candidates = [0x42u8, 0x07, 0x99, 0x07, 0x30, 0x01, 0xfe];

        let mut forward = NonceSearch::default();
        let mut backward = NonceSearch::default();
        let mut previous: Option<NonceValue> = None;
        for (i, b) in candidates.iter().enumerate() {
            forward.offer(nonce(i as u64, *b));
            let current = forward.best().unwrap().value.unwrap();
            if let Some(prev) = previous {
                assert!(current <= prev);
            }
            previous = Some(current);
        }
        for (i, b) in candidates.iter().enumerate().rev() {
            backward.offer(nonce(i as u64, *b));
        }

        assert_eq!(forward.best().unwrap().value.unwrap()[0], 0x01);
        assert_eq!(forward.best(), backward.best());
    }

    #[test]
    fn test_unknown_value_is_replaced() {
        let mut search = NonceSearch::new(
            Some(Nonce {
                position: 3,
                value: None,
            }),
            None,
        );
        assert!(search.offer(nonce(4, 0xfe)));
        assert!(!search.offer(Nonce {
            position: 5,
            value: None
        }));
    }

    #[test]
    fn test_extended_start() {
        let mut search = NonceSearch::default();
        assert_eq!(search.extended_start(128), 128);

        search.set_last_position(64);
        assert_eq!(search.extended_start(128), 128);

        search.set_last_position(4096);
        assert_eq!(search.extended_start(128), 4096);
    }

    #[test]
    fn test_phase_after_files() {
        let mut search = NonceSearch::default();
        assert_eq!(
            SearchPhase::after_files(&search, 64, true),
            SearchPhase::SearchingNonce { next_position: 64 }
        );
        assert_eq!(SearchPhase::after_files(&search, 64, false), SearchPhase::Done);

        search.offer(nonce(1, 0));
        assert_eq!(SearchPhase::after_files(&search, 64, true), SearchPhase::Done);
    }

    #[test]
    fn test_candidate_value() {
        let output: Vec<u8> = (0..4u8).flat_map(|i| [i; 16]).collect();

        assert_eq!(candidate_value(&output, 100, 102).unwrap(), [2u8; 16]);
        assert!(candidate_value(&output, 100, 104).is_err());
        assert!(candidate_value(&output, 100, 99).is_err());
    }
}
