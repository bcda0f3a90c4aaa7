//! The TX schedule: which channels we may transmit on, in which slots.

use anyhow::{bail, Result};

/// A `channels x slots` matrix of transmit permissions.
#[derive(Debug, Clone, Default)]
pub struct Schedule {
    schedule: Vec<Vec<bool>>,
}

impl Schedule {
    /// Build a schedule from per-channel slot rows. All rows must have the
    /// same length.
    pub fn new(schedule: Vec<Vec<bool>>) -> Result<Self> {
        if schedule.is_empty() {
            bail!("schedule has no channels");
        }

        let nslots = schedule[0].len();

        for row in &schedule[1..] {
            if row.len() != nslots {
                bail!("schedule channels have differing numbers of slots");
            }
        }

        Ok(Schedule { schedule })
    }

    pub fn nchannels(&self) -> usize {
        self.schedule.len()
    }

    pub fn nslots(&self) -> usize {
        self.schedule.first().map_or(0, |row| row.len())
    }

    pub fn row(&self, chan: usize) -> &[bool] {
        &self.schedule[chan]
    }

    /// May we transmit in the given slot on any channel?
    pub fn can_transmit_in_slot(&self, slot: usize) -> bool {
        self.schedule.iter().any(|row| row[slot])
    }

    /// May we transmit on the given channel in any slot?
    pub fn can_transmit_on_channel(&self, chan: usize) -> bool {
        self.schedule[chan].iter().any(|&slot| slot)
    }

    /// The first channel on which we may transmit in the given slot.
    pub fn first_channel_idx(&self, slot: usize) -> Option<usize> {
        (0..self.nchannels()).find(|&chan| self.schedule[chan][slot])
    }

    /// An FDMA schedule is one where slots are irrelevant: each channel is
    /// either always ours or never ours.
    pub fn is_fdma(&self) -> bool {
        self.schedule
            .iter()
            .all(|row| row.iter().all(|&slot| slot == row[0]))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn uneven_rows_rejected() {
        assert!(Schedule::new(vec![vec![true, false], vec![true]]).is_err());
        assert!(Schedule::new(vec![]).is_err());
    }

    #[test]
    fn transmit_queries() {
        let s = Schedule::new(vec![
            vec![true, false, true, false],
            vec![false, false, false, false],
        ])
        .unwrap();

        assert_eq!(s.nchannels(), 2);
        assert_eq!(s.nslots(), 4);

        assert!(s.can_transmit_in_slot(0));
        assert!(!s.can_transmit_in_slot(1));
        assert!(s.can_transmit_on_channel(0));
        assert!(!s.can_transmit_on_channel(1));

        assert_eq!(s.first_channel_idx(2), Some(0));
        assert_eq!(s.first_channel_idx(3), None);
    }

    #[test]
    fn fdma_detection() {
        let fdma = Schedule::new(vec![vec![true, true], vec![false, false]]).unwrap();
        assert!(fdma.is_fdma());

        let tdma = Schedule::new(vec![vec![true, false], vec![false, true]]).unwrap();
        assert!(!tdma.is_fdma());
    }
}
