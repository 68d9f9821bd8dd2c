//! Periodic poll list scheduling
//!
//! The scheduler walks the poll list with a cursor. An entry is due when its
//! interval for the current poll state divides the ticker. One due entry is
//! handed out per call. Reaching the end of the list completes the pass; the
//! next primary tick advances the ticker and rewinds the cursor.

use crate::bus::BusId;
use crate::poll::{PollEntry, PollList, POLL_STATES};

/// Ticker wraps after this many passes
pub const TICKER_WRAP: u32 = 3600;

/// Result of asking for the next due entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NextPoll {
    /// Entry to poll now
    Due(PollEntry),
    /// Pass complete, nothing more due until the next primary tick
    PassComplete,
    /// No list installed (or nothing for this bus)
    Empty,
}

/// Scheduler position saved across a single request
#[derive(Debug, Clone)]
pub struct SchedulerSnapshot {
    list: Option<PollList>,
    default_bus: Option<BusId>,
    cursor: usize,
    ticker: u32,
    pass_complete: bool,
    state: u8,
}

impl SchedulerSnapshot {
    /// Position at the start of `list`
    pub fn at_start(list: Option<PollList>, default_bus: Option<BusId>, state: u8) -> Self {
        Self {
            list: list.map(trim_list),
            default_bus,
            cursor: 0,
            ticker: 0,
            pass_complete: false,
            state,
        }
    }
}

/// Cut a list at its terminator entry
fn trim_list(list: PollList) -> PollList {
    match list.iter().position(PollEntry::is_terminator) {
        Some(end) => list[..end].iter().cloned().collect(),
        None => list,
    }
}

/// Poll list cursor, ticker and throttling counters for one bus
#[derive(Debug)]
pub struct PollScheduler {
    bus: BusId,
    list: Option<PollList>,
    default_bus: Option<BusId>,
    cursor: usize,
    ticker: u32,
    pass_complete: bool,
    state: u8,
    sequence_count: u8,
    sequence_max: u8,
}

impl PollScheduler {
    pub fn new(bus: BusId, sequence_max: u8) -> Self {
        Self {
            bus,
            list: None,
            default_bus: None,
            cursor: 0,
            ticker: 0,
            pass_complete: false,
            state: 0,
            sequence_count: 0,
            sequence_max,
        }
    }

    /// Install a poll list; entries after a terminator are ignored
    pub fn set_list(&mut self, list: Option<PollList>, default_bus: Option<BusId>) {
        self.list = list.map(trim_list);
        self.default_bus = default_bus;
        self.rewind();
    }

    /// Select the poll state; a change restarts the list
    pub fn set_state(&mut self, state: u8) -> bool {
        let state = state.min(POLL_STATES as u8 - 1);
        if state == self.state {
            return false;
        }
        self.state = state;
        self.rewind();
        true
    }

    fn rewind(&mut self) {
        self.cursor = 0;
        self.ticker = 0;
        self.pass_complete = false;
        self.sequence_count = 0;
    }

    pub fn state(&self) -> u8 {
        self.state
    }

    pub fn ticker(&self) -> u32 {
        self.ticker
    }

    /// The end of the list has been reached in this pass
    pub fn is_pass_complete(&self) -> bool {
        self.pass_complete
    }

    pub fn len(&self) -> usize {
        self.list.as_ref().map_or(0, |l| l.len())
    }

    pub fn sequence_max(&self) -> u8 {
        self.sequence_max
    }

    pub fn set_sequence_max(&mut self, sequence_max: u8) {
        self.sequence_max = sequence_max;
    }

    pub fn reset_sequence(&mut self) {
        self.sequence_count = 0;
    }

    /// Throttling allows another poll in this tick
    pub fn can_poll(&self) -> bool {
        self.sequence_max == 0 || self.sequence_count < self.sequence_max
    }

    fn entry_bus(&self, entry: &PollEntry) -> Option<BusId> {
        match entry.bus {
            0 => self.default_bus,
            n => BusId::new(n),
        }
    }

    /// Hand out the next due entry for this bus and advance the cursor
    pub fn next_due(&mut self) -> NextPoll {
        let Some(list) = self.list.clone() else {
            return NextPoll::Empty;
        };
        if !list.iter().any(|e| self.entry_bus(e) == Some(self.bus)) {
            return NextPoll::Empty;
        }
        if self.pass_complete {
            return NextPoll::PassComplete;
        }

        while let Some(entry) = list.get(self.cursor) {
            self.cursor += 1;
            if self.entry_bus(entry) == Some(self.bus) && entry.is_due(self.state, self.ticker) {
                self.sequence_count = self.sequence_count.saturating_add(1);
                return NextPoll::Due(entry.clone());
            }
        }

        self.pass_complete = true;
        NextPoll::PassComplete
    }

    /// Begin the next pass if the current one is complete or the cursor
    /// has run past the last entry
    ///
    /// Returns `true` if the ticker advanced.
    pub fn start_next_pass(&mut self) -> bool {
        let at_end = self.cursor > 0 && self.cursor >= self.len();
        if !self.pass_complete && !at_end {
            return false;
        }
        self.pass_complete = false;
        self.cursor = 0;
        self.ticker = (self.ticker + 1) % TICKER_WRAP;
        true
    }

    pub fn snapshot(&self) -> SchedulerSnapshot {
        SchedulerSnapshot {
            list: self.list.clone(),
            default_bus: self.default_bus,
            cursor: self.cursor,
            ticker: self.ticker,
            pass_complete: self.pass_complete,
            state: self.state,
        }
    }

    /// Reinstall a saved list and continue where it left off
    ///
    /// A poll state change since the snapshot restarts the list instead.
    pub fn restore(&mut self, snapshot: SchedulerSnapshot) {
        self.list = snapshot.list;
        self.default_bus = snapshot.default_bus;
        if snapshot.state == self.state {
            self.cursor = snapshot.cursor;
            self.ticker = snapshot.ticker;
            self.pass_complete = snapshot.pass_complete;
        } else {
            self.rewind();
        }
    }
}
