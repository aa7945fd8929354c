use crate::Instant;

#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub(crate) enum Timer {
    /// When to send a delayed ack
    Ack = 0,
    /// When to retransmit every unacked packet
    Retransmission = 1,
    /// When the congestion controller lets queued packets go out
    Send = 2,
    /// When to close the connection after no activity
    Idle = 3,
}

impl Timer {
    pub(crate) const VALUES: [Self; 4] = [Self::Ack, Self::Retransmission, Self::Send, Self::Idle];
}

/// A table of data associated with each distinct kind of `Timer`
#[derive(Debug, Copy, Clone, Default)]
pub(crate) struct TimerTable {
    data: [Option<Instant>; Timer::VALUES.len()],
}

impl TimerTable {
    /// Sets the timer unconditionally
    pub(super) fn set(&mut self, timer: Timer, time: Instant) {
        self.data[timer as usize] = Some(time);
    }

    #[cfg(test)]
    pub(super) fn get(&self, timer: Timer) -> Option<Instant> {
        self.data[timer as usize]
    }

    pub(super) fn stop(&mut self, timer: Timer) {
        self.data[timer as usize] = None;
    }

    /// Get the next queued timeout
    pub(super) fn peek(&self) -> Option<Instant> {
        self.data.iter().filter_map(|&x| x).min()
    }

    /// Remove the next timer up until `now`, including it
    pub(super) fn expire_before(&mut self, now: Instant) -> Option<Timer> {
        for timer in Timer::VALUES {
            if self.data[timer as usize].is_some_and(|x| x <= now) {
                self.data[timer as usize] = None;
                return Some(timer);
            }
        }
        None
    }

    pub(super) fn reset(&mut self) {
        self.data = Default::default();
    }

    pub(super) fn is_set(&self, timer: Timer) -> bool {
        self.data[timer as usize].is_some()
    }
}
