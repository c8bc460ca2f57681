/// Fixed-interval cooperative timer table.
///
/// Each entry fires at `start + k * interval`. `poll` returns the due tasks
/// in registration order; an entry that fell more than one interval behind
/// skips the missed slots instead of firing back to back.
#[derive(Debug, Clone)]
pub struct Dispatcher<T> {
    entries: Vec<Entry<T>>,
}

#[derive(Debug, Clone)]
struct Entry<T> {
    interval_ms: u64,
    next_due_ms: u64,
    task: T,
}

impl<T> Default for Dispatcher<T> {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
        }
    }
}

impl<T: Copy> Dispatcher<T> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn every(&mut self, interval_ms: u64, start_ms: u64, task: T) {
        let interval_ms = interval_ms.max(1);
        self.entries.push(Entry {
            interval_ms,
            next_due_ms: start_ms.saturating_add(interval_ms),
            task,
        });
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn poll(&mut self, now_ms: u64) -> Vec<T> {
        let mut due = Vec::new();
        for entry in &mut self.entries {
            if now_ms < entry.next_due_ms {
                continue;
            }
            due.push(entry.task);
            entry.next_due_ms += entry.interval_ms;
            if entry.next_due_ms <= now_ms {
                entry.next_due_ms = now_ms + entry.interval_ms;
            }
        }
        due
    }

    /// Earliest pending deadline, for loops that sleep between polls.
    pub fn next_deadline(&self) -> Option<u64> {
        self.entries.iter().map(|entry| entry.next_due_ms).min()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    enum Job {
        Fast,
        Slow,
    }

    #[test]
    fn fires_at_fixed_cadence_from_start() {
        let mut dispatcher = Dispatcher::new();
        dispatcher.every(100, 1000, Job::Fast);
        dispatcher.every(1000, 1000, Job::Slow);

        assert!(dispatcher.poll(1099).is_empty());
        assert_eq!(dispatcher.poll(1100), vec![Job::Fast]);
        assert!(dispatcher.poll(1150).is_empty());
        assert_eq!(dispatcher.poll(1200), vec![Job::Fast]);

        let mut slow = 0;
        let mut fast = 2;
        for now in 1201..=3000 {
            for job in dispatcher.poll(now) {
                match job {
                    Job::Fast => fast += 1,
                    Job::Slow => slow += 1,
                }
            }
        }
        assert_eq!((fast, slow), (20, 2));
    }

    #[test]
    fn equal_deadlines_keep_registration_order() {
        let mut dispatcher = Dispatcher::new();
        dispatcher.every(1000, 0, Job::Slow);
        dispatcher.every(1000, 0, Job::Fast);
        assert_eq!(dispatcher.poll(1000), vec![Job::Slow, Job::Fast]);
    }

    #[test]
    fn stalls_skip_missed_slots() {
        let mut dispatcher = Dispatcher::new();
        dispatcher.every(100, 0, Job::Fast);

        assert_eq!(dispatcher.poll(1050), vec![Job::Fast]);
        assert!(dispatcher.poll(1100).is_empty());
        assert_eq!(dispatcher.next_deadline(), Some(1150));
        assert_eq!(dispatcher.poll(1150), vec![Job::Fast]);
    }
}
