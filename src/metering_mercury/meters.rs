use std::collections::HashMap;

use super::structs::Meter;

/// Meters polled on the bus, owned by the agent
#[derive(Debug, Default)]
pub struct MeterRegistry {
    meters: Vec<Meter>,
    by_address: HashMap<u8, usize>,
    current: usize,
}

impl MeterRegistry {
    pub fn new(meters: Vec<Meter>) -> Self {
        let mut registry = MeterRegistry::default();
        registry.replace(meters);
        registry
    }

    /// Take over a freshly built list, the sweep starts over at the first meter
    pub fn replace(&mut self, meters: Vec<Meter>) {
        self.by_address = meters.iter().enumerate().map(|(idx, m)| (m.address, idx)).collect();
        self.meters = meters;
        self.current = 0;
    }

    pub fn is_empty(&self) -> bool {
        self.meters.is_empty()
    }

    pub fn len(&self) -> usize {
        self.meters.len()
    }

    pub fn first_meter(&mut self) -> Option<&mut Meter> {
        self.current = 0;
        let meter = self.meters.first_mut()?;
        meter.cursor = None;
        Some(meter)
    }

    /// Advance to the next meter, wrapping around after the last one
    pub fn next_meter(&mut self) -> Option<&mut Meter> {
        if self.meters.is_empty() {
            return None;
        }
        self.current = (self.current + 1) % self.meters.len();
        let meter = &mut self.meters[self.current];
        meter.cursor = None;
        Some(meter)
    }

    pub fn current_meter(&self) -> Option<&Meter> {
        self.meters.get(self.current)
    }

    pub fn current_meter_mut(&mut self) -> Option<&mut Meter> {
        self.meters.get_mut(self.current)
    }

    pub fn meter_by_address(&self, address: u8) -> Option<&Meter> {
        self.by_address.get(&address).and_then(|idx| self.meters.get(*idx))
    }

    pub fn meter_by_address_mut(&mut self, address: u8) -> Option<&mut Meter> {
        let idx = *self.by_address.get(&address)?;
        self.meters.get_mut(idx)
    }

    /*
        Moves the cursor of the current meter to the next entry that is due in this sweep.
        Entries with a countdown of 0 or 1 are due; a due entry with a multiplier above 1
        waits that many sweeps again. Every skipped entry counts one sweep down.
        At the end of the plan the cursor stays on the last polled entry.
    */
    pub fn next_due_poll_index(&mut self) -> Option<usize> {
        let meter = self.meters.get_mut(self.current)?;
        let start = meter.cursor.map_or(0, |c| c + 1);

        for idx in start..meter.plan.len() {
            let entry = &mut meter.plan[idx];
            if entry.countdown <= 1 {
                if entry.multiplier > 1 {
                    entry.countdown = entry.multiplier;
                }
                meter.cursor = Some(idx);
                return Some(entry.template);
            }
            entry.countdown = entry.countdown.saturating_sub(1);
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metering_mercury::structs::{Calibration, ChannelMap, PollPlanEntry, ReadMode};

    fn meter(address: u8, plan: Vec<PollPlanEntry>) -> Meter {
        Meter {
            address,
            name: format!("Meter {address}"),
            calibration: Calibration::default(),
            password: [1; 6],
            read_mode: ReadMode::Single,
            plan,
            channels: ChannelMap::new(),
            cursor: None,
            errors: 0,
        }
    }

    fn sweep(registry: &mut MeterRegistry) -> Vec<usize> {
        let mut polled = Vec::new();
        registry.current_meter_mut().unwrap().cursor = None;
        while let Some(t) = registry.next_due_poll_index() {
            polled.push(t);
        }
        polled
    }

    #[test]
    fn test_wraparound() {
        let mut r = MeterRegistry::new(vec![meter(1, vec![]), meter(2, vec![]), meter(3, vec![])]);
        assert_eq!(r.first_meter().unwrap().address, 1);
        assert_eq!(r.next_meter().unwrap().address, 2);
        assert_eq!(r.next_meter().unwrap().address, 3);
        assert_eq!(r.next_meter().unwrap().address, 1);
        assert_eq!(r.current_meter().unwrap().address, 1);
    }

    #[test]
    fn test_lookup_by_address() {
        let mut r = MeterRegistry::new(vec![meter(75, vec![]), meter(12, vec![])]);
        assert_eq!(r.meter_by_address(12).unwrap().name, "Meter 12");
        assert!(r.meter_by_address(13).is_none());
        r.meter_by_address_mut(75).unwrap().errors = 4;
        assert_eq!(r.current_meter().unwrap().errors, 4);
    }

    #[test]
    fn test_empty_registry() {
        let mut r = MeterRegistry::new(vec![]);
        assert!(r.is_empty());
        assert!(r.first_meter().is_none());
        assert!(r.next_meter().is_none());
        assert!(r.next_due_poll_index().is_none());
    }

    #[test]
    fn test_multiplier_schedule() {
        let mut r = MeterRegistry::new(vec![meter(1, vec![
            PollPlanEntry::new(10, 1),
            PollPlanEntry::new(20, 10),
        ])]);
        r.first_meter();

        let mut slow_sweeps = Vec::new();
        for n in 1..=25 {
            if sweep(&mut r).contains(&20) {
                slow_sweeps.push(n);
            }
        }
        assert_eq!(slow_sweeps, vec![1, 11, 21]);
    }

    #[test]
    fn test_every_sweep_ends_with_none() {
        let mut r = MeterRegistry::new(vec![meter(1, vec![PollPlanEntry::new(3, 1), PollPlanEntry::new(4, 1)])]);
        r.first_meter();
        assert_eq!(r.next_due_poll_index(), Some(3));
        assert_eq!(r.current_meter().unwrap().current_template(), Some(3));
        assert_eq!(r.next_due_poll_index(), Some(4));
        assert_eq!(r.next_due_poll_index(), None);
        assert_eq!(r.current_meter().unwrap().cursor, Some(1));
        assert_eq!(r.current_meter().unwrap().current_template(), Some(4));
    }

    #[test]
    fn test_cursor_stays_inside_plan() {
        let mut r = MeterRegistry::new(vec![meter(1, vec![PollPlanEntry::new(7, 1)]), meter(2, vec![PollPlanEntry::new(8, 3)])]);
        r.first_meter();
        for _ in 0..12 {
            while r.next_due_poll_index().is_some() {}
            let m = r.current_meter().unwrap();
            assert!(m.cursor.map_or(true, |c| c < m.plan.len()), "cursor {:?} outside plan of {}", m.cursor, m.plan.len());
            r.next_meter();
        }
    }

    #[test]
    fn test_nothing_due_keeps_auth_cursor() {
        let mut r = MeterRegistry::new(vec![meter(1, vec![PollPlanEntry::new(7, 5)])]);
        r.first_meter();
        assert_eq!(r.next_due_poll_index(), Some(7));
        r.next_meter();
        assert_eq!(r.next_due_poll_index(), None);
        assert_eq!(r.current_meter().unwrap().cursor, None);
    }

    #[test]
    fn test_replace_resets_position() {
        let mut r = MeterRegistry::new(vec![meter(1, vec![]), meter(2, vec![])]);
        r.next_meter();
        r.replace(vec![meter(5, vec![])]);
        assert_eq!(r.len(), 1);
        assert_eq!(r.current_meter().unwrap().address, 5);
        assert!(r.meter_by_address(2).is_none());
    }
}
