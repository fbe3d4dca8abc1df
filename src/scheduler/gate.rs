use std::collections::HashMap;

use chrono::{DateTime, Utc};

/// Remembers when each service last ran so slower frequency classes are honoured.
#[derive(Debug, Default)]
pub struct FrequencyGate {
    last_run: HashMap<String, DateTime<Utc>>,
}

impl FrequencyGate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn should_run(&self, key: &str, frequency_seconds: u64, now: DateTime<Utc>) -> bool {
        if frequency_seconds == 0 {
            return true;
        }
        match self.last_run.get(key) {
            None => true,
            Some(last) => (now - *last).num_seconds() >= frequency_seconds as i64,
        }
    }

    pub fn mark(&mut self, key: &str, now: DateTime<Utc>) {
        self.last_run.insert(key.to_string(), now);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_every_cycle_and_first_run() {
        let now = Utc::now();
        let mut gate = FrequencyGate::new();
        assert!(gate.should_run("a", 0, now));
        assert!(gate.should_run("a", 600, now));

        gate.mark("a", now);
        assert!(gate.should_run("a", 0, now));
        assert!(!gate.should_run("a", 600, now));
    }

    #[test]
    fn test_due_after_interval() {
        let start = Utc::now();
        let mut gate = FrequencyGate::new();
        gate.mark("svc", start);

        assert!(!gate.should_run("svc", 600, start + Duration::seconds(599)));
        assert!(gate.should_run("svc", 600, start + Duration::seconds(600)));
        assert!(gate.should_run("other", 600, start));
    }
}
