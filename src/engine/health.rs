use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};

use crate::db::Database;
use crate::engine::bus::{self, Envelope, EventBus};

/// Consecutive failures before an agent is demoted (SPEC_FULL.md §4.F).
/// Exponential backoff on repeated demotions is out of scope; the cooldown
/// is a fixed 5 minutes every time.
const DEMOTION_THRESHOLD: u32 = 3;
const COOLDOWN_MINUTES: i64 = 5;

#[derive(Debug, Clone)]
pub struct AgentHealth {
    pub healthy: bool,
    pub diseased_until: Option<DateTime<Utc>>,
    pub consecutive_errors: u32,
}

impl Default for AgentHealth {
    fn default() -> Self {
        Self { healthy: true, diseased_until: None, consecutive_errors: 0 }
    }
}

/// Process-local health state per agent id, grouped by agent group for
/// round-robin selection. Not persisted: on restart every agent starts
/// healthy again, matching the reference's in-memory-only worker status.
pub struct HealthTracker {
    agents: Mutex<HashMap<String, AgentHealth>>,
    cursors: Mutex<HashMap<String, usize>>,
    db: Database,
    bus: Arc<EventBus>,
}

impl HealthTracker {
    pub fn new(db: Database, bus: Arc<EventBus>) -> Self {
        Self { agents: Mutex::new(HashMap::new()), cursors: Mutex::new(HashMap::new()), db, bus }
    }

    /// Pick the first healthy agent in `group_agents` starting from the
    /// group's rotating cursor. If none are healthy, fall back to the one
    /// whose cooldown expires soonest. Returns `None` for an empty group.
    pub fn pick(&self, group_id: &str, group_agents: &[String]) -> Option<String> {
        if group_agents.is_empty() {
            return None;
        }

        let mut cursors = self.cursors.lock().unwrap();
        let cursor = cursors.entry(group_id.to_string()).or_insert(0);
        let len = group_agents.len();

        let agents = self.agents.lock().unwrap();

        for i in 0..len {
            let idx = (*cursor + i) % len;
            let agent_id = &group_agents[idx];
            let healthy = agents.get(agent_id).map(|h| h.healthy).unwrap_or(true);
            if healthy {
                *cursor = (idx + 1) % len;
                return Some(agent_id.clone());
            }
        }

        group_agents
            .iter()
            .min_by_key(|agent_id| {
                agents
                    .get(agent_id.as_str())
                    .and_then(|h| h.diseased_until)
                    .unwrap_or(DateTime::<Utc>::MIN_UTC)
            })
            .cloned()
    }

    pub fn report_success(&self, task_id: &str, agent_id: &str) -> Result<(), crate::db::DbError> {
        let mut agents = self.agents.lock().unwrap();
        let entry = agents.entry(agent_id.to_string()).or_default();
        let changed = !entry.healthy;
        entry.healthy = true;
        entry.consecutive_errors = 0;
        entry.diseased_until = None;
        drop(agents);

        if changed {
            bus::record_and_publish(&self.db, &self.bus, Envelope::AgentHealthChanged {
                task_id: task_id.to_string(),
                agent_id: agent_id.to_string(),
                healthy: true,
            })?;
        }
        Ok(())
    }

    pub fn report_failure(&self, task_id: &str, agent_id: &str) -> Result<(), crate::db::DbError> {
        let mut agents = self.agents.lock().unwrap();
        let entry = agents.entry(agent_id.to_string()).or_default();
        entry.consecutive_errors += 1;

        let demoted = entry.consecutive_errors >= DEMOTION_THRESHOLD && entry.healthy;
        if entry.consecutive_errors >= DEMOTION_THRESHOLD {
            entry.healthy = false;
            entry.diseased_until = Some(Utc::now() + Duration::minutes(COOLDOWN_MINUTES));
        }
        drop(agents);

        if demoted {
            bus::record_and_publish(&self.db, &self.bus, Envelope::AgentHealthChanged {
                task_id: task_id.to_string(),
                agent_id: agent_id.to_string(),
                healthy: false,
            })?;
        }
        Ok(())
    }

    pub fn snapshot(&self, agent_id: &str) -> AgentHealth {
        self.agents.lock().unwrap().get(agent_id).cloned().unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker() -> HealthTracker {
        HealthTracker::new(crate::db::Database::open_in_memory().unwrap(), Arc::new(EventBus::new()))
    }

    #[test]
    fn pick_returns_none_for_empty_group() {
        let t = tracker();
        assert_eq!(t.pick("g1", &[]), None);
    }

    #[test]
    fn pick_rotates_across_calls() {
        let t = tracker();
        let agents = vec!["a".to_string(), "b".to_string(), "c".to_string()];

        let first = t.pick("g1", &agents).unwrap();
        let second = t.pick("g1", &agents).unwrap();
        let third = t.pick("g1", &agents).unwrap();
        let fourth = t.pick("g1", &agents).unwrap();

        assert_eq!(first, "a");
        assert_eq!(second, "b");
        assert_eq!(third, "c");
        assert_eq!(fourth, "a");
    }

    #[test]
    fn report_failure_demotes_after_threshold() {
        let t = tracker();
        t.report_failure("t1", "a").unwrap();
        t.report_failure("t1", "a").unwrap();
        assert!(t.snapshot("a").healthy);

        t.report_failure("t1", "a").unwrap();
        let health = t.snapshot("a");
        assert!(!health.healthy);
        assert!(health.diseased_until.is_some());
    }

    #[test]
    fn report_success_resets_state() {
        let t = tracker();
        t.report_failure("t1", "a").unwrap();
        t.report_failure("t1", "a").unwrap();
        t.report_failure("t1", "a").unwrap();
        assert!(!t.snapshot("a").healthy);

        t.report_success("t1", "a").unwrap();
        let health = t.snapshot("a");
        assert!(health.healthy);
        assert_eq!(health.consecutive_errors, 0);
        assert!(health.diseased_until.is_none());
    }

    #[test]
    fn pick_skips_unhealthy_agents() {
        let t = tracker();
        let agents = vec!["a".to_string(), "b".to_string()];
        t.report_failure("t1", "a").unwrap();
        t.report_failure("t1", "a").unwrap();
        t.report_failure("t1", "a").unwrap();

        let picked = t.pick("g1", &agents).unwrap();
        assert_eq!(picked, "b");
    }

    #[test]
    fn pick_falls_back_to_earliest_cooldown_when_all_unhealthy() {
        let t = tracker();
        let agents = vec!["a".to_string(), "b".to_string()];
        for agent in &agents {
            t.report_failure("t1", agent).unwrap();
            t.report_failure("t1", agent).unwrap();
            t.report_failure("t1", agent).unwrap();
        }

        let picked = t.pick("g1", &agents);
        assert!(picked.is_some());
    }

    #[test]
    fn health_change_publishes_event_only_on_transition() {
        let bus = Arc::new(EventBus::new());
        let t = HealthTracker::new(crate::db::Database::open_in_memory().unwrap(), bus.clone());
        let mut sub = bus.subscribe();

        t.report_failure("t1", "a").unwrap();
        assert!(sub.durable.try_recv().is_err());

        t.report_failure("t1", "a").unwrap();
        t.report_failure("t1", "a").unwrap();
        let event = sub.durable.try_recv().unwrap();
        assert_eq!(event.envelope.event_type(), "agent_health_changed");

        assert!(sub.durable.try_recv().is_err());
    }
}
