//! Agent registry helpers.

use chrono::Utc;
use uuid::Uuid;

use crate::agents::decision::DecisionSourceKind;
use crate::store::tables::{AgentRecord, AgentsTable};
use crate::store::{StoreError, TypedStore};

/// All active agents, in stable (id) order.
pub fn active_agents(store: &TypedStore) -> Result<Vec<AgentRecord>, StoreError> {
    Ok(store
        .scan::<AgentsTable>()?
        .into_iter()
        .map(|(_, agent)| agent)
        .filter(|agent| agent.active)
        .collect())
}

pub fn get_agent(store: &TypedStore, agent_id: Uuid) -> Result<Option<AgentRecord>, StoreError> {
    store.get::<AgentsTable>(&agent_id)
}

/// Case-insensitive lookup by name, for CLI commands.
pub fn find_by_name(store: &TypedStore, name: &str) -> Result<Option<AgentRecord>, StoreError> {
    let needle = name.to_lowercase();
    Ok(store
        .scan::<AgentsTable>()?
        .into_iter()
        .map(|(_, agent)| agent)
        .find(|agent| agent.name.to_lowercase() == needle))
}

pub fn create_agent(
    store: &TypedStore,
    name: &str,
    strategy: &str,
    instructions: &str,
    source: DecisionSourceKind,
) -> Result<AgentRecord, StoreError> {
    let record = AgentRecord {
        id: Uuid::new_v4(),
        name: name.to_string(),
        strategy: strategy.to_string(),
        instructions: instructions.to_string(),
        source,
        active: true,
        created_at: Utc::now(),
    };
    store.put::<AgentsTable>(&record.id, &record)?;
    Ok(record)
}

pub fn set_active(store: &TypedStore, agent_id: Uuid, active: bool) -> Result<(), StoreError> {
    if let Some(mut agent) = store.get::<AgentsTable>(&agent_id)? {
        agent.active = active;
        store.put::<AgentsTable>(&agent_id, &agent)?;
    }
    Ok(())
}

/// Seed the default roster. Existing names are left untouched.
/// Returns how many agents were created.
pub fn seed_default_agents(store: &TypedStore) -> Result<usize, StoreError> {
    let defaults = [
        (
            "steady",
            "Holds through everything",
            "Hold your positions. Do not trade.",
            DecisionSourceKind::EchoHold,
        ),
        (
            "maverick",
            "Aggressive size, exercises the risk limits",
            "Take large positions whenever possible.",
            DecisionSourceKind::Mock,
        ),
        (
            "navigator",
            "Model-driven momentum trader",
            "Trade BTC and ETH on momentum. Keep position sizes moderate \
             and prefer closing losers early.",
            DecisionSourceKind::ModelBacked,
        ),
    ];

    let mut created = 0;
    for (name, strategy, instructions, source) in defaults {
        if find_by_name(store, name)?.is_some() {
            continue;
        }
        create_agent(store, name, strategy, instructions, source)?;
        created += 1;
    }

    Ok(created)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_temp() -> (TypedStore, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = TypedStore::open(dir.path()).unwrap();
        (store, dir)
    }

    #[test]
    fn test_seed_is_idempotent() {
        let (store, _dir) = open_temp();
        assert_eq!(seed_default_agents(&store).unwrap(), 3);
        assert_eq!(seed_default_agents(&store).unwrap(), 0);
    }

    #[test]
    fn test_active_filter() {
        let (store, _dir) = open_temp();
        let kept = create_agent(&store, "kept", "", "", DecisionSourceKind::EchoHold).unwrap();
        let dropped =
            create_agent(&store, "dropped", "", "", DecisionSourceKind::EchoHold).unwrap();
        set_active(&store, dropped.id, false).unwrap();

        let active = active_agents(&store).unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, kept.id);
    }

    #[test]
    fn test_find_by_name_is_case_insensitive() {
        let (store, _dir) = open_temp();
        create_agent(&store, "Navigator", "", "", DecisionSourceKind::ModelBacked).unwrap();
        assert!(find_by_name(&store, "navigator").unwrap().is_some());
        assert!(find_by_name(&store, "nobody").unwrap().is_none());
    }
}
