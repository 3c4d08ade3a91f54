//! Agent selection for new instances

use crate::models::Agent;
use std::collections::HashMap;

/// Agent with the fewest assigned instances; ties go to the smallest agent id
pub fn least_loaded<'a>(agents: &'a [Agent], load: &HashMap<String, usize>) -> Option<&'a Agent> {
    agents.iter().min_by(|a, b| {
        let la = load.get(&a.agent_id).copied().unwrap_or(0);
        let lb = load.get(&b.agent_id).copied().unwrap_or(0);
        la.cmp(&lb).then_with(|| a.agent_id.cmp(&b.agent_id))
    })
}
