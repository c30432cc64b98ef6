use std::{
    any::Any,
    collections::{HashMap, HashSet},
};

/// Well-known key under which the classifier publishes the scheduling profile.
pub const PROFILE_KEY: &str = "SchedulingProfile";

/// Per-cycle ephemeral state. Written by PreFilter plugins, read by the later
/// phases, discarded at cycle end.
#[derive(Default)]
pub struct CycleState {
    storage: HashMap<String, Box<dyn Any + Send + Sync>>,
    pub skip_filter_plugins: HashSet<String>,
    pub skip_score_plugins: HashSet<String>,
}

impl CycleState {
    pub fn read<T: 'static>(&self, key: &str) -> Option<&T> {
        self.storage.get(key).and_then(|v| v.downcast_ref())
    }

    pub fn write(&mut self, key: &str, value: Box<dyn Any + Send + Sync>) {
        self.storage.insert(key.to_string(), value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_write_typed() {
        let mut state = CycleState::default();
        state.write("answer", Box::new(42_u64));
        assert_eq!(state.read::<u64>("answer"), Some(&42));
        assert_eq!(state.read::<String>("answer"), None);
        assert_eq!(state.read::<u64>("missing"), None);
    }
}
