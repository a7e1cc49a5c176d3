//! String -> u32 interning, standing in for the original's `SpaIDMap`. All
//! event/command/type comparisons in the core are by resolved id, never by
//! string.

use std::collections::HashMap;
use std::sync::{Mutex, RwLock};

pub struct TypeMap {
    by_name: RwLock<HashMap<String, u32>>,
    by_id: Mutex<Vec<String>>,
}

impl Default for TypeMap {
    fn default() -> Self {
        Self::new()
    }
}

impl TypeMap {
    pub fn new() -> Self {
        Self {
            by_name: RwLock::new(HashMap::new()),
            by_id: Mutex::new(Vec::new()),
        }
    }

    /// Interns `name`, returning its id. Repeated calls with the same name
    /// return the same id.
    pub fn intern(&self, name: &str) -> u32 {
        if let Some(id) = self.by_name.read().unwrap().get(name) {
            return *id;
        }
        let mut by_name = self.by_name.write().unwrap();
        if let Some(id) = by_name.get(name) {
            return *id;
        }
        let mut by_id = self.by_id.lock().unwrap();
        let id = by_id.len() as u32;
        by_id.push(name.to_string());
        by_name.insert(name.to_string(), id);
        id
    }

    pub fn id_of(&self, name: &str) -> Option<u32> {
        self.by_name.read().unwrap().get(name).copied()
    }

    pub fn name_of(&self, id: u32) -> Option<String> {
        self.by_id.lock().unwrap().get(id as usize).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interning_is_stable() {
        let map = TypeMap::new();
        let a = map.intern("NeedInput");
        let b = map.intern("HaveOutput");
        let a2 = map.intern("NeedInput");
        assert_eq!(a, a2);
        assert_ne!(a, b);
        assert_eq!(map.name_of(a).as_deref(), Some("NeedInput"));
    }
}
