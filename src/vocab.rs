//! Symbol tables for non-terminals and terminals.
//!
//! Indices are dense and assigned in order of first interning; they are
//! stable for the lifetime of the grammar that owns the table.

use rustc_hash::FxHashMap;

/// Bidirectional map between symbol strings and dense `u32` indices.
#[derive(Debug, Clone, Default)]
pub struct SymbolTable {
    str_to_id: FxHashMap<Box<str>, u32>,
    id_to_str: Vec<Box<str>>,
}

impl SymbolTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Intern a string, returning its index.
    pub fn intern(&mut self, s: &str) -> u32 {
        if let Some(&id) = self.str_to_id.get(s) {
            return id;
        }

        let id = self.id_to_str.len() as u32;
        let boxed: Box<str> = s.into();
        self.str_to_id.insert(boxed.clone(), id);
        self.id_to_str.push(boxed);
        id
    }

    /// Look up the index of an already-interned string.
    pub fn get(&self, s: &str) -> Option<u32> {
        self.str_to_id.get(s).copied()
    }

    /// Look up the string for an index.
    pub fn resolve(&self, id: u32) -> Option<&str> {
        self.id_to_str.get(id as usize).map(|s| s.as_ref())
    }

    /// Resolve, falling back to `#<id>` for indices outside the table.
    pub fn display(&self, id: u32) -> String {
        match self.resolve(id) {
            Some(s) => s.to_string(),
            None => format!("#{}", id),
        }
    }

    pub fn len(&self) -> usize {
        self.id_to_str.len()
    }

    pub fn is_empty(&self) -> bool {
        self.id_to_str.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (u32, &str)> {
        self.id_to_str
            .iter()
            .enumerate()
            .map(|(i, s)| (i as u32, s.as_ref()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_intern_is_idempotent() {
        let mut table = SymbolTable::new();
        let np = table.intern("NP");
        let vp = table.intern("VP");
        assert_eq!(table.intern("NP"), np);
        assert_ne!(np, vp);
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn test_resolve_and_get() {
        let mut table = SymbolTable::new();
        let s = table.intern("S");
        assert_eq!(table.resolve(s), Some("S"));
        assert_eq!(table.get("S"), Some(s));
        assert_eq!(table.get("X"), None);
        assert_eq!(table.display(7), "#7");
    }
}
