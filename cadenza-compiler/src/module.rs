//! Per compilation module state: monotonic state slot allocation and
//! the external symbol table the backend turns into runtime metadata.

use crate::{graph::generic::Variety, typ::Type};
use arcstr::ArcStr;
use fxhash::FxHashMap;
use indexmap::IndexMap;

/// one external input/output of the compiled instance
#[derive(Debug, Clone)]
pub struct SymbolEntry {
    pub uid: u64,
    pub ty: Type,
    pub variety: Variety,
    /// rate relative to the reference clock
    pub rate: (f64, f64),
    /// clock metadata of the driving signature
    pub clock: Type,
}

/// Module wide allocation state threaded through the side effect
/// transform and consumed by the code generator.
#[derive(Debug, Default)]
pub struct BuildModule {
    pub argument_type: Type,
    pub result_type: Type,
    slots: FxHashMap<u64, u32>,
    next_slot: u32,
    next_uid: u64,
    symbols: IndexMap<ArcStr, SymbolEntry>,
}

impl BuildModule {
    pub fn new(argument_type: Type, result_type: Type) -> Self {
        BuildModule {
            argument_type,
            result_type,
            slots: FxHashMap::default(),
            next_slot: 0,
            next_uid: 0,
            symbols: IndexMap::new(),
        }
    }

    pub fn next_uid(&mut self) -> u64 {
        self.next_uid += 1;
        self.next_uid
    }

    /// the state slot index for `uid`, allocating monotonically on
    /// first sight
    pub fn get_index(&mut self, uid: u64) -> u32 {
        match self.slots.get(&uid) {
            Some(i) => *i,
            None => {
                let i = self.next_slot;
                self.next_slot += 1;
                self.slots.insert(uid, i);
                i
            }
        }
    }

    pub fn slot_count(&self) -> u32 {
        self.next_slot
    }

    pub fn register_symbol(&mut self, key: ArcStr, entry: SymbolEntry) {
        self.symbols.entry(key).or_insert(entry);
    }

    pub fn symbols(&self) -> impl Iterator<Item = (&ArcStr, &SymbolEntry)> {
        self.symbols.iter()
    }

    pub fn symbol(&self, key: &str) -> Option<&SymbolEntry> {
        self.symbols.get(key)
    }

    pub fn symbol_count(&self) -> usize {
        self.symbols.len()
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn slot_indices_are_monotonic_and_stable() {
        let mut m = BuildModule::new(Type::Nil, Type::Nil);
        let a = m.next_uid();
        let b = m.next_uid();
        assert_eq!(m.get_index(a), 0);
        assert_eq!(m.get_index(b), 1);
        assert_eq!(m.get_index(a), 0);
        assert_eq!(m.slot_count(), 2);
    }

    #[test]
    fn symbols_keep_insertion_order() {
        let mut m = BuildModule::new(Type::Nil, Type::Nil);
        for key in ["zeta", "alpha", "mid"] {
            let uid = m.next_uid();
            m.register_symbol(
                ArcStr::from(key),
                SymbolEntry {
                    uid,
                    ty: Type::Float32,
                    variety: Variety::Stream,
                    rate: (1.0, 1.0),
                    clock: Type::Nil,
                },
            );
        }
        let keys: Vec<&str> = m.symbols().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, vec!["zeta", "alpha", "mid"]);
    }
}
