use std::collections::HashMap;
use std::path::Path;

/// Function symbols sorted by address, plus data objects by name.
#[derive(Debug, Default)]
pub struct SymbolTable {
    symbols: Vec<Symbol>,
    objects: HashMap<String, u64>,
}

#[derive(Debug, Clone)]
struct Symbol {
    name: String,
    address: u64,
    size: u64,
}

/// Maximum offset heuristic for symbols with size=0.
const MAX_ZERO_SIZE_OFFSET: u64 = 4096;

impl SymbolTable {
    /// Parse an ELF file and collect its symbols.
    pub fn from_elf(path: &Path) -> anyhow::Result<Self> {
        let data = std::fs::read(path)?;
        Self::from_elf_bytes(&data)
    }

    /// Parse ELF bytes: function symbols sorted by address, data objects by name.
    pub fn from_elf_bytes(data: &[u8]) -> anyhow::Result<Self> {
        let elf = goblin::elf::Elf::parse(data)?;
        let mut symbols = Vec::new();
        let mut objects = HashMap::new();

        for sym in &elf.syms {
            if sym.st_value == 0 {
                continue;
            }
            let Some(name) = elf.strtab.get_at(sym.st_name) else {
                continue;
            };
            if name.is_empty() {
                continue;
            }
            if sym.is_function() {
                symbols.push(Symbol {
                    name: name.to_string(),
                    // Clear Thumb bit (bit 0) for ARM
                    address: sym.st_value & !1,
                    size: sym.st_size,
                });
            } else if sym.st_type() == goblin::elf::sym::STT_OBJECT {
                objects.entry(name.to_string()).or_insert(sym.st_value);
            }
        }

        symbols.sort_by_key(|s| s.address);
        // Deduplicate by address (keep first occurrence)
        symbols.dedup_by_key(|s| s.address);

        Ok(Self { symbols, objects })
    }

    /// Build a SymbolTable directly from (name, address, size) function tuples.
    /// Useful for testing.
    pub fn from_entries(entries: Vec<(&str, u64, u64)>) -> Self {
        let mut symbols: Vec<Symbol> = entries
            .into_iter()
            .map(|(name, addr, size)| Symbol {
                name: name.to_string(),
                address: addr & !1, // clear Thumb bit
                size,
            })
            .collect();
        symbols.sort_by_key(|s| s.address);
        Self {
            symbols,
            objects: HashMap::new(),
        }
    }

    /// Register a data object, e.g. a kernel global located some other way.
    pub fn add_object(&mut self, name: &str, address: u64) {
        self.objects.insert(name.to_string(), address);
    }

    /// Address of a data object by name.
    pub fn object_address(&self, name: &str) -> Option<u64> {
        self.objects.get(name).copied()
    }

    /// Resolve an address to the containing function symbol.
    /// Clears Thumb bit before lookup.
    pub fn resolve(&self, addr: u64) -> Option<&str> {
        if self.symbols.is_empty() {
            return None;
        }

        let addr = addr & !1; // clear Thumb bit

        // Binary search: find the last symbol with address <= addr
        let idx = match self.symbols.binary_search_by_key(&addr, |s| s.address) {
            Ok(i) => i,
            Err(0) => return None, // addr is before all symbols
            Err(i) => i - 1,
        };

        let sym = &self.symbols[idx];
        let offset = addr - sym.address;

        let within = if sym.size > 0 {
            offset < sym.size
        } else {
            // Zero-size symbol: use heuristic max offset
            offset <= MAX_ZERO_SIZE_OFFSET
        };

        within.then_some(sym.name.as_str())
    }

    pub fn symbol_count(&self) -> usize {
        self.symbols.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_table(entries: Vec<(&str, u64, u64)>) -> SymbolTable {
        SymbolTable::from_entries(entries)
    }

    #[test]
    fn test_resolve_exact_address() {
        let table = make_table(vec![("chThdSleep", 0x08000100, 64)]);
        assert_eq!(table.resolve(0x08000100), Some("chThdSleep"));
        assert_eq!(table.resolve(0x0800013F), Some("chThdSleep"));
    }

    #[test]
    fn test_resolve_address_outside_symbols() {
        let table = make_table(vec![
            ("func_a", 0x08000100, 32),
            ("func_b", 0x08000200, 32),
        ]);
        assert!(table.resolve(0x08000050).is_none());
        assert!(table.resolve(0x08000150).is_none());
        assert!(table.resolve(0x08000220).is_none());
    }

    #[test]
    fn test_resolve_zero_size_symbol() {
        let table = make_table(vec![("_port_switch_from_isr", 0x08000100, 0)]);
        assert_eq!(table.resolve(0x08000104), Some("_port_switch_from_isr"));
        assert!(table.resolve(0x08000100 + 4098).is_none());
    }

    #[test]
    fn test_thumb_bit_cleared() {
        let table = make_table(vec![("main", 0x08000100, 64)]);
        assert_eq!(table.resolve(0x08000111), Some("main"));
        assert_eq!(table.resolve(0x08000101), Some("main"));
    }

    #[test]
    fn test_adjacent_symbols() {
        let table = make_table(vec![
            ("func_a", 0x08000100, 32),
            ("func_b", 0x08000120, 32),
        ]);
        assert_eq!(table.resolve(0x0800011F), Some("func_a"));
        assert_eq!(table.resolve(0x08000120), Some("func_b"));
    }

    #[test]
    fn test_empty_table() {
        let table = make_table(vec![]);
        assert!(table.resolve(0x08000100).is_none());
        assert_eq!(table.symbol_count(), 0);
    }

    #[test]
    fn test_object_lookup() {
        let mut table = make_table(vec![]);
        assert!(table.object_address("rlist").is_none());
        table.add_object("rlist", 0x2000_0800);
        assert_eq!(table.object_address("rlist"), Some(0x2000_0800));
    }

    #[test]
    fn test_from_elf_nonexistent_file() {
        let result = SymbolTable::from_elf(Path::new("/nonexistent/file.elf"));
        assert!(result.is_err());
    }

    #[test]
    fn test_from_elf_invalid_file() {
        let tmp = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(tmp.path(), b"not an elf file").unwrap();
        let result = SymbolTable::from_elf(tmp.path());
        assert!(result.is_err());
    }
}
