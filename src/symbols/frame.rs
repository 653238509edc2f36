//! Program counter to function descriptions

use std::fmt;
use std::path::Path;

use tracing::{debug, warn};

use super::{ScopeTree, SymbolTable};

/// Function name used when nothing covers an address.
pub const UNKNOWN_FUNCTION: &str = "??";

/// The function a program counter sits in, with its display form
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameDescriptor {
    pub pc: u32,
    pub function: String,
}

impl FrameDescriptor {
    pub fn is_symbolized(&self) -> bool {
        self.function != UNKNOWN_FUNCTION
    }
}

impl fmt::Display for FrameDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:X} in {} ()", self.pc, self.function)
    }
}

/// Resolves frames from DWARF scopes first, then ELF function symbols
#[derive(Debug, Default)]
pub struct FrameResolver {
    scopes: ScopeTree,
    symbols: SymbolTable,
}

impl FrameResolver {
    pub fn new(scopes: ScopeTree, symbols: SymbolTable) -> Self {
        Self { scopes, symbols }
    }

    /// Resolver backed only by a symbol table.
    pub fn from_symbols(symbols: SymbolTable) -> Self {
        Self::new(ScopeTree::new(), symbols)
    }

    /// Load both sources from a firmware image. Missing DWARF is not an error.
    pub fn from_elf(path: &Path) -> anyhow::Result<Self> {
        let data = std::fs::read(path)?;
        let symbols = SymbolTable::from_elf_bytes(&data)?;
        let scopes = ScopeTree::from_elf_bytes(&data).unwrap_or_else(|e| {
            warn!("No usable DWARF in {}: {}", path.display(), e);
            ScopeTree::new()
        });
        debug!(
            "Frame resolver for {}: {} scopes, {} function symbols",
            path.display(),
            scopes.len(),
            symbols.symbol_count()
        );
        Ok(Self::new(scopes, symbols))
    }

    pub fn symbols(&self) -> &SymbolTable {
        &self.symbols
    }

    /// Describe the function containing `pc`. Never fails.
    pub fn resolve(&self, pc: u32) -> FrameDescriptor {
        let addr = (pc & !1) as u64;
        let function = self
            .scopes
            .function_for(addr)
            .map(str::to_string)
            .or_else(|| self.symbols.resolve(addr).map(str::to_string))
            .unwrap_or_else(|| UNKNOWN_FUNCTION.to_string());
        FrameDescriptor { pc, function }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_format() {
        let frame = FrameDescriptor {
            pc: 0x0800_1A2B,
            function: "chSchGoSleepS".to_string(),
        };
        assert_eq!(frame.to_string(), "0x8001A2B in chSchGoSleepS ()");
    }

    #[test]
    fn test_scope_takes_precedence_over_symbol() {
        let mut scopes = ScopeTree::new();
        let outer = scopes.push_scope(vec![0x0800_0100..0x0800_0200], Some("chThdSleep"), None);
        scopes.push_scope(vec![0x0800_0120..0x0800_0130], Some("chVTSetI"), Some(outer));
        let symbols = SymbolTable::from_entries(vec![("chThdSleep", 0x0800_0100, 0x100)]);
        let resolver = FrameResolver::new(scopes, symbols);

        assert_eq!(resolver.resolve(0x0800_0125).function, "chVTSetI");
    }

    #[test]
    fn test_falls_back_to_symbols() {
        let symbols = SymbolTable::from_entries(vec![("_port_switch_from_isr", 0x0800_0400, 8)]);
        let resolver = FrameResolver::from_symbols(symbols);

        let frame = resolver.resolve(0x0800_0405);
        assert_eq!(frame.function, "_port_switch_from_isr");
        assert_eq!(frame.pc, 0x0800_0405);
        assert!(frame.is_symbolized());
    }

    #[test]
    fn test_unknown_address_placeholder() {
        let resolver = FrameResolver::default();
        let frame = resolver.resolve(0xFFFF_FFFF);
        assert_eq!(frame.function, UNKNOWN_FUNCTION);
        assert!(!frame.is_symbolized());
        assert_eq!(frame.to_string(), "0xFFFFFFFF in ?? ()");
    }
}
