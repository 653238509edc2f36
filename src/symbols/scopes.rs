//! Lexical scope tree built from DWARF debug info
//!
//! Each subprogram, inlined subroutine and lexical block with an address range
//! becomes a scope linked to its nearest enclosing scope, so a program
//! counter inside an anonymous block can be walked outward to its function.

use std::borrow::Cow;
use std::ops::Range;
use std::rc::Rc;

use gimli::{AttributeValue, EndianRcSlice, Reader, RunTimeEndian};
use object::{Object, ObjectSection};
use tracing::debug;

type DwarfReader = EndianRcSlice<RunTimeEndian>;
type Dwarf = gimli::Dwarf<DwarfReader>;
type Unit = gimli::Unit<DwarfReader>;
type Entry<'abbrev, 'unit> = gimli::DebuggingInformationEntry<'abbrev, 'unit, DwarfReader>;

/// How many abstract-origin / specification hops are followed for a name.
const MAX_NAME_INDIRECTION: usize = 4;

#[derive(Debug, Clone)]
struct Scope {
    ranges: Vec<Range<u64>>,
    function: Option<String>,
    parent: Option<usize>,
    depth: usize,
}

impl Scope {
    fn contains(&self, pc: u64) -> bool {
        self.ranges.iter().any(|r| r.contains(&pc))
    }
}

/// All address-carrying scopes of a program
#[derive(Debug, Default)]
pub struct ScopeTree {
    scopes: Vec<Scope>,
}

impl ScopeTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load DWARF from an ELF image. Images without debug info give an empty tree.
    pub fn from_elf_bytes(data: &[u8]) -> anyhow::Result<Self> {
        let file = object::File::parse(data)?;
        let endian = if file.is_little_endian() {
            RunTimeEndian::Little
        } else {
            RunTimeEndian::Big
        };

        let load_section = |id: gimli::SectionId| -> Result<DwarfReader, gimli::Error> {
            let data = file
                .section_by_name(id.name())
                .and_then(|section| section.uncompressed_data().ok())
                .unwrap_or_else(|| Cow::Borrowed(&[][..]));
            Ok(EndianRcSlice::new(Rc::from(&*data), endian))
        };
        let dwarf = gimli::Dwarf::load(&load_section)?;

        let mut tree = Self::new();
        let mut units = dwarf.units();
        while let Some(header) = units.next()? {
            let unit = dwarf.unit(header)?;
            tree.add_unit(&dwarf, &unit)?;
        }

        debug!("Loaded {} DWARF scopes", tree.scopes.len());
        Ok(tree)
    }

    fn add_unit(&mut self, dwarf: &Dwarf, unit: &Unit) -> gimli::Result<()> {
        let mut entries = unit.entries();
        let mut depth: isize = 0;
        // (DIE depth, scope index if the DIE produced one)
        let mut stack: Vec<(isize, Option<usize>)> = Vec::new();

        while let Some((delta, entry)) = entries.next_dfs()? {
            depth += delta;
            while matches!(stack.last(), Some(&(d, _)) if d >= depth) {
                stack.pop();
            }
            let parent = stack.iter().rev().find_map(|&(_, scope)| scope);

            let tag = entry.tag();
            let scope = if tag == gimli::DW_TAG_subprogram
                || tag == gimli::DW_TAG_inlined_subroutine
                || tag == gimli::DW_TAG_lexical_block
            {
                let mut ranges = Vec::new();
                let mut iter = dwarf.die_ranges(unit, entry)?;
                while let Some(range) = iter.next()? {
                    if range.begin < range.end {
                        ranges.push(range.begin..range.end);
                    }
                }
                if ranges.is_empty() {
                    None
                } else {
                    let function = if tag == gimli::DW_TAG_lexical_block {
                        None
                    } else {
                        die_name(dwarf, unit, entry, MAX_NAME_INDIRECTION)?
                    };
                    Some(self.push_scope(ranges, function.as_deref(), parent))
                }
            } else {
                None
            };

            stack.push((depth, scope));
        }
        Ok(())
    }

    /// Add a scope nested in `parent` and return its index.
    pub fn push_scope(
        &mut self,
        ranges: Vec<Range<u64>>,
        function: Option<&str>,
        parent: Option<usize>,
    ) -> usize {
        let depth = parent.map_or(0, |p| self.scopes[p].depth + 1);
        self.scopes.push(Scope {
            ranges,
            function: function.map(str::to_string),
            parent,
            depth,
        });
        self.scopes.len() - 1
    }

    /// Name of the function enclosing `pc`, starting at the innermost scope.
    pub fn function_for(&self, pc: u64) -> Option<&str> {
        let (innermost, _) = self
            .scopes
            .iter()
            .enumerate()
            .filter(|(_, scope)| scope.contains(pc))
            .max_by_key(|(_, scope)| scope.depth)?;

        let mut current = Some(innermost);
        while let Some(index) = current {
            let scope = &self.scopes[index];
            if let Some(name) = &scope.function {
                return Some(name);
            }
            current = scope.parent;
        }
        None
    }

    pub fn len(&self) -> usize {
        self.scopes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scopes.is_empty()
    }
}

fn die_name(dwarf: &Dwarf, unit: &Unit, entry: &Entry<'_, '_>, hops: usize) -> gimli::Result<Option<String>> {
    if let Some(value) = entry.attr_value(gimli::DW_AT_name)? {
        let name = dwarf.attr_string(unit, value)?;
        return Ok(Some(name.to_string_lossy()?.into_owned()));
    }
    if hops == 0 {
        return Ok(None);
    }
    for attr in [gimli::DW_AT_abstract_origin, gimli::DW_AT_specification] {
        if let Some(AttributeValue::UnitRef(offset)) = entry.attr_value(attr)? {
            let origin = unit.entry(offset)?;
            return die_name(dwarf, unit, &origin, hops - 1);
        }
    }
    Ok(None)
}
