//! Symbol lookup for frame descriptions and kernel globals

pub mod frame;
pub mod resolver;
pub mod scopes;

pub use frame::{FrameDescriptor, FrameResolver, UNKNOWN_FUNCTION};
pub use resolver::SymbolTable;
pub use scopes::ScopeTree;
