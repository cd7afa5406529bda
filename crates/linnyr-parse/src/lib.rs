pub mod compiler;
pub mod instr;
pub mod reference;
pub mod tokenizer;

pub use compiler::{Compiled, Compiler, CompilerError, RefInfo, ReferenceClassifier};
pub use instr::{disassemble, Instr, Symbol};
pub use reference::{RunSpec, Stat, StatSpec, VarSpec};
pub use tokenizer::{Token, TokenizerError, tokenize};

// Re-export common types
pub use linnyr_common::{Anchor, EntityKind, EntityRef, ErrorKind, Value};
