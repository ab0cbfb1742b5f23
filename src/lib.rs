//! Translator from a typed AST to stack bytecode, and the virtual machine
//! that runs it.
//!
//! The pipeline is [`translator::translate`] followed by [`vm::execute`].
//! [`interpreter`] walks the AST directly and is the reference the compiled
//! pipeline's output is compared against.

pub mod ast;
pub mod bytecode;
pub mod diagnostic;
pub mod interpreter;
pub mod program;
pub mod translator;
pub mod vm;
