//! Testing utilities for the build orchestrator
//!
//! - **mock_compiler**: a toy compiler implementing the compiler traits
//! - **fixtures**: helpers that lay out projects on disk
//!
//! # Usage
//!
//! ```ignore
//! use polyemit_build::testing::{MockCompiler, ProjectFixture};
//!
//! let temp_dir = tempfile::TempDir::new()?;
//! let fixture = ProjectFixture::new(temp_dir.path());
//! fixture.tool("5.4.5")?;
//! fixture.write("src/index.ts", "export const a = 1;")?;
//! ```

pub mod fixtures;
pub mod mock_compiler;

pub use fixtures::ProjectFixture;
pub use mock_compiler::{
    declaration_text, transpile_text, EmitFault, MockCompiler, MockProgram, MockTranspiler, CRASH_MARKER,
};
