//! # gauntlet-git
//!
//! Git integration layer for gauntlet.
//!
//! This crate provides:
//! - Git command execution abstraction
//! - Working-tree content hashing
//! - Key/value storage on git notes
//! - Working directory resolution with traversal checks

mod command;
mod content_hash;
mod notes;
mod workdir;

pub use command::{ExecOptions, GitCommand, GitExecutor, GitOutput, MockGitExecutor, RecordedCall};
pub use content_hash::{
    ContentHashProvider, GitContentHash, SequenceContentHash, StaticContentHash,
    UnknownContentHash,
};
pub use notes::{validate_note_path, GitNoteStore, InMemoryNoteStore, NoteStore};
pub use workdir::{ResolvedWorkdir, WorkdirResolver};
