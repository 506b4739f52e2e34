//! A scriptable client library for the Language Server Protocol.
//!
//! `scribe-lsp` drives one or more language servers over JSON-RPC: it opens
//! workspaces, mirrors text documents with editor-like fidelity (queued
//! edits, versioning, position encodings) and exposes the semantic requests
//! of the protocol (symbols, references, renames, workspace edits).
//!
//! The entry point is [`Workspace`]: launch a [`Client`] into it, open a
//! [`Document`] and start editing. Lower layers ([`jsonrpc`], the framed
//! transport, the capability registry) are usable on their own for hosts
//! that need finer control.

mod capabilities;
mod client;
mod connection;
mod document;
mod filters;
pub mod jsonrpc;
mod languages;
mod symbol;
mod transport;
mod workspace;

pub use lsp_types as lsp;

pub use capabilities::{
    FeatureQuery, FeatureRegistration, RegistrationOptions, SemanticTokensVariant,
    TextDocumentInfo,
};
pub use client::{
    default_client_capabilities, default_initialize_params, Client, ClientState,
    WorkspaceRequestHandler,
};
pub use connection::{Connect, LaunchParams};
pub use document::{Document, TextDocument};
pub use languages::LanguageDatabase;
pub use symbol::{OutlineSymbol, Symbol, UnresolvedSymbol};
pub use workspace::{ConfigurationProvider, CreateOptions, OpenOptions, Workspace};

pub use lsp::{Position, Url};

pub type Result<T> = core::result::Result<T, Error>;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("protocol error: {0}")]
    Rpc(#[from] jsonrpc::Error),
    #[error("failed to parse: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("request {0:?} timed out")]
    Timeout(jsonrpc::Id),
    #[error("server has stopped")]
    ServerStopped,
    #[error("invalid client state {actual}, expected {expected}")]
    InvalidState {
        expected: &'static str,
        actual: ClientState,
    },
    #[error("server does not support {0}")]
    FeatureUnsupported(String),
    #[error("text document {0} is closed")]
    DocumentClosed(lsp::Url),
    #[error("edit range [{from}, {to}) is out of bounds for a document of length {len}")]
    EditOutOfBounds { from: usize, to: usize, len: usize },
    #[error("edit {new} overlaps queued edit {existing}")]
    OverlappingEdits { new: String, existing: String },
    #[error("position {line}:{character} does not exist in the document")]
    PositionOutOfBounds { line: u32, character: u32 },
    #[error("offset {0} is out of bounds")]
    OffsetOutOfBounds(usize),
    #[error("unable to determine a language id for '{0}'")]
    UnknownLanguage(std::path::PathBuf),
    #[error("relative path '{0}' is ambiguous in this workspace")]
    AmbiguousPath(std::path::PathBuf),
    #[error("'{0}' already exists")]
    AlreadyExists(std::path::PathBuf),
    #[error("'{0}' not found in workspace")]
    NotFound(std::path::PathBuf),
    #[error("document {uri} is at version {actual}, but the edit targets version {expected}")]
    VersionMismatch {
        uri: lsp::Url,
        expected: i32,
        actual: i32,
    },
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// The code-unit convention a server counts column positions in.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum OffsetEncoding {
    /// UTF-8 code units aka bytes
    #[serde(rename = "utf-8")]
    Utf8,
    /// UTF-16 code units, the protocol's historical default
    #[default]
    #[serde(rename = "utf-16")]
    Utf16,
    /// UTF-32 code units aka codepoints
    #[serde(rename = "utf-32")]
    Utf32,
}
