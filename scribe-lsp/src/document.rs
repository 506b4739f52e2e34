//! The in-memory mirror of a file.
//!
//! A [`TextDocument`] owns its text (a rope), version and queued edits; all
//! mutation goes through the edit API. Documents are shared by every client
//! of their workspace: one in-memory copy, with `didOpen`/`didChange`/
//! `didSave`/`didClose` fanned out to the clients that support them.
//!
//! Offsets in this API are codepoint offsets into the text. Conversion to
//! and from protocol positions depends on the position encoding negotiated
//! with the individual server.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};

use log::warn;
use parking_lot::Mutex;
use ropey::{Rope, RopeSlice};

use crate::capabilities::{FeatureQuery, TextDocumentInfo};
use crate::client::Client;
use crate::lsp;
use crate::workspace::WorkspaceInner;
use crate::{Error, OffsetEncoding, Result};

/// A queued text replacement, in codepoint offsets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Edit {
    pub from: usize,
    pub to: usize,
    pub text: String,
}

impl Edit {
    /// Two edits overlap when their `[from, to)` ranges intersect. The
    /// strict comparison on `to` lets zero-length insertions at the same
    /// offset coexist; those are applied in insertion order.
    fn overlaps(&self, other: &Edit) -> bool {
        let covers_from = self.from <= other.from && self.to > other.from;
        let covers_to = self.from < other.to && self.to >= other.to;
        let covers_both = self.from >= other.from && self.to < other.to;
        covers_from || covers_to || covers_both
    }
}

impl std::fmt::Display for Edit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.from == self.to {
            write!(f, "insert {:?} at offset {}", self.text, self.from)
        } else if self.text.is_empty() {
            write!(f, "delete [{}, {})", self.from, self.to)
        } else {
            write!(f, "replace [{}, {}) with {:?}", self.from, self.to, self.text)
        }
    }
}

/// Insert `new` into the sorted queue, rejecting overlap with either
/// neighbor of the insertion point. Because the queue is kept sorted and
/// never contains an overlapping pair, checking the immediate neighbors is
/// sufficient.
fn queue_edit(pending: &mut Vec<Edit>, new: Edit) -> Result<()> {
    let insertion_point =
        pending.partition_point(|edit| (edit.from, edit.to) <= (new.from, new.to));

    if insertion_point > 0 {
        let predecessor = &pending[insertion_point - 1];
        if predecessor.overlaps(&new) {
            return Err(Error::OverlappingEdits {
                new: new.to_string(),
                existing: predecessor.to_string(),
            });
        }
    }
    if insertion_point < pending.len() {
        let successor = &pending[insertion_point];
        if successor.overlaps(&new) {
            return Err(Error::OverlappingEdits {
                new: new.to_string(),
                existing: successor.to_string(),
            });
        }
    }

    pending.insert(insertion_point, new);
    Ok(())
}

fn unit_width(ch: char, encoding: OffsetEncoding) -> usize {
    match encoding {
        OffsetEncoding::Utf8 => ch.len_utf8(),
        OffsetEncoding::Utf16 => ch.len_utf16(),
        OffsetEncoding::Utf32 => 1,
    }
}

/// Walk a line, converting a column given in `encoding` code units into a
/// codepoint offset within the line. Landing in the middle of a codepoint
/// or past the end of the line is an error.
fn units_to_chars(line: RopeSlice, character: u32, encoding: OffsetEncoding) -> Option<usize> {
    let character = character as usize;
    let mut units = 0;
    for (idx, ch) in line.chars().enumerate() {
        if units == character {
            return Some(idx);
        }
        if units > character {
            return None;
        }
        units += unit_width(ch, encoding);
    }
    (units == character).then_some(line.len_chars())
}

fn chars_to_units(line: RopeSlice, chars: usize, encoding: OffsetEncoding) -> u32 {
    line.chars()
        .take(chars)
        .map(|ch| unit_width(ch, encoding))
        .sum::<usize>() as u32
}

/// Convert a (validated) codepoint offset into a protocol position.
fn position_of(text: &Rope, offset: usize, encoding: OffsetEncoding) -> lsp::Position {
    let line = text.char_to_line(offset);
    let line_start = text.line_to_char(line);
    let character = chars_to_units(text.line(line), offset - line_start, encoding);
    lsp::Position::new(line as u32, character)
}

fn range_of(text: &Rope, from: usize, to: usize, encoding: OffsetEncoding) -> lsp::Range {
    lsp::Range::new(position_of(text, from, encoding), position_of(text, to, encoding))
}

struct DocumentState {
    text: Rope,
    version: i32,
    path: PathBuf,
    uri: lsp::Url,
    pending_edits: Vec<Edit>,
    reference_count: usize,
    content_saved: bool,
}

/// The shared per-file state. Obtained via [`crate::Workspace`] as a
/// reference-counted [`Document`] handle.
pub struct TextDocument {
    language_id: String,
    encoding: &'static encoding_rs::Encoding,
    workspace: Weak<WorkspaceInner>,
    state: Mutex<DocumentState>,
}

impl TextDocument {
    pub(crate) fn open(
        path: PathBuf,
        uri: lsp::Url,
        language_id: String,
        encoding: &'static encoding_rs::Encoding,
        workspace: Weak<WorkspaceInner>,
    ) -> Result<Arc<TextDocument>> {
        let bytes = std::fs::read(&path)?;
        let (text, _, _) = encoding.decode(&bytes);
        let text = Rope::from_str(&text);

        Ok(Arc::new(TextDocument {
            language_id,
            encoding,
            workspace,
            state: Mutex::new(DocumentState {
                text,
                version: 0,
                path,
                uri,
                pending_edits: Vec::new(),
                reference_count: 1,
                content_saved: true,
            }),
        }))
    }

    // ---------------------------------------------------------------------
    // Accessors
    // ---------------------------------------------------------------------

    pub fn text(&self) -> Rope {
        self.state.lock().text.clone()
    }

    pub fn version(&self) -> i32 {
        self.state.lock().version
    }

    pub fn path(&self) -> PathBuf {
        self.state.lock().path.clone()
    }

    pub fn uri(&self) -> lsp::Url {
        self.state.lock().uri.clone()
    }

    pub fn language_id(&self) -> &str {
        &self.language_id
    }

    /// The canonical name of the on-disk character encoding.
    pub fn encoding(&self) -> &'static str {
        self.encoding.name()
    }

    pub(crate) fn encoding_raw(&self) -> &'static encoding_rs::Encoding {
        self.encoding
    }

    pub fn has_pending_edits(&self) -> bool {
        !self.state.lock().pending_edits.is_empty()
    }

    pub fn is_dirty(&self) -> bool {
        !self.state.lock().content_saved
    }

    pub fn reference_count(&self) -> usize {
        self.state.lock().reference_count
    }

    pub fn is_closed(&self) -> bool {
        self.reference_count() == 0
    }

    fn check_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(Error::DocumentClosed(self.state.lock().uri.clone()));
        }
        Ok(())
    }

    pub fn info(&self) -> TextDocumentInfo {
        TextDocumentInfo {
            uri: self.uri(),
            language_id: self.language_id.clone(),
        }
    }

    pub fn text_document_item(&self) -> lsp::TextDocumentItem {
        let state = self.state.lock();
        lsp::TextDocumentItem {
            uri: state.uri.clone(),
            language_id: self.language_id.clone(),
            version: state.version,
            text: state.text.to_string(),
        }
    }

    pub fn identifier(&self) -> lsp::TextDocumentIdentifier {
        lsp::TextDocumentIdentifier { uri: self.uri() }
    }

    pub fn versioned_identifier(&self) -> lsp::VersionedTextDocumentIdentifier {
        let state = self.state.lock();
        lsp::VersionedTextDocumentIdentifier {
            uri: state.uri.clone(),
            version: state.version,
        }
    }

    pub fn optional_versioned_identifier(&self) -> lsp::OptionalVersionedTextDocumentIdentifier {
        let state = self.state.lock();
        lsp::OptionalVersionedTextDocumentIdentifier {
            uri: state.uri.clone(),
            version: Some(state.version),
        }
    }

    // ---------------------------------------------------------------------
    // Reference counting
    // ---------------------------------------------------------------------

    pub(crate) fn reopen(&self) -> Result<()> {
        let mut state = self.state.lock();
        if state.reference_count == 0 {
            return Err(Error::DocumentClosed(state.uri.clone()));
        }
        state.reference_count += 1;
        Ok(())
    }

    pub(crate) fn release(&self) {
        let final_close = {
            let mut state = self.state.lock();
            if state.reference_count == 0 {
                return;
            }
            state.reference_count -= 1;
            state.reference_count == 0
        };
        if final_close {
            self.final_close();
        }
    }

    /// Close regardless of outstanding handles; those observe
    /// [`Error::DocumentClosed`] from then on.
    pub(crate) fn force_close(&self) {
        {
            let mut state = self.state.lock();
            if state.reference_count == 0 {
                return;
            }
            state.reference_count = 0;
        }
        self.final_close();
    }

    fn final_close(&self) {
        let (uri, pending, dirty) = {
            let state = self.state.lock();
            (
                state.uri.clone(),
                state.pending_edits.len(),
                !state.content_saved,
            )
        };
        if pending > 0 {
            warn!(
                "dropping {pending} uncommitted edits for {uri}; call commit_edits() and \
                 save() before closing to keep them"
            );
        }
        if dirty {
            warn!("{uri} has unsaved changes; call save() before closing to keep them");
        }

        if let Some(workspace) = self.workspace.upgrade() {
            let info = self.info();
            let query = FeatureQuery::new().text_document(info);
            let params = lsp::DidCloseTextDocumentParams {
                text_document: lsp::TextDocumentIdentifier { uri: uri.clone() },
            };
            for client in workspace.clients() {
                if !client.check_feature("textDocument/didClose", &query) {
                    continue;
                }
                if let Err(err) =
                    client.notify::<lsp::notification::DidCloseTextDocument>(params.clone())
                {
                    warn!("failed to send didClose to {}: {err}", client.name());
                }
            }
            workspace.deregister_document(&uri, self as *const TextDocument);
        }
    }

    /// Move the document to a new location, re-keying the workspace
    /// registry. Subsequent notifications use the new URI.
    pub(crate) fn set_location(&self, path: PathBuf, uri: lsp::Url) {
        let mut state = self.state.lock();
        state.path = path;
        state.uri = uri;
    }

    // ---------------------------------------------------------------------
    // Edit queueing
    // ---------------------------------------------------------------------

    /// Queue a replacement of the codepoint range `[from, to)` with
    /// `new_text`. Queued edits must not overlap; zero-length insertions at
    /// the same offset are the exception and compose in insertion order.
    /// Nothing changes until [`TextDocument::commit_edits`] is called.
    pub fn edit(&self, new_text: impl Into<String>, from: usize, to: usize) -> Result<()> {
        self.check_open()?;
        let mut state = self.state.lock();
        let len = state.text.len_chars();
        if from > to || to > len {
            return Err(Error::EditOutOfBounds { from, to, len });
        }
        queue_edit(
            &mut state.pending_edits,
            Edit {
                from,
                to,
                text: new_text.into(),
            },
        )
    }

    /// Shorthand for an insertion at `offset`.
    pub fn insert(&self, new_text: impl Into<String>, offset: usize) -> Result<()> {
        self.edit(new_text, offset, offset)
    }

    /// Shorthand for deleting the range `[from, to)`.
    pub fn delete(&self, from: usize, to: usize) -> Result<()> {
        self.edit("", from, to)
    }

    /// Queue a protocol [`lsp::TextEdit`], interpreting its positions in
    /// `client`'s position encoding.
    pub fn push_text_edit(&self, text_edit: &lsp::TextEdit, client: &Client) -> Result<()> {
        let encoding = client.offset_encoding();
        let from = self.position_to_offset_with(text_edit.range.start, encoding)?;
        let to = self.position_to_offset_with(text_edit.range.end, encoding)?;
        self.edit(text_edit.new_text.clone(), from, to)
    }

    /// Drop all queued edits.
    pub fn discard_edits(&self) -> Result<()> {
        self.check_open()?;
        self.state.lock().pending_edits.clear();
        Ok(())
    }

    /// Atomically apply all queued edits: the text is replaced, the version
    /// incremented and one `didChange` is emitted per attached client that
    /// supports document sync. Full sync sends the whole new text;
    /// incremental sync sends one change event per edit in reverse document
    /// order, so the server can apply them sequentially without re-mapping
    /// positions.
    pub fn commit_edits(&self) -> Result<()> {
        self.check_open()?;

        let (old_text, new_text, edits, version) = {
            let mut state = self.state.lock();
            let old_text = state.text.clone();
            let edits = std::mem::take(&mut state.pending_edits);
            for edit in edits.iter().rev() {
                state.text.remove(edit.from..edit.to);
                state.text.insert(edit.from, &edit.text);
            }
            state.version += 1;
            state.content_saved = false;
            (old_text, state.text.to_string(), edits, state.version)
        };

        self.broadcast_did_change(&old_text, new_text, &edits, version);
        Ok(())
    }

    fn broadcast_did_change(
        &self,
        old_text: &Rope,
        new_text: String,
        edits: &[Edit],
        version: i32,
    ) {
        let Some(workspace) = self.workspace.upgrade() else {
            return;
        };
        let text_document = lsp::VersionedTextDocumentIdentifier {
            uri: self.uri(),
            version,
        };

        let full = FeatureQuery::new().sync_kind(lsp::TextDocumentSyncKind::FULL);
        let incremental = FeatureQuery::new().sync_kind(lsp::TextDocumentSyncKind::INCREMENTAL);

        for client in workspace.clients() {
            let content_changes = if client.check_feature("textDocument/didChange", &full) {
                vec![lsp::TextDocumentContentChangeEvent {
                    range: None,
                    range_length: None,
                    text: new_text.clone(),
                }]
            } else if client.check_feature("textDocument/didChange", &incremental) {
                // Reverse order: change events apply sequentially, so edits
                // later in the document must go first to keep earlier
                // positions valid. Ranges describe the pre-commit text.
                let encoding = client.offset_encoding();
                edits
                    .iter()
                    .rev()
                    .map(|edit| lsp::TextDocumentContentChangeEvent {
                        range: Some(range_of(old_text, edit.from, edit.to, encoding)),
                        range_length: None,
                        text: edit.text.clone(),
                    })
                    .collect()
            } else {
                continue;
            };

            let params = lsp::DidChangeTextDocumentParams {
                text_document: text_document.clone(),
                content_changes,
            };
            if let Err(err) = client.notify::<lsp::notification::DidChangeTextDocument>(params) {
                warn!("failed to send didChange to {}: {err}", client.name());
            }
        }
    }

    // ---------------------------------------------------------------------
    // Saving
    // ---------------------------------------------------------------------

    /// Save the document: `willSave` to interested clients, gather
    /// `willSaveWaitUntil` edits (committed atomically before anything is
    /// written), encode and write the text to disk, then `didSave` with or
    /// without the full text per client capability.
    ///
    /// If a server returns edits that overlap the queue, the save fails
    /// before the disk write; discard the edits and retry.
    pub async fn save(&self) -> Result<()> {
        self.check_open()?;
        let workspace = self
            .workspace
            .upgrade()
            .ok_or_else(|| Error::DocumentClosed(self.uri()))?;
        let clients = workspace.clients();
        let info = self.info();
        let doc_query = FeatureQuery::new().text_document(info.clone());

        let will_save_params = lsp::WillSaveTextDocumentParams {
            text_document: self.identifier(),
            reason: lsp::TextDocumentSaveReason::MANUAL,
        };

        for client in &clients {
            if !client.check_feature("textDocument/willSave", &doc_query) {
                continue;
            }
            if let Err(err) = client
                .notify::<lsp::notification::WillSaveTextDocument>(will_save_params.clone())
            {
                warn!("failed to send willSave to {}: {err}", client.name());
            }
        }

        let wait_until: Vec<Arc<Client>> = clients
            .iter()
            .filter(|client| client.check_feature("textDocument/willSaveWaitUntil", &doc_query))
            .cloned()
            .collect();
        let responses = futures_util::future::join_all(wait_until.iter().map(|client| {
            let params = will_save_params.clone();
            let client = Arc::clone(client);
            async move {
                client
                    .request::<lsp::request::WillSaveWaitUntil>(params)
                    .await
            }
        }))
        .await;

        for (client, response) in wait_until.iter().zip(responses) {
            let Some(text_edits) = response? else {
                continue;
            };
            for text_edit in &text_edits {
                self.push_text_edit(text_edit, client)?;
            }
        }
        if self.has_pending_edits() {
            self.commit_edits()?;
        }

        let (content, path) = {
            let state = self.state.lock();
            (state.text.to_string(), state.path.clone())
        };
        let (bytes, _, _) = self.encoding.encode(&content);
        tokio::fs::write(&path, bytes.as_ref()).await?;

        let identifier = self.identifier();
        let with_text = lsp::DidSaveTextDocumentParams {
            text_document: identifier.clone(),
            text: Some(content),
        };
        let without_text = lsp::DidSaveTextDocumentParams {
            text_document: identifier,
            text: None,
        };
        for client in &clients {
            let params = if client.check_feature(
                "textDocument/didSave",
                &doc_query.clone().include_text(true),
            ) {
                with_text.clone()
            } else if client.check_feature(
                "textDocument/didSave",
                &doc_query.clone().include_text(false),
            ) {
                without_text.clone()
            } else {
                continue;
            };
            if let Err(err) = client.notify::<lsp::notification::DidSaveTextDocument>(params) {
                warn!("failed to send didSave to {}: {err}", client.name());
            }
        }

        self.state.lock().content_saved = true;
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Position conversion
    // ---------------------------------------------------------------------

    /// Convert a protocol position into a codepoint offset, interpreting
    /// the column in `client`'s negotiated position encoding.
    pub fn position_to_offset(&self, position: lsp::Position, client: &Client) -> Result<usize> {
        self.position_to_offset_with(position, client.offset_encoding())
    }

    pub fn position_to_offset_with(
        &self,
        position: lsp::Position,
        encoding: OffsetEncoding,
    ) -> Result<usize> {
        self.check_open()?;
        let state = self.state.lock();
        let line = position.line as usize;
        if line >= state.text.len_lines() {
            return Err(Error::PositionOutOfBounds {
                line: position.line,
                character: position.character,
            });
        }
        let line_start = state.text.line_to_char(line);
        let column = units_to_chars(state.text.line(line), position.character, encoding)
            .ok_or(Error::PositionOutOfBounds {
                line: position.line,
                character: position.character,
            })?;
        Ok(line_start + column)
    }

    /// Convert a codepoint offset into a protocol position for `client`.
    /// `offset == len` is valid and maps to the end of the text.
    pub fn offset_to_position(&self, offset: usize, client: &Client) -> Result<lsp::Position> {
        self.offset_to_position_with(offset, client.offset_encoding())
    }

    pub fn offset_to_position_with(
        &self,
        offset: usize,
        encoding: OffsetEncoding,
    ) -> Result<lsp::Position> {
        self.check_open()?;
        let state = self.state.lock();
        if offset > state.text.len_chars() {
            return Err(Error::OffsetOutOfBounds(offset));
        }
        Ok(position_of(&state.text, offset, encoding))
    }

    // ---------------------------------------------------------------------
    // File operations (delegating to the owning workspace)
    // ---------------------------------------------------------------------

    /// Rename the underlying file; see
    /// [`crate::Workspace::rename_text_document`].
    pub async fn rename_file(&self, new_path: impl AsRef<Path>, overwrite: bool) -> Result<()> {
        self.check_open()?;
        let workspace = self
            .workspace
            .upgrade()
            .ok_or_else(|| Error::DocumentClosed(self.uri()))?;
        workspace
            .rename_text_document(&self.path(), new_path.as_ref(), overwrite, false)
            .await
    }

    /// Delete the underlying file, closing this document; see
    /// [`crate::Workspace::delete_text_document`].
    pub async fn delete_file(&self) -> Result<()> {
        self.check_open()?;
        let workspace = self
            .workspace
            .upgrade()
            .ok_or_else(|| Error::DocumentClosed(self.uri()))?;
        workspace.delete_file(&self.path(), false, false, false).await
    }
}

impl std::fmt::Debug for TextDocument {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("TextDocument")
            .field("uri", &state.uri.as_str())
            .field("version", &state.version)
            .field("language_id", &self.language_id)
            .field("reference_count", &state.reference_count)
            .finish_non_exhaustive()
    }
}

/// A reference-counted handle to an open [`TextDocument`]. Dropping the
/// handle releases one reference; the last release closes the document and
/// emits `didClose` to every subscribed client.
pub struct Document {
    doc: Arc<TextDocument>,
    released: bool,
}

impl Document {
    pub(crate) fn new(doc: Arc<TextDocument>) -> Document {
        Document {
            doc,
            released: false,
        }
    }

    /// Explicitly release this handle.
    pub fn close(mut self) {
        self.released = true;
        self.doc.release();
    }
}

impl Drop for Document {
    fn drop(&mut self) {
        if !self.released {
            self.doc.release();
        }
    }
}

impl std::ops::Deref for Document {
    type Target = TextDocument;

    fn deref(&self) -> &TextDocument {
        &self.doc
    }
}

impl std::fmt::Debug for Document {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.doc.fmt(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Workspace;
    use std::fs;

    fn workspace_with(files: &[(&str, &str)]) -> (tempfile::TempDir, Workspace) {
        let dir = tempfile::tempdir().unwrap();
        for (name, content) in files {
            fs::write(dir.path().join(name), content).unwrap();
        }
        let workspace = Workspace::new([dir.path().to_path_buf()]);
        (dir, workspace)
    }

    #[test]
    fn edit_commit_replaces_ranges_in_sorted_order() {
        let (_dir, ws) = workspace_with(&[("test.py", "print(\"Hello, World!\")\n")]);
        let doc = ws.open_text_document("test.py").unwrap();

        doc.edit("Hi", 7, 12).unwrap();
        doc.edit("logging.info", 0, 5).unwrap();
        doc.commit_edits().unwrap();

        assert_eq!(doc.text().to_string(), "logging.info(\"Hi, World!\")\n");
        assert_eq!(doc.version(), 1);
        assert!(doc.is_dirty());
    }

    #[test]
    fn insertions_at_the_same_offset_compose_in_order() {
        let (_dir, ws) = workspace_with(&[("test.py", "print(\"Hello, World!\")\n")]);
        let doc = ws.open_text_document("test.py").unwrap();

        doc.insert("print(\"123\")\n", 23).unwrap();
        doc.insert("print(\"456\")\n", 23).unwrap();
        doc.commit_edits().unwrap();

        assert_eq!(
            doc.text().to_string(),
            "print(\"Hello, World!\")\nprint(\"123\")\nprint(\"456\")\n"
        );
    }

    #[test]
    fn overlapping_edits_are_rejected_in_both_directions() {
        let (_dir, ws) = workspace_with(&[("test.py", "print(\"Hello, World!\")\n")]);
        let doc = ws.open_text_document("test.py").unwrap();

        doc.edit("Good morning", 7, 12).unwrap();
        // overlaps its predecessor
        assert!(matches!(
            doc.edit("x", 8, 15),
            Err(Error::OverlappingEdits { .. })
        ));
        // overlaps its successor
        assert!(matches!(
            doc.edit("x", 0, 9),
            Err(Error::OverlappingEdits { .. })
        ));
        // adjacent on the left is fine
        doc.edit("y", 0, 7).unwrap();
    }

    #[test]
    fn edit_bounds_are_validated() {
        let (_dir, ws) = workspace_with(&[("test.py", "0123456789")]);
        let doc = ws.open_text_document("test.py").unwrap();

        assert!(matches!(
            doc.edit("x", 4, 100),
            Err(Error::EditOutOfBounds { .. })
        ));
        assert!(matches!(
            doc.edit("x", 5, 4),
            Err(Error::EditOutOfBounds { .. })
        ));
        // appending at the end of the text is a valid zero-length edit
        doc.edit("!", 10, 10).unwrap();
        doc.commit_edits().unwrap();
        assert_eq!(doc.text().to_string(), "0123456789!");
    }

    #[test]
    fn position_conversion_per_encoding() {
        let (_dir, ws) = workspace_with(&[("test.py", "abc€def")]);
        let doc = ws.open_text_document("test.py").unwrap();

        // the char offset just past the euro sign, in front of 'd'
        let offset = 4;
        let cases = [
            (OffsetEncoding::Utf8, 6),
            (OffsetEncoding::Utf16, 4),
            (OffsetEncoding::Utf32, 4),
        ];
        for (encoding, character) in cases {
            let position = lsp::Position::new(0, character);
            assert_eq!(
                doc.position_to_offset_with(position, encoding).unwrap(),
                offset,
                "{encoding:?}"
            );
            assert_eq!(
                doc.offset_to_position_with(offset, encoding).unwrap(),
                position,
                "{encoding:?}"
            );
        }

        // character 4 under UTF-8 lands inside the euro sign
        assert!(matches!(
            doc.position_to_offset_with(lsp::Position::new(0, 4), OffsetEncoding::Utf8),
            Err(Error::PositionOutOfBounds { .. })
        ));
    }

    #[test]
    fn position_at_line_length_is_the_next_line_start() {
        let (_dir, ws) = workspace_with(&[("test.py", "ab\ncd")]);
        let doc = ws.open_text_document("test.py").unwrap();

        // line 0 is "ab\n", 3 characters including the newline
        let offset = doc
            .position_to_offset_with(lsp::Position::new(0, 3), OffsetEncoding::Utf32)
            .unwrap();
        assert_eq!(offset, 3);
        assert_eq!(
            doc.offset_to_position_with(3, OffsetEncoding::Utf32).unwrap(),
            lsp::Position::new(1, 0)
        );

        // end of the last line, end of text
        let offset = doc
            .position_to_offset_with(lsp::Position::new(1, 2), OffsetEncoding::Utf32)
            .unwrap();
        assert_eq!(offset, 5);
        // one past is an error
        assert!(doc
            .position_to_offset_with(lsp::Position::new(1, 3), OffsetEncoding::Utf32)
            .is_err());
    }

    #[test]
    fn reference_counting_tracks_opens_and_closes() {
        let (_dir, ws) = workspace_with(&[("test.py", "pass\n")]);
        let first = ws.open_text_document("test.py").unwrap();
        let second = ws.open_text_document("test.py").unwrap();

        assert_eq!(first.reference_count(), 2);
        second.close();
        assert_eq!(first.reference_count(), 1);
        assert!(!first.is_closed());

        first.close();
        // the document is gone from the registry; a new open creates a
        // fresh instance at version 0
        let reopened = ws.open_text_document("test.py").unwrap();
        assert_eq!(reopened.reference_count(), 1);
        assert_eq!(reopened.version(), 0);
    }

    #[test]
    fn closed_documents_fail_closed() {
        let (_dir, ws) = workspace_with(&[("test.py", "pass\n")]);
        let first = ws.open_text_document("test.py").unwrap();
        let second = ws.open_text_document("test.py").unwrap();

        // force-close through the first handle's shared state
        first.force_close();
        drop(first);

        assert!(second.is_closed());
        assert!(matches!(
            second.edit("x", 0, 0),
            Err(Error::DocumentClosed(_))
        ));
        assert!(matches!(
            second.commit_edits(),
            Err(Error::DocumentClosed(_))
        ));
    }

    #[tokio::test]
    async fn save_writes_through_the_document_encoding() {
        let (dir, ws) = workspace_with(&[("test.py", "print('Hi!')\n")]);
        let doc = ws.open_text_document("test.py").unwrap();

        doc.edit("Bye", 7, 9).unwrap();
        doc.commit_edits().unwrap();
        doc.save().await.unwrap();

        assert!(!doc.is_dirty());
        let on_disk = fs::read_to_string(dir.path().join("test.py")).unwrap();
        assert_eq!(on_disk, "print('Bye!')\n");
    }
}
