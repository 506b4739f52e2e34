//! The workspace coordinator: roots, attached clients, the document
//! registry, file lifecycle operations with their `will…`/`did…`
//! handshakes, and workspace-edit application.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures_util::future::BoxFuture;
use log::{info, warn};
use parking_lot::Mutex;
use serde_json::Value;

use crate::capabilities::FeatureQuery;
use crate::client::{Client, ClientState, WorkspaceRequestHandler};
use crate::connection::LaunchParams;
use crate::document::{Document, TextDocument};
use crate::languages::LanguageDatabase;
use crate::lsp;
use crate::{Error, Result};

/// Answers `workspace/configuration` items: `(scope_uri, section) -> value`.
pub type ConfigurationProvider =
    dyn Fn(Option<&lsp::Url>, Option<&str>) -> Value + Send + Sync;

/// Options for opening a document; unset fields fall back to the
/// workspace's defaults.
#[derive(Debug, Clone, Default)]
pub struct OpenOptions {
    pub encoding: Option<String>,
    pub language_id: Option<String>,
}

/// Options for [`Workspace::create_text_document`]. `overwrite` wins over
/// `ignore_if_exists`.
#[derive(Debug, Clone, Default)]
pub struct CreateOptions {
    pub overwrite: bool,
    pub ignore_if_exists: bool,
    pub open: OpenOptions,
}

fn file_url(path: &Path) -> Result<lsp::Url> {
    lsp::Url::from_file_path(path)
        .map_err(|_| Error::Other(anyhow::anyhow!("cannot build a file URI for {path:?}")))
}

pub(crate) struct WorkspaceInner {
    roots: Vec<(PathBuf, String)>,
    default_encoding: Mutex<&'static encoding_rs::Encoding>,
    languages: Mutex<LanguageDatabase>,
    clients: Mutex<Vec<Arc<Client>>>,
    documents: Mutex<HashMap<lsp::Url, Arc<TextDocument>>>,
    configuration_provider: Mutex<Option<Arc<ConfigurationProvider>>>,
    diagnostics: Mutex<HashMap<lsp::Url, Vec<lsp::Diagnostic>>>,
}

impl WorkspaceInner {
    pub(crate) fn clients(&self) -> Vec<Arc<Client>> {
        self.clients.lock().clone()
    }

    fn workspace_folders(&self) -> Vec<lsp::WorkspaceFolder> {
        self.roots
            .iter()
            .filter_map(|(path, name)| {
                Some(lsp::WorkspaceFolder {
                    uri: file_url(path).ok()?,
                    name: name.clone(),
                })
            })
            .collect()
    }

    /// Drop a closed document from the registry. The pointer guards against
    /// removing a fresh instance that reused the URI in the meantime.
    pub(crate) fn deregister_document(&self, uri: &lsp::Url, doc: *const TextDocument) {
        let mut documents = self.documents.lock();
        if documents
            .get(uri)
            .is_some_and(|entry| Arc::as_ptr(entry) == doc)
        {
            documents.remove(uri);
        }
    }

    /// Resolve a path against the workspace roots. Relative paths must
    /// match exactly one root (existing file wins); absolute paths outside
    /// every root are allowed with a warning.
    fn resolve_path(&self, path: &Path) -> Result<PathBuf> {
        if path.is_absolute() {
            let resolved = scribe_stdx::path::canonicalize(path);
            if !self
                .roots
                .iter()
                .any(|(root, _)| scribe_stdx::path::is_relative_to(&resolved, root))
            {
                warn!("{} is not part of any workspace root", resolved.display());
            }
            return Ok(resolved);
        }

        if let [(root, _)] = self.roots.as_slice() {
            return Ok(scribe_stdx::path::normalize(root.join(path)));
        }

        let mut existing = self
            .roots
            .iter()
            .map(|(root, _)| scribe_stdx::path::normalize(root.join(path)))
            .filter(|candidate| candidate.exists());
        match (existing.next(), existing.next()) {
            (Some(only), None) => Ok(only),
            (None, _) => Err(Error::NotFound(path.to_path_buf())),
            (Some(_), Some(_)) => Err(Error::AmbiguousPath(path.to_path_buf())),
        }
    }

    fn resolve_uri(&self, uri: &lsp::Url) -> Result<PathBuf> {
        let path = uri
            .to_file_path()
            .map_err(|_| Error::Other(anyhow::anyhow!("{uri} is not a file URI")))?;
        self.resolve_path(&path)
    }

    pub(crate) fn resolve_client(&self, client: Option<&Arc<Client>>) -> Result<Arc<Client>> {
        let clients = self.clients.lock();
        match client {
            Some(client) => {
                if clients.iter().any(|other| Arc::ptr_eq(other, client)) {
                    Ok(Arc::clone(client))
                } else {
                    Err(Error::Other(anyhow::anyhow!(
                        "client {} is not registered with this workspace",
                        client.name()
                    )))
                }
            }
            None => match clients.as_slice() {
                [only] => Ok(Arc::clone(only)),
                _ => Err(Error::Other(anyhow::anyhow!(
                    "a client must be given when the workspace has zero or multiple clients"
                ))),
            },
        }
    }

    // -----------------------------------------------------------------
    // Document registry
    // -----------------------------------------------------------------

    pub(crate) fn open_by_path(
        self: &Arc<Self>,
        path: &Path,
        options: OpenOptions,
    ) -> Result<Document> {
        let full_path = self.resolve_path(path)?;
        let uri = file_url(&full_path)?;

        let requested_encoding = match &options.encoding {
            Some(label) => Some(
                encoding_rs::Encoding::for_label(label.as_bytes()).ok_or_else(|| {
                    Error::Other(anyhow::anyhow!("unknown encoding label {label:?}"))
                })?,
            ),
            None => None,
        };

        if let Some(existing) = self.documents.lock().get(&uri).cloned() {
            if let Some(encoding) = requested_encoding {
                if !std::ptr::eq(encoding, existing.encoding_raw()) {
                    return Err(Error::Other(anyhow::anyhow!(
                        "{uri} is already open with encoding {}",
                        existing.encoding()
                    )));
                }
            }
            if let Some(language_id) = &options.language_id {
                if language_id != existing.language_id() {
                    return Err(Error::Other(anyhow::anyhow!(
                        "{uri} is already open with language id {}",
                        existing.language_id()
                    )));
                }
            }
            existing.reopen()?;
            return Ok(Document::new(existing));
        }

        if !full_path.is_file() {
            return Err(Error::NotFound(full_path));
        }

        let language_id = match options.language_id {
            Some(language_id) => language_id,
            None => self
                .languages
                .lock()
                .language_id_for_path(&full_path)
                .map(str::to_owned)
                .ok_or_else(|| Error::UnknownLanguage(full_path.clone()))?,
        };
        let encoding = requested_encoding.unwrap_or_else(|| *self.default_encoding.lock());

        let doc = TextDocument::open(
            full_path,
            uri.clone(),
            language_id,
            encoding,
            Arc::downgrade(self),
        )?;
        self.documents.lock().insert(uri.clone(), Arc::clone(&doc));
        info!(
            "opened {uri} with encoding {} and language id {}",
            doc.encoding(),
            doc.language_id()
        );

        self.send_did_open(&doc);
        Ok(Document::new(doc))
    }

    fn send_did_open(&self, doc: &Arc<TextDocument>) {
        let query = FeatureQuery::new().text_document(doc.info());
        for client in self.clients() {
            if !client.check_feature("textDocument/didOpen", &query) {
                continue;
            }
            let params = lsp::DidOpenTextDocumentParams {
                text_document: doc.text_document_item(),
            };
            if let Err(err) = client.notify::<lsp::notification::DidOpenTextDocument>(params) {
                warn!("failed to send didOpen to {}: {err}", client.name());
            }
        }
    }

    fn replay_did_open(&self, client: &Arc<Client>) {
        let docs: Vec<Arc<TextDocument>> = self.documents.lock().values().cloned().collect();
        for doc in docs {
            let query = FeatureQuery::new().text_document(doc.info());
            if !client.check_feature("textDocument/didOpen", &query) {
                continue;
            }
            let params = lsp::DidOpenTextDocumentParams {
                text_document: doc.text_document_item(),
            };
            if let Err(err) = client.notify::<lsp::notification::DidOpenTextDocument>(params) {
                warn!("failed to replay didOpen to {}: {err}", client.name());
            }
        }
    }

    pub(crate) fn register_client(self: &Arc<Self>, client: &Arc<Client>) -> Result<()> {
        {
            let mut clients = self.clients.lock();
            if clients.iter().any(|other| Arc::ptr_eq(other, client)) {
                return Err(Error::Other(anyhow::anyhow!(
                    "client {} is already registered with this workspace",
                    client.name()
                )));
            }
            clients.push(Arc::clone(client));
        }

        client.set_workspace_folders(self.workspace_folders());
        client.set_workspace_request_handler(Some(
            Arc::clone(self) as Arc<dyn WorkspaceRequestHandler>
        ));

        // A client attached after documents were opened replays didOpen for
        // each of them once it reaches `running`.
        let workspace = Arc::downgrade(self);
        let replay_client = Arc::downgrade(client);
        client.register_state_callback(ClientState::Running, move || {
            if let (Some(workspace), Some(client)) = (workspace.upgrade(), replay_client.upgrade())
            {
                workspace.replay_did_open(&client);
            }
        });

        let workspace = Arc::downgrade(self);
        let detach_client = Arc::downgrade(client);
        client.register_state_callback(ClientState::Disconnected, move || {
            if let (Some(workspace), Some(client)) = (workspace.upgrade(), detach_client.upgrade())
            {
                client.set_workspace_request_handler(None);
                workspace
                    .clients
                    .lock()
                    .retain(|other| !Arc::ptr_eq(other, &client));
            }
        });

        Ok(())
    }

    // -----------------------------------------------------------------
    // File operations
    // -----------------------------------------------------------------

    async fn send_will_create(self: &Arc<Self>, uri: &lsp::Url) -> Result<()> {
        let params = lsp::CreateFilesParams {
            files: vec![lsp::FileCreate {
                uri: uri.to_string(),
            }],
        };
        let query = FeatureQuery::new().file_operation(uri.clone());
        for client in self.clients() {
            if !client.check_feature("workspace/willCreateFiles", &query) {
                continue;
            }
            let edit = client
                .request::<lsp::request::WillCreateFiles>(params.clone())
                .await?;
            if let Some(edit) = edit {
                self.perform_edit_and_save(&edit, Some(&client)).await?;
            }
        }
        Ok(())
    }

    fn send_did_create(&self, uri: &lsp::Url) {
        let params = lsp::CreateFilesParams {
            files: vec![lsp::FileCreate {
                uri: uri.to_string(),
            }],
        };
        let query = FeatureQuery::new().file_operation(uri.clone());
        for client in self.clients() {
            if !client.check_feature("workspace/didCreateFiles", &query) {
                continue;
            }
            if let Err(err) = client.notify::<lsp::notification::DidCreateFiles>(params.clone()) {
                warn!("failed to send didCreateFiles to {}: {err}", client.name());
            }
        }
    }

    pub(crate) async fn create_file(
        self: &Arc<Self>,
        path: &Path,
        overwrite: bool,
        ignore_if_exists: bool,
    ) -> Result<()> {
        let full_path = self.resolve_path(path)?;

        if full_path.exists() && !overwrite {
            if ignore_if_exists {
                info!("{} already exists, no new file created", full_path.display());
                return Ok(());
            }
            return Err(Error::AlreadyExists(full_path));
        }

        let uri = file_url(&full_path)?;
        self.send_will_create(&uri).await?;

        let open_document = self.documents.lock().get(&uri).cloned();
        match open_document {
            Some(doc) if overwrite => {
                // the file stays open; its content is cleared through the
                // regular edit pipeline so clients see the change
                let len = doc.text().len_chars();
                doc.delete(0, len)?;
                doc.commit_edits()?;
                doc.save().await?;
            }
            _ => {
                if let Some(parent) = full_path.parent() {
                    tokio::fs::create_dir_all(parent).await?;
                }
                tokio::fs::write(&full_path, b"").await?;
            }
        }

        self.send_did_create(&uri);
        Ok(())
    }

    async fn send_will_rename(
        self: &Arc<Self>,
        source: &lsp::Url,
        destination: &lsp::Url,
    ) -> Result<()> {
        let params = lsp::RenameFilesParams {
            files: vec![lsp::FileRename {
                old_uri: source.to_string(),
                new_uri: destination.to_string(),
            }],
        };
        let query = FeatureQuery::new().file_operation(source.clone());
        for client in self.clients() {
            if !client.check_feature("workspace/willRenameFiles", &query) {
                continue;
            }
            let edit = client
                .request::<lsp::request::WillRenameFiles>(params.clone())
                .await?;
            if let Some(edit) = edit {
                self.perform_edit_and_save(&edit, Some(&client)).await?;
            }
        }
        Ok(())
    }

    fn send_did_rename(&self, source: &lsp::Url, destination: &lsp::Url) {
        let params = lsp::RenameFilesParams {
            files: vec![lsp::FileRename {
                old_uri: source.to_string(),
                new_uri: destination.to_string(),
            }],
        };
        let query = FeatureQuery::new().file_operation(source.clone());
        for client in self.clients() {
            if !client.check_feature("workspace/didRenameFiles", &query) {
                continue;
            }
            if let Err(err) = client.notify::<lsp::notification::DidRenameFiles>(params.clone()) {
                warn!("failed to send didRenameFiles to {}: {err}", client.name());
            }
        }
    }

    pub(crate) async fn rename_text_document(
        self: &Arc<Self>,
        source: &Path,
        destination: &Path,
        overwrite: bool,
        ignore_if_exists: bool,
    ) -> Result<()> {
        let source_path = self.resolve_path(source)?;
        let destination_path = self.resolve_path(destination)?;

        if source_path == destination_path {
            return Ok(());
        }
        if !source_path.exists() {
            return Err(Error::NotFound(source_path));
        }
        if destination_path.exists() && !overwrite {
            if ignore_if_exists {
                return Ok(());
            }
            return Err(Error::AlreadyExists(destination_path));
        }

        let source_uri = file_url(&source_path)?;
        let destination_uri = file_url(&destination_path)?;
        self.send_will_rename(&source_uri, &destination_uri).await?;

        let (source_doc, destination_doc) = {
            let documents = self.documents.lock();
            (
                documents.get(&source_uri).cloned(),
                documents.get(&destination_uri).cloned(),
            )
        };

        if destination_path.exists() {
            info!(
                "rename destination {} already exists, overwriting",
                destination_path.display()
            );
            // outstanding handles to the overwritten document fail closed
            if let Some(destination_doc) = destination_doc {
                destination_doc.force_close();
            }
        }

        if let Some(doc) = source_doc {
            let mut documents = self.documents.lock();
            documents.remove(&source_uri);
            doc.set_location(destination_path.clone(), destination_uri.clone());
            documents.insert(destination_uri.clone(), doc);
        }

        // Windows refuses to rename onto an existing file
        match tokio::fs::remove_file(&destination_path).await {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => return Err(err.into()),
        }
        tokio::fs::rename(&source_path, &destination_path).await?;

        self.send_did_rename(&source_uri, &destination_uri);
        Ok(())
    }

    async fn send_will_delete(self: &Arc<Self>, uri: &lsp::Url) -> Result<()> {
        let params = lsp::DeleteFilesParams {
            files: vec![lsp::FileDelete {
                uri: uri.to_string(),
            }],
        };
        let query = FeatureQuery::new().file_operation(uri.clone());
        for client in self.clients() {
            if !client.check_feature("workspace/willDeleteFiles", &query) {
                continue;
            }
            let edit = client
                .request::<lsp::request::WillDeleteFiles>(params.clone())
                .await?;
            if let Some(edit) = edit {
                self.perform_edit_and_save(&edit, Some(&client)).await?;
            }
        }
        Ok(())
    }

    fn send_did_delete(&self, uri: &lsp::Url) {
        let params = lsp::DeleteFilesParams {
            files: vec![lsp::FileDelete {
                uri: uri.to_string(),
            }],
        };
        let query = FeatureQuery::new().file_operation(uri.clone());
        for client in self.clients() {
            if !client.check_feature("workspace/didDeleteFiles", &query) {
                continue;
            }
            if let Err(err) = client.notify::<lsp::notification::DidDeleteFiles>(params.clone()) {
                warn!("failed to send didDeleteFiles to {}: {err}", client.name());
            }
        }
    }

    pub(crate) async fn delete_file(
        self: &Arc<Self>,
        path: &Path,
        recursive: bool,
        ignore_if_not_exists: bool,
        expect_directory: bool,
    ) -> Result<()> {
        let full_path = self.resolve_path(path)?;

        if !full_path.exists() {
            if ignore_if_not_exists {
                return Ok(());
            }
            return Err(Error::NotFound(full_path));
        }

        let is_directory = full_path.is_dir();
        if expect_directory && !is_directory {
            return Err(Error::Other(anyhow::anyhow!(
                "expected a directory but {} is a file",
                full_path.display()
            )));
        }
        if is_directory && !recursive && std::fs::read_dir(&full_path)?.next().is_some() {
            return Err(Error::Other(anyhow::anyhow!(
                "directory {} is not empty",
                full_path.display()
            )));
        }

        let uri = file_url(&full_path)?;
        self.send_will_delete(&uri).await?;

        if is_directory {
            self.delete_directory_recursive(&full_path)?;
        } else {
            let doc = self.documents.lock().get(&uri).cloned();
            if let Some(doc) = doc {
                doc.force_close();
            }
            tokio::fs::remove_file(&full_path).await?;
        }

        self.send_did_delete(&uri);
        Ok(())
    }

    /// Delete a directory tree, closing every open document under it.
    fn delete_directory_recursive(&self, path: &Path) -> Result<()> {
        for entry in std::fs::read_dir(path)? {
            let entry = entry?;
            let entry_path = entry.path();
            let file_type = entry.file_type()?;
            if file_type.is_dir() {
                self.delete_directory_recursive(&entry_path)?;
            } else {
                if let Ok(uri) = lsp::Url::from_file_path(&entry_path) {
                    let doc = self.documents.lock().get(&uri).cloned();
                    if let Some(doc) = doc {
                        doc.force_close();
                    }
                }
                std::fs::remove_file(&entry_path)?;
            }
        }
        std::fs::remove_dir(path)?;
        Ok(())
    }

    // -----------------------------------------------------------------
    // Workspace edits
    // -----------------------------------------------------------------

    async fn perform_text_document_edits(
        self: &Arc<Self>,
        uri: &lsp::Url,
        edits: &[lsp::OneOf<lsp::TextEdit, lsp::AnnotatedTextEdit>],
        version: Option<i32>,
        client: &Arc<Client>,
    ) -> Result<()> {
        let path = self.resolve_uri(uri)?;
        let doc = self.open_by_path(&path, OpenOptions::default())?;

        if let Some(version) = version {
            if doc.version() != version {
                return Err(Error::VersionMismatch {
                    uri: uri.clone(),
                    expected: version,
                    actual: doc.version(),
                });
            }
        }
        if doc.has_pending_edits() {
            return Err(Error::Other(anyhow::anyhow!(
                "cannot apply a workspace edit to {uri}: the document has uncommitted edits"
            )));
        }

        for edit in edits {
            let text_edit = match edit {
                lsp::OneOf::Left(text_edit) => text_edit,
                lsp::OneOf::Right(annotated) => &annotated.text_edit,
            };
            doc.push_text_edit(text_edit, client)?;
        }
        doc.commit_edits()?;
        doc.save().await?;
        doc.close();
        Ok(())
    }

    /// Apply a [`lsp::WorkspaceEdit`] and save every affected document.
    /// Both the `changes` and the `documentChanges` form are supported;
    /// exactly one of the two must be present.
    ///
    /// Boxed because file operations carry `will…` handshakes whose
    /// returned edits are applied through this same function.
    pub(crate) fn perform_edit_and_save<'a>(
        self: &'a Arc<Self>,
        edit: &'a lsp::WorkspaceEdit,
        client: Option<&'a Arc<Client>>,
    ) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            if edit.changes.is_some() && edit.document_changes.is_some() {
                return Err(Error::Other(anyhow::anyhow!(
                    "only one of WorkspaceEdit.changes and WorkspaceEdit.documentChanges may be set"
                )));
            }
            let client = self.resolve_client(client)?;

            if let Some(document_changes) = &edit.document_changes {
                match document_changes {
                    lsp::DocumentChanges::Edits(edits) => {
                        for text_document_edit in edits {
                            self.perform_text_document_edits(
                                &text_document_edit.text_document.uri,
                                &text_document_edit.edits,
                                text_document_edit.text_document.version,
                                &client,
                            )
                            .await?;
                        }
                    }
                    lsp::DocumentChanges::Operations(operations) => {
                        for operation in operations {
                            match operation {
                                lsp::DocumentChangeOperation::Edit(text_document_edit) => {
                                    self.perform_text_document_edits(
                                        &text_document_edit.text_document.uri,
                                        &text_document_edit.edits,
                                        text_document_edit.text_document.version,
                                        &client,
                                    )
                                    .await?;
                                }
                                lsp::DocumentChangeOperation::Op(lsp::ResourceOp::Create(
                                    create,
                                )) => {
                                    let overwrite = create
                                        .options
                                        .as_ref()
                                        .and_then(|options| options.overwrite)
                                        .unwrap_or(false);
                                    let ignore_if_exists = create
                                        .options
                                        .as_ref()
                                        .and_then(|options| options.ignore_if_exists)
                                        .unwrap_or(false);
                                    let path = self.resolve_uri(&create.uri)?;
                                    self.create_file(&path, overwrite, ignore_if_exists).await?;
                                }
                                lsp::DocumentChangeOperation::Op(lsp::ResourceOp::Rename(
                                    rename,
                                )) => {
                                    let overwrite = rename
                                        .options
                                        .as_ref()
                                        .and_then(|options| options.overwrite)
                                        .unwrap_or(false);
                                    let ignore_if_exists = rename
                                        .options
                                        .as_ref()
                                        .and_then(|options| options.ignore_if_exists)
                                        .unwrap_or(false);
                                    let old_path = self.resolve_uri(&rename.old_uri)?;
                                    let new_path = self.resolve_uri(&rename.new_uri)?;
                                    self.rename_text_document(
                                        &old_path,
                                        &new_path,
                                        overwrite,
                                        ignore_if_exists,
                                    )
                                    .await?;
                                }
                                lsp::DocumentChangeOperation::Op(lsp::ResourceOp::Delete(
                                    delete,
                                )) => {
                                    let recursive = delete
                                        .options
                                        .as_ref()
                                        .and_then(|options| options.recursive)
                                        .unwrap_or(false);
                                    let ignore_if_not_exists = delete
                                        .options
                                        .as_ref()
                                        .and_then(|options| options.ignore_if_not_exists)
                                        .unwrap_or(false);
                                    let path = self.resolve_uri(&delete.uri)?;
                                    self.delete_file(
                                        &path,
                                        recursive,
                                        ignore_if_not_exists,
                                        false,
                                    )
                                    .await?;
                                }
                            }
                        }
                    }
                }
            } else if let Some(changes) = &edit.changes {
                for (uri, text_edits) in changes {
                    let edits: Vec<lsp::OneOf<lsp::TextEdit, lsp::AnnotatedTextEdit>> =
                        text_edits.iter().cloned().map(lsp::OneOf::Left).collect();
                    self.perform_text_document_edits(uri, &edits, None, &client)
                        .await?;
                }
            }
            Ok(())
        })
    }
}

impl WorkspaceRequestHandler for WorkspaceInner {
    fn on_workspace_folders(&self) -> Vec<lsp::WorkspaceFolder> {
        self.workspace_folders()
    }

    fn on_configuration(&self, params: lsp::ConfigurationParams) -> Vec<Value> {
        let provider = self.configuration_provider.lock().clone();
        match provider {
            Some(provider) => params
                .items
                .iter()
                .map(|item| provider(item.scope_uri.as_ref(), item.section.as_deref()))
                .collect(),
            None => Vec::new(),
        }
    }

    fn on_apply_edit(
        &self,
        _params: lsp::ApplyWorkspaceEditParams,
    ) -> lsp::ApplyWorkspaceEditResponse {
        // server-pushed edits are not applied implicitly; hosts apply them
        // deliberately through Workspace::perform_edit_and_save
        lsp::ApplyWorkspaceEditResponse {
            applied: false,
            failure_reason: Some(
                "this workspace does not apply server-initiated edits automatically".to_owned(),
            ),
            failed_change: None,
        }
    }

    fn on_publish_diagnostics(&self, params: lsp::PublishDiagnosticsParams) {
        self.diagnostics
            .lock()
            .insert(params.uri, params.diagnostics);
    }
}

/// A set of workspace roots together with the clients and documents opened
/// in them.
#[derive(Clone)]
pub struct Workspace {
    inner: Arc<WorkspaceInner>,
}

impl Workspace {
    /// Open a workspace over `roots`; each root is named after its final
    /// path component.
    pub fn new(roots: impl IntoIterator<Item = PathBuf>) -> Workspace {
        Self::with_named_roots(roots.into_iter().map(|root| {
            let name = root
                .file_stem()
                .map(|stem| stem.to_string_lossy().into_owned())
                .unwrap_or_default();
            (root, name)
        }))
    }

    pub fn with_named_roots(roots: impl IntoIterator<Item = (PathBuf, String)>) -> Workspace {
        let roots = roots
            .into_iter()
            .map(|(root, name)| (scribe_stdx::path::canonicalize(root), name))
            .collect();
        Workspace {
            inner: Arc::new(WorkspaceInner {
                roots,
                default_encoding: Mutex::new(encoding_rs::UTF_8),
                languages: Mutex::new(LanguageDatabase::default()),
                clients: Mutex::new(Vec::new()),
                documents: Mutex::new(HashMap::new()),
                configuration_provider: Mutex::new(None),
                diagnostics: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// The character encoding used for documents opened without an explicit
    /// one.
    pub fn set_default_encoding(&self, label: &str) -> Result<()> {
        let encoding = encoding_rs::Encoding::for_label(label.as_bytes())
            .ok_or_else(|| Error::Other(anyhow::anyhow!("unknown encoding label {label:?}")))?;
        *self.inner.default_encoding.lock() = encoding;
        Ok(())
    }

    /// Extend the language database backing language-id guessing.
    pub fn install_language(
        &self,
        language_id: &str,
        extensions: &[&str],
        allow_overwrite: bool,
    ) -> Result<()> {
        self.inner
            .languages
            .lock()
            .install_language(language_id, extensions, allow_overwrite)
    }

    pub fn workspace_folders(&self) -> Vec<lsp::WorkspaceFolder> {
        self.inner.workspace_folders()
    }

    pub fn clients(&self) -> Vec<Arc<Client>> {
        self.inner.clients()
    }

    /// Create a client registered with this workspace without starting the
    /// language server yet.
    pub fn create_client(
        &self,
        launch_params: LaunchParams,
        initialize_params: Option<lsp::InitializeParams>,
    ) -> Arc<Client> {
        let client = Client::new(launch_params, initialize_params);
        // a freshly created client cannot already be registered
        self.inner
            .register_client(&client)
            .expect("fresh client was already registered");
        client
    }

    /// Create a client and drive it all the way to the `running` state.
    pub async fn launch_client(
        &self,
        launch_params: LaunchParams,
        initialize_params: Option<lsp::InitializeParams>,
    ) -> Result<Arc<Client>> {
        let client = self.create_client(launch_params, initialize_params);
        client.start().await?;
        Ok(client)
    }

    /// Register an externally created client (for example one attached to
    /// an already-established connection) with this workspace.
    pub fn register_client(&self, client: &Arc<Client>) -> Result<()> {
        self.inner.register_client(client)
    }

    pub fn set_configuration_provider(
        &self,
        provider: Option<Arc<ConfigurationProvider>>,
    ) {
        *self.inner.configuration_provider.lock() = provider;
    }

    /// The most recent diagnostics a server published for `uri`.
    pub fn diagnostics(&self, uri: &lsp::Url) -> Vec<lsp::Diagnostic> {
        self.inner
            .diagnostics
            .lock()
            .get(uri)
            .cloned()
            .unwrap_or_default()
    }

    /// Open a document from this workspace. Opening an already-open path
    /// returns another handle to the same document (reference-counted).
    pub fn open_text_document(&self, path: impl AsRef<Path>) -> Result<Document> {
        self.inner
            .open_by_path(path.as_ref(), OpenOptions::default())
    }

    pub fn open_text_document_with(
        &self,
        path: impl AsRef<Path>,
        options: OpenOptions,
    ) -> Result<Document> {
        self.inner.open_by_path(path.as_ref(), options)
    }

    /// Create a file (running the `willCreateFiles`/`didCreateFiles`
    /// handshake) and open it.
    pub async fn create_text_document(
        &self,
        path: impl AsRef<Path>,
        options: CreateOptions,
    ) -> Result<Document> {
        self.inner
            .create_file(path.as_ref(), options.overwrite, options.ignore_if_exists)
            .await?;
        self.inner.open_by_path(path.as_ref(), options.open)
    }

    /// Rename a file. If the document is open its URI changes in place and
    /// the registry re-keys; handles stay valid. An open document at the
    /// destination is force-closed first.
    pub async fn rename_text_document(
        &self,
        source: impl AsRef<Path>,
        destination: impl AsRef<Path>,
        overwrite: bool,
        ignore_if_exists: bool,
    ) -> Result<()> {
        self.inner
            .rename_text_document(
                source.as_ref(),
                destination.as_ref(),
                overwrite,
                ignore_if_exists,
            )
            .await
    }

    /// Delete a file, closing its document if it is open.
    pub async fn delete_text_document(
        &self,
        path: impl AsRef<Path>,
        ignore_if_not_exists: bool,
    ) -> Result<()> {
        self.inner
            .delete_file(path.as_ref(), false, ignore_if_not_exists, false)
            .await
    }

    /// Delete a directory. With `recursive` the whole tree is removed and
    /// every open document under it is closed; otherwise the directory must
    /// be empty.
    pub async fn delete_directory(
        &self,
        path: impl AsRef<Path>,
        recursive: bool,
        ignore_if_not_exists: bool,
    ) -> Result<()> {
        self.inner
            .delete_file(path.as_ref(), recursive, ignore_if_not_exists, true)
            .await
    }

    /// Apply a workspace edit and save all affected documents. `client`
    /// selects the position encoding for the contained text edits; it may
    /// be omitted when exactly one client is registered.
    pub async fn perform_edit_and_save(
        &self,
        edit: &lsp::WorkspaceEdit,
        client: Option<&Arc<Client>>,
    ) -> Result<()> {
        self.inner.perform_edit_and_save(edit, client).await
    }

    pub(crate) fn inner(&self) -> &Arc<WorkspaceInner> {
        &self.inner
    }

    /// Close every document and shut down every client.
    pub async fn close(&self) {
        let docs: Vec<Arc<TextDocument>> =
            self.inner.documents.lock().values().cloned().collect();
        for doc in docs {
            doc.force_close();
        }

        let clients = self.inner.clients();
        for client in clients.iter().rev() {
            if let Err(err) = client.shutdown_and_exit().await {
                warn!("failed to shut down client {}: {err}", client.name());
            }
        }
        self.inner.clients.lock().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[tokio::test]
    async fn create_text_document_creates_parent_directories() {
        let dir = tempfile::tempdir().unwrap();
        let ws = Workspace::new([dir.path().to_path_buf()]);

        let doc = ws
            .create_text_document("nested/deeper/new.py", CreateOptions::default())
            .await
            .unwrap();
        assert_eq!(doc.text().to_string(), "");
        assert!(dir.path().join("nested/deeper/new.py").is_file());
    }

    #[tokio::test]
    async fn create_respects_exists_flags() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("present.py"), "x = 1\n").unwrap();
        let ws = Workspace::new([dir.path().to_path_buf()]);

        let err = ws
            .create_text_document("present.py", CreateOptions::default())
            .await;
        assert!(matches!(err, Err(Error::AlreadyExists(_))));

        // ignore_if_exists opens the file untouched
        let doc = ws
            .create_text_document(
                "present.py",
                CreateOptions {
                    ignore_if_exists: true,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(doc.text().to_string(), "x = 1\n");
        doc.close();

        // overwrite truncates
        let doc = ws
            .create_text_document(
                "present.py",
                CreateOptions {
                    overwrite: true,
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(doc.text().to_string(), "");
    }

    #[tokio::test]
    async fn relative_paths_must_match_exactly_one_root() {
        let dir_a = tempfile::tempdir().unwrap();
        let dir_b = tempfile::tempdir().unwrap();
        fs::write(dir_b.path().join("only_in_b.py"), "pass\n").unwrap();
        fs::write(dir_a.path().join("both.py"), "a\n").unwrap();
        fs::write(dir_b.path().join("both.py"), "b\n").unwrap();

        let ws = Workspace::new([dir_a.path().to_path_buf(), dir_b.path().to_path_buf()]);

        let doc = ws.open_text_document("only_in_b.py").unwrap();
        assert_eq!(doc.text().to_string(), "pass\n");

        assert!(matches!(
            ws.open_text_document("both.py"),
            Err(Error::AmbiguousPath(_))
        ));
        assert!(matches!(
            ws.open_text_document("nowhere.py"),
            Err(Error::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn rename_of_an_open_document_rekeys_the_registry() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.py"), "pass\n").unwrap();
        let ws = Workspace::new([dir.path().to_path_buf()]);

        let doc = ws.open_text_document("a.py").unwrap();
        let old_uri = doc.uri();

        ws.rename_text_document("a.py", "b.py", false, false)
            .await
            .unwrap();

        assert_ne!(doc.uri(), old_uri);
        assert!(doc.uri().as_str().ends_with("b.py"));
        assert!(!dir.path().join("a.py").exists());
        assert!(dir.path().join("b.py").is_file());

        // the registry serves the new URI, still the same document
        let again = ws.open_text_document("b.py").unwrap();
        assert_eq!(again.reference_count(), 2);
    }

    #[tokio::test]
    async fn rename_over_open_destination_closes_it() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("a.py"), "aaa\n").unwrap();
        fs::write(dir.path().join("b.py"), "bbb\n").unwrap();
        let ws = Workspace::new([dir.path().to_path_buf()]);

        let destination = ws.open_text_document("b.py").unwrap();
        ws.rename_text_document("a.py", "b.py", true, false)
            .await
            .unwrap();

        assert!(destination.is_closed());
        assert_eq!(
            fs::read_to_string(dir.path().join("b.py")).unwrap(),
            "aaa\n"
        );
    }

    #[tokio::test]
    async fn delete_closes_open_documents() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("doomed.py"), "pass\n").unwrap();
        let ws = Workspace::new([dir.path().to_path_buf()]);

        let doc = ws.open_text_document("doomed.py").unwrap();
        ws.delete_text_document("doomed.py", false).await.unwrap();

        assert!(doc.is_closed());
        assert!(!dir.path().join("doomed.py").exists());

        // missing files honor the ignore flag
        assert!(matches!(
            ws.delete_text_document("doomed.py", false).await,
            Err(Error::NotFound(_))
        ));
        ws.delete_text_document("doomed.py", true).await.unwrap();
    }

    #[tokio::test]
    async fn recursive_directory_deletion_closes_covered_documents() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir_all(dir.path().join("sub/inner")).unwrap();
        fs::write(dir.path().join("sub/inner/deep.py"), "pass\n").unwrap();
        fs::write(dir.path().join("sub/top.py"), "pass\n").unwrap();
        let ws = Workspace::new([dir.path().to_path_buf()]);

        let deep = ws.open_text_document("sub/inner/deep.py").unwrap();

        // non-recursive deletion refuses a non-empty directory
        assert!(ws.delete_directory("sub", false, false).await.is_err());

        ws.delete_directory("sub", true, false).await.unwrap();
        assert!(deep.is_closed());
        assert!(!dir.path().join("sub").exists());
    }
}
