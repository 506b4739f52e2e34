//! Workspace symbol queries.
//!
//! `workspace/symbol` results come back unresolved; resolving one
//! (optionally via `workspaceSymbol/resolve`) opens the containing document
//! reference-counted and yields a [`Symbol`] that can be navigated from.
//! Dropping the `Symbol` closes its document again.

use std::sync::Arc;

use crate::capabilities::FeatureQuery;
use crate::client::Client;
use crate::document::{Document, TextDocument};
use crate::lsp;
use crate::workspace::Workspace;
use crate::{Error, Result};

fn symbol_information_to_workspace_symbol(info: lsp::SymbolInformation) -> lsp::WorkspaceSymbol {
    let lsp::SymbolInformation {
        name,
        kind,
        tags,
        location,
        container_name,
        ..
    } = info;
    lsp::WorkspaceSymbol {
        name,
        kind,
        tags,
        container_name,
        location: lsp::OneOf::Left(location),
        data: None,
    }
}

/// A `workspace/symbol` result that has not been resolved yet. Cheap to
/// hold: no document is opened until [`UnresolvedSymbol::resolve`].
pub struct UnresolvedSymbol {
    workspace: Workspace,
    client: Arc<Client>,
    raw: lsp::WorkspaceSymbol,
}

impl UnresolvedSymbol {
    pub fn name(&self) -> &str {
        &self.raw.name
    }

    pub fn kind(&self) -> lsp::SymbolKind {
        self.raw.kind
    }

    pub fn tags(&self) -> &[lsp::SymbolTag] {
        self.raw.tags.as_deref().unwrap_or_default()
    }

    pub fn container_name(&self) -> Option<&str> {
        self.raw.container_name.as_deref()
    }

    /// The URI of the document containing this symbol.
    pub fn uri(&self) -> &lsp::Url {
        match &self.raw.location {
            lsp::OneOf::Left(location) => &location.uri,
            lsp::OneOf::Right(workspace_location) => &workspace_location.uri,
        }
    }

    /// Resolve the symbol: ask the server to fill in the full location when
    /// it supports `workspaceSymbol/resolve`, then open the containing
    /// document.
    pub async fn resolve(self) -> Result<Symbol> {
        let needs_resolve = matches!(self.raw.location, lsp::OneOf::Right(_));
        let raw = if self.client.check_feature(
            "workspace/symbol",
            &FeatureQuery::new().workspace_symbol_resolve(true),
        ) {
            self.client
                .request::<lsp::request::WorkspaceSymbolResolve>(self.raw.clone())
                .await?
        } else if needs_resolve {
            return Err(Error::FeatureUnsupported(
                "workspaceSymbol/resolve".to_owned(),
            ));
        } else {
            self.raw
        };

        let (uri, range) = match &raw.location {
            lsp::OneOf::Left(location) => (location.uri.clone(), location.range),
            lsp::OneOf::Right(_) => {
                return Err(Error::Other(anyhow::anyhow!(
                    "server did not resolve a full location for symbol {}",
                    raw.name
                )))
            }
        };
        let path = uri
            .to_file_path()
            .map_err(|_| Error::Other(anyhow::anyhow!("{uri} is not a file URI")))?;
        let document = self.workspace.open_text_document(&path)?;
        let from = document.position_to_offset(range.start, &self.client)?;
        let to = document.position_to_offset(range.end, &self.client)?;

        Ok(Symbol {
            client: self.client,
            document,
            name: raw.name,
            kind: raw.kind,
            tags: raw.tags.unwrap_or_default(),
            container_name: raw.container_name,
            range: (from, to),
        })
    }
}

/// A resolved workspace symbol. Owns a reference-counted handle to its
/// containing document, which closes when the symbol is dropped.
pub struct Symbol {
    client: Arc<Client>,
    document: Document,
    name: String,
    kind: lsp::SymbolKind,
    tags: Vec<lsp::SymbolTag>,
    container_name: Option<String>,
    /// Codepoint offsets of the symbol's range in the document.
    range: (usize, usize),
}

impl Symbol {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> lsp::SymbolKind {
        self.kind
    }

    pub fn tags(&self) -> &[lsp::SymbolTag] {
        &self.tags
    }

    pub fn container_name(&self) -> Option<&str> {
        self.container_name.as_deref()
    }

    pub fn range(&self) -> (usize, usize) {
        self.range
    }

    pub fn document(&self) -> &TextDocument {
        &self.document
    }

    /// Close the symbol's document handle explicitly.
    pub fn close(self) {
        let Symbol { document, .. } = self;
        document.close();
    }

    fn ensure_feature(&self, method: &str) -> Result<()> {
        let query = FeatureQuery::new().text_document(self.document.info());
        if !self.client.check_feature(method, &query) {
            return Err(Error::FeatureUnsupported(method.to_owned()));
        }
        Ok(())
    }

    fn position_params(&self) -> Result<lsp::TextDocumentPositionParams> {
        Ok(lsp::TextDocumentPositionParams {
            text_document: self.document.identifier(),
            position: self.document.offset_to_position(self.range.0, &self.client)?,
        })
    }

    async fn goto<R>(&self, method: &str) -> Result<Vec<lsp::Location>>
    where
        R: lsp::request::Request<
            Params = lsp::GotoDefinitionParams,
            Result = Option<lsp::GotoDefinitionResponse>,
        >,
    {
        self.ensure_feature(method)?;
        let params = lsp::GotoDefinitionParams {
            text_document_position_params: self.position_params()?,
            work_done_progress_params: Default::default(),
            partial_result_params: Default::default(),
        };
        let response = self.client.request::<R>(params).await?;
        Ok(match response {
            None => Vec::new(),
            Some(lsp::GotoDefinitionResponse::Scalar(location)) => vec![location],
            Some(lsp::GotoDefinitionResponse::Array(locations)) => locations,
            Some(lsp::GotoDefinitionResponse::Link(links)) => links
                .into_iter()
                .map(|link| lsp::Location {
                    uri: link.target_uri,
                    range: link.target_selection_range,
                })
                .collect(),
        })
    }

    pub async fn find_references(&self, include_declaration: bool) -> Result<Vec<lsp::Location>> {
        self.ensure_feature("textDocument/references")?;
        let params = lsp::ReferenceParams {
            text_document_position: self.position_params()?,
            work_done_progress_params: Default::default(),
            partial_result_params: Default::default(),
            context: lsp::ReferenceContext {
                include_declaration,
            },
        };
        let locations = self
            .client
            .request::<lsp::request::References>(params)
            .await?;
        Ok(locations.unwrap_or_default())
    }

    pub async fn find_declaration(&self) -> Result<Vec<lsp::Location>> {
        self.goto::<lsp::request::GotoDeclaration>("textDocument/declaration")
            .await
    }

    pub async fn find_definition(&self) -> Result<Vec<lsp::Location>> {
        self.goto::<lsp::request::GotoDefinition>("textDocument/definition")
            .await
    }

    pub async fn find_type_definition(&self) -> Result<Vec<lsp::Location>> {
        self.goto::<lsp::request::GotoTypeDefinition>("textDocument/typeDefinition")
            .await
    }

    pub async fn find_implementation(&self) -> Result<Vec<lsp::Location>> {
        self.goto::<lsp::request::GotoImplementation>("textDocument/implementation")
            .await
    }

    /// Ask the server for the workspace edit renaming this symbol. The edit
    /// is returned, not applied; pass it to
    /// [`Workspace::perform_edit_and_save`].
    pub async fn rename(&self, new_name: &str) -> Result<Option<lsp::WorkspaceEdit>> {
        self.ensure_feature("textDocument/rename")?;
        let params = lsp::RenameParams {
            text_document_position: self.position_params()?,
            new_name: new_name.to_owned(),
            work_done_progress_params: Default::default(),
        };
        self.client.request::<lsp::request::Rename>(params).await
    }
}

/// One node of a document outline, with ranges as codepoint offsets into
/// the document.
#[derive(Debug, Clone)]
pub struct OutlineSymbol {
    pub name: String,
    pub detail: Option<String>,
    pub kind: lsp::SymbolKind,
    pub tags: Vec<lsp::SymbolTag>,
    /// The full extent of the symbol (body included).
    pub range: (usize, usize),
    /// The range to highlight when revealing the symbol, e.g. its name.
    pub selection_range: (usize, usize),
    pub children: Vec<OutlineSymbol>,
}

fn outline_from_document_symbol(
    doc: &TextDocument,
    client: &Client,
    symbol: lsp::DocumentSymbol,
) -> crate::Result<OutlineSymbol> {
    let range = (
        doc.position_to_offset(symbol.range.start, client)?,
        doc.position_to_offset(symbol.range.end, client)?,
    );
    let selection_range = (
        doc.position_to_offset(symbol.selection_range.start, client)?,
        doc.position_to_offset(symbol.selection_range.end, client)?,
    );
    let children = symbol
        .children
        .unwrap_or_default()
        .into_iter()
        .map(|child| outline_from_document_symbol(doc, client, child))
        .collect::<crate::Result<Vec<_>>>()?;
    Ok(OutlineSymbol {
        name: symbol.name,
        detail: symbol.detail,
        kind: symbol.kind,
        tags: symbol.tags.unwrap_or_default(),
        range,
        selection_range,
        children,
    })
}

impl TextDocument {
    /// Load the document outline (the symbols defined in this document,
    /// hierarchical when the server produces a hierarchy). The outline is
    /// valid until the document changes.
    pub async fn outline(&self, client: &Arc<Client>) -> crate::Result<Vec<OutlineSymbol>> {
        let query = FeatureQuery::new().text_document(self.info());
        if !client.check_feature("textDocument/documentSymbol", &query) {
            return Err(Error::FeatureUnsupported(
                "textDocument/documentSymbol".to_owned(),
            ));
        }

        let params = lsp::DocumentSymbolParams {
            text_document: self.identifier(),
            work_done_progress_params: Default::default(),
            partial_result_params: Default::default(),
        };
        let response = client
            .request::<lsp::request::DocumentSymbolRequest>(params)
            .await?;

        match response {
            None => Ok(Vec::new()),
            Some(lsp::DocumentSymbolResponse::Nested(symbols)) => symbols
                .into_iter()
                .map(|symbol| outline_from_document_symbol(self, client, symbol))
                .collect(),
            Some(lsp::DocumentSymbolResponse::Flat(symbol_informations)) => symbol_informations
                .into_iter()
                .map(|info| {
                    let range = (
                        self.position_to_offset(info.location.range.start, client)?,
                        self.position_to_offset(info.location.range.end, client)?,
                    );
                    Ok(OutlineSymbol {
                        name: info.name,
                        detail: None,
                        kind: info.kind,
                        tags: info.tags.unwrap_or_default(),
                        range,
                        selection_range: range,
                        children: Vec::new(),
                    })
                })
                .collect(),
        }
    }
}

impl Workspace {
    /// Query the workspace for symbols. The result list is unresolved; call
    /// [`UnresolvedSymbol::resolve`] on the entries that are actually
    /// needed, or use [`Workspace::query_symbols_resolved`].
    pub async fn query_symbols(
        &self,
        query: &str,
        client: Option<&Arc<Client>>,
    ) -> Result<Vec<UnresolvedSymbol>> {
        let client = self.inner().resolve_client(client)?;
        if !client.check_feature("workspace/symbol", &FeatureQuery::new()) {
            return Err(Error::FeatureUnsupported("workspace/symbol".to_owned()));
        }
        if query.is_empty() {
            log::warn!("querying symbols with an empty query returns every symbol in the workspace");
        }

        let params = lsp::WorkspaceSymbolParams {
            query: query.to_owned(),
            work_done_progress_params: Default::default(),
            partial_result_params: Default::default(),
        };
        let response = client
            .request::<lsp::request::WorkspaceSymbolRequest>(params)
            .await?;
        let Some(response) = response else {
            log::warn!("server returned null for workspace/symbol with query {query:?}");
            return Ok(Vec::new());
        };

        let raw = match response {
            lsp::WorkspaceSymbolResponse::Flat(symbol_informations) => symbol_informations
                .into_iter()
                .map(symbol_information_to_workspace_symbol)
                .collect(),
            lsp::WorkspaceSymbolResponse::Nested(workspace_symbols) => workspace_symbols,
        };
        Ok(raw
            .into_iter()
            .map(|raw| UnresolvedSymbol {
                workspace: self.clone(),
                client: Arc::clone(&client),
                raw,
            })
            .collect())
    }

    /// Like [`Workspace::query_symbols`], but resolves every result
    /// concurrently, opening the containing documents.
    pub async fn query_symbols_resolved(
        &self,
        query: &str,
        client: Option<&Arc<Client>>,
    ) -> Result<Vec<Symbol>> {
        let unresolved = self.query_symbols(query, client).await?;
        futures_util::future::join_all(
            unresolved.into_iter().map(UnresolvedSymbol::resolve),
        )
        .await
        .into_iter()
        .collect()
    }
}
