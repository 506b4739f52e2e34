//! The capability registry: a queryable view of everything a server has
//! declared support for, combining the static `ServerCapabilities` from the
//! `initialize` result with dynamic `client/registerCapability` /
//! `client/unregisterCapability` traffic.
//!
//! Every supported feature is kept as a [`FeatureRegistration`] keyed by its
//! *registration* method name. Multiple registrations may coexist for one
//! method, differentiated by document selector and options; a query matches
//! if at least one registration satisfies every predicate.

use std::collections::HashMap;

use log::{info, warn};
use serde_json::Value;
use tokio::sync::oneshot;

use crate::filters::{matches_document_selector, matches_file_operation_filters};
use crate::lsp;

/// The identity of a text document as far as feature queries are concerned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextDocumentInfo {
    pub uri: lsp::Url,
    pub language_id: String,
}

/// Options attached to a feature registration, tagged by the kind of
/// capability they describe so predicates can be evaluated without
/// downcasting.
#[derive(Debug, Clone)]
pub enum RegistrationOptions {
    TextDocumentSync(lsp::TextDocumentSyncOptions),
    Save(lsp::SaveOptions),
    SemanticTokens(lsp::SemanticTokensOptions),
    CodeAction(lsp::CodeActionOptions),
    Completion(lsp::CompletionOptions),
    ExecuteCommand(lsp::ExecuteCommandOptions),
    Diagnostic(lsp::DiagnosticOptions),
    WorkspaceSymbol(lsp::WorkspaceSymbolOptions),
    CodeLens(lsp::CodeLensOptions),
    DocumentLink(lsp::DocumentLinkOptions),
    InlayHint(lsp::InlayHintOptions),
    FileOperations(lsp::FileOperationRegistrationOptions),
    /// Options this registry has no predicates for; kept verbatim.
    Other(Value),
    None,
}

#[derive(Debug, Clone)]
pub struct FeatureRegistration {
    /// Registrations without an id cannot be unregistered.
    pub id: Option<String>,
    /// The *registration* method, which may differ from the request method
    /// (e.g. `textDocument/semanticTokens` covers the `full`, `full/delta`
    /// and `range` requests).
    pub method: String,
    pub document_selector: Option<Vec<lsp::DocumentFilter>>,
    pub options: RegistrationOptions,
}

impl FeatureRegistration {
    fn new(method: &str, options: RegistrationOptions) -> FeatureRegistration {
        FeatureRegistration {
            id: None,
            method: method.to_owned(),
            document_selector: None,
            options,
        }
    }
}

/// Which of the semantic-tokens request variants a caller needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SemanticTokensVariant {
    Full,
    FullDelta,
    Range,
}

/// A set of named predicates evaluated against a registration's options.
/// An empty query matches any registration for the method.
#[derive(Debug, Clone, Default)]
pub struct FeatureQuery {
    pub text_documents: Vec<TextDocumentInfo>,
    pub sync_kind: Option<lsp::TextDocumentSyncKind>,
    pub include_text: Option<bool>,
    pub file_operations: Vec<lsp::Url>,
    pub semantic_tokens: Vec<SemanticTokensVariant>,
    pub code_actions: Vec<lsp::CodeActionKind>,
    pub workspace_commands: Vec<String>,
    pub code_action_resolve: Option<bool>,
    pub completion_item_resolve: Option<bool>,
    pub completion_item_label_details: Option<bool>,
    pub inlay_hint_resolve: Option<bool>,
    pub workspace_diagnostics: Option<bool>,
    pub workspace_symbol_resolve: Option<bool>,
    pub code_lens_resolve: Option<bool>,
    pub document_link_resolve: Option<bool>,
}

impl FeatureQuery {
    pub fn new() -> FeatureQuery {
        FeatureQuery::default()
    }

    pub fn text_document(mut self, info: TextDocumentInfo) -> Self {
        self.text_documents.push(info);
        self
    }

    pub fn sync_kind(mut self, kind: lsp::TextDocumentSyncKind) -> Self {
        self.sync_kind = Some(kind);
        self
    }

    pub fn include_text(mut self, include_text: bool) -> Self {
        self.include_text = Some(include_text);
        self
    }

    pub fn file_operation(mut self, uri: lsp::Url) -> Self {
        self.file_operations.push(uri);
        self
    }

    pub fn semantic_tokens(mut self, variants: impl IntoIterator<Item = SemanticTokensVariant>) -> Self {
        self.semantic_tokens.extend(variants);
        self
    }

    pub fn code_actions(mut self, kinds: impl IntoIterator<Item = lsp::CodeActionKind>) -> Self {
        self.code_actions.extend(kinds);
        self
    }

    pub fn workspace_commands(mut self, commands: impl IntoIterator<Item = String>) -> Self {
        self.workspace_commands.extend(commands);
        self
    }

    pub fn workspace_symbol_resolve(mut self, resolve: bool) -> Self {
        self.workspace_symbol_resolve = Some(resolve);
        self
    }

    pub fn completion_item_resolve(mut self, resolve: bool) -> Self {
        self.completion_item_resolve = Some(resolve);
        self
    }

    pub fn code_action_resolve(mut self, resolve: bool) -> Self {
        self.code_action_resolve = Some(resolve);
        self
    }

    /// Whether `registration` satisfies every predicate of this query.
    /// Predicates that do not apply to the registration's option kind are
    /// vacuously satisfied, mirroring how a server that registered a feature
    /// without detailed options still provides the feature.
    pub(crate) fn matches(&self, registration: &FeatureRegistration) -> bool {
        if !self.text_documents.is_empty() {
            if let Some(selector) = &registration.document_selector {
                if !self
                    .text_documents
                    .iter()
                    .all(|doc| matches_document_selector(doc, selector))
                {
                    return false;
                }
            }
        }

        if let Some(kind) = self.sync_kind {
            if let RegistrationOptions::TextDocumentSync(options) = &registration.options {
                if options.change != Some(kind) {
                    return false;
                }
            }
        }

        if let Some(include_text) = self.include_text {
            if let RegistrationOptions::Save(options) = &registration.options {
                if options.include_text.unwrap_or(false) != include_text {
                    return false;
                }
            }
        }

        if !self.file_operations.is_empty() {
            if let RegistrationOptions::FileOperations(options) = &registration.options {
                if !self
                    .file_operations
                    .iter()
                    .all(|uri| matches_file_operation_filters(uri, &options.filters))
                {
                    return false;
                }
            }
        }

        if !self.semantic_tokens.is_empty() {
            if let RegistrationOptions::SemanticTokens(options) = &registration.options {
                for variant in &self.semantic_tokens {
                    let supported = match variant {
                        SemanticTokensVariant::Full => !matches!(
                            options.full,
                            None | Some(lsp::SemanticTokensFullOptions::Bool(false))
                        ),
                        SemanticTokensVariant::FullDelta => matches!(
                            options.full,
                            Some(lsp::SemanticTokensFullOptions::Delta { delta: Some(true) })
                        ),
                        SemanticTokensVariant::Range => options.range == Some(true),
                    };
                    if !supported {
                        return false;
                    }
                }
            }
        }

        if !self.code_actions.is_empty() {
            if let RegistrationOptions::CodeAction(options) = &registration.options {
                let kinds = options.code_action_kinds.as_deref().unwrap_or(&[]);
                if !self.code_actions.iter().all(|kind| kinds.contains(kind)) {
                    return false;
                }
            }
        }

        if !self.workspace_commands.is_empty() {
            if let RegistrationOptions::ExecuteCommand(options) = &registration.options {
                if !self
                    .workspace_commands
                    .iter()
                    .all(|command| options.commands.contains(command))
                {
                    return false;
                }
            }
        }

        if let Some(resolve) = self.code_action_resolve {
            if let RegistrationOptions::CodeAction(options) = &registration.options {
                if options.resolve_provider.unwrap_or(false) != resolve {
                    return false;
                }
            }
        }

        if let Some(resolve) = self.completion_item_resolve {
            if let RegistrationOptions::Completion(options) = &registration.options {
                if options.resolve_provider.unwrap_or(false) != resolve {
                    return false;
                }
            }
        }

        if let Some(label_details) = self.completion_item_label_details {
            if let RegistrationOptions::Completion(options) = &registration.options {
                let supported = options
                    .completion_item
                    .as_ref()
                    .and_then(|item| item.label_details_support)
                    .unwrap_or(false);
                if supported != label_details {
                    return false;
                }
            }
        }

        if let Some(resolve) = self.inlay_hint_resolve {
            if let RegistrationOptions::InlayHint(options) = &registration.options {
                if options.resolve_provider.unwrap_or(false) != resolve {
                    return false;
                }
            }
        }

        if let Some(workspace) = self.workspace_diagnostics {
            if let RegistrationOptions::Diagnostic(options) = &registration.options {
                if options.workspace_diagnostics != workspace {
                    return false;
                }
            }
        }

        if let Some(resolve) = self.workspace_symbol_resolve {
            if let RegistrationOptions::WorkspaceSymbol(options) = &registration.options {
                if options.resolve_provider.unwrap_or(false) != resolve {
                    return false;
                }
            }
        }

        if let Some(resolve) = self.code_lens_resolve {
            if let RegistrationOptions::CodeLens(options) = &registration.options {
                if options.resolve_provider.unwrap_or(false) != resolve {
                    return false;
                }
            }
        }

        if let Some(resolve) = self.document_link_resolve {
            if let RegistrationOptions::DocumentLink(options) = &registration.options {
                if options.resolve_provider.unwrap_or(false) != resolve {
                    return false;
                }
            }
        }

        true
    }
}

fn sync_kind_to_options(kind: lsp::TextDocumentSyncKind) -> lsp::TextDocumentSyncOptions {
    // Expansion rule taken from the reference client implementation: a bare
    // sync kind implies open/close notifications and saves without text.
    if kind == lsp::TextDocumentSyncKind::NONE {
        lsp::TextDocumentSyncOptions {
            open_close: Some(false),
            change: Some(lsp::TextDocumentSyncKind::NONE),
            ..Default::default()
        }
    } else {
        lsp::TextDocumentSyncOptions {
            open_close: Some(true),
            change: Some(kind),
            save: Some(lsp::TextDocumentSyncSaveOptions::SaveOptions(
                lsp::SaveOptions {
                    include_text: Some(false),
                },
            )),
            ..Default::default()
        }
    }
}

fn sync_options_registrations(
    options: &lsp::TextDocumentSyncOptions,
    out: &mut Vec<FeatureRegistration>,
) {
    if options.open_close == Some(true) {
        for method in ["textDocument/didOpen", "textDocument/didClose"] {
            out.push(FeatureRegistration::new(
                method,
                RegistrationOptions::TextDocumentSync(options.clone()),
            ));
        }
    }

    match &options.save {
        Some(lsp::TextDocumentSyncSaveOptions::Supported(true)) => {
            out.push(FeatureRegistration::new(
                "textDocument/didSave",
                RegistrationOptions::Save(lsp::SaveOptions { include_text: None }),
            ));
        }
        Some(lsp::TextDocumentSyncSaveOptions::SaveOptions(save)) => {
            out.push(FeatureRegistration::new(
                "textDocument/didSave",
                RegistrationOptions::Save(save.clone()),
            ));
        }
        Some(lsp::TextDocumentSyncSaveOptions::Supported(false)) | None => {}
    }

    if options.will_save == Some(true) {
        out.push(FeatureRegistration::new(
            "textDocument/willSave",
            RegistrationOptions::TextDocumentSync(options.clone()),
        ));
    }
    if options.will_save_wait_until == Some(true) {
        out.push(FeatureRegistration::new(
            "textDocument/willSaveWaitUntil",
            RegistrationOptions::TextDocumentSync(options.clone()),
        ));
    }
    if options
        .change
        .is_some_and(|change| change != lsp::TextDocumentSyncKind::NONE)
    {
        out.push(FeatureRegistration::new(
            "textDocument/didChange",
            RegistrationOptions::TextDocumentSync(options.clone()),
        ));
    }
}

/// Flatten the tree of optional provider fields of a `ServerCapabilities`
/// into a flat list of feature registrations.
pub(crate) fn registrations_from_server_capabilities(
    capabilities: &lsp::ServerCapabilities,
) -> Vec<FeatureRegistration> {
    use lsp::OneOf;

    let mut out = Vec::new();

    if let Some(sync) = &capabilities.text_document_sync {
        let options = match sync {
            lsp::TextDocumentSyncCapability::Kind(kind) => sync_kind_to_options(*kind),
            lsp::TextDocumentSyncCapability::Options(options) => options.clone(),
        };
        sync_options_registrations(&options, &mut out);
    }

    // Simple providers: anything that is not `None`/`false` counts as one
    // registration without per-method options.
    let mut simple = |method: &str, provided: bool| {
        if provided {
            out.push(FeatureRegistration::new(method, RegistrationOptions::None));
        }
    };

    fn one_of<T>(provider: &Option<OneOf<bool, T>>) -> bool {
        matches!(provider, Some(OneOf::Left(true)) | Some(OneOf::Right(_)))
    }

    simple(
        "textDocument/hover",
        matches!(
            capabilities.hover_provider,
            Some(lsp::HoverProviderCapability::Simple(true))
                | Some(lsp::HoverProviderCapability::Options(_))
        ),
    );
    simple(
        "textDocument/declaration",
        matches!(
            capabilities.declaration_provider,
            Some(lsp::DeclarationCapability::Simple(true))
                | Some(lsp::DeclarationCapability::RegistrationOptions(_))
                | Some(lsp::DeclarationCapability::Options(_))
        ),
    );
    simple(
        "textDocument/definition",
        one_of(&capabilities.definition_provider),
    );
    simple(
        "textDocument/typeDefinition",
        matches!(
            capabilities.type_definition_provider,
            Some(lsp::TypeDefinitionProviderCapability::Simple(true))
                | Some(lsp::TypeDefinitionProviderCapability::Options(_))
        ),
    );
    simple(
        "textDocument/implementation",
        matches!(
            capabilities.implementation_provider,
            Some(lsp::ImplementationProviderCapability::Simple(true))
                | Some(lsp::ImplementationProviderCapability::Options(_))
        ),
    );
    simple(
        "textDocument/references",
        one_of(&capabilities.references_provider),
    );
    simple(
        "textDocument/documentHighlight",
        one_of(&capabilities.document_highlight_provider),
    );
    simple(
        "textDocument/documentSymbol",
        one_of(&capabilities.document_symbol_provider),
    );
    simple(
        "textDocument/documentColor",
        matches!(
            capabilities.color_provider,
            Some(lsp::ColorProviderCapability::Simple(true))
                | Some(lsp::ColorProviderCapability::ColorProvider(_))
                | Some(lsp::ColorProviderCapability::Options(_))
        ),
    );
    simple(
        "textDocument/foldingRange",
        matches!(
            capabilities.folding_range_provider,
            Some(lsp::FoldingRangeProviderCapability::Simple(true))
                | Some(lsp::FoldingRangeProviderCapability::FoldingProvider(_))
                | Some(lsp::FoldingRangeProviderCapability::Options(_))
        ),
    );
    simple(
        "textDocument/selectionRange",
        matches!(
            capabilities.selection_range_provider,
            Some(lsp::SelectionRangeProviderCapability::Simple(true))
                | Some(lsp::SelectionRangeProviderCapability::Options(_))
                | Some(lsp::SelectionRangeProviderCapability::RegistrationOptions(_))
        ),
    );
    simple(
        "textDocument/prepareCallHierarchy",
        matches!(
            capabilities.call_hierarchy_provider,
            Some(lsp::CallHierarchyServerCapability::Simple(true))
                | Some(lsp::CallHierarchyServerCapability::Options(_))
        ),
    );
    simple(
        "textDocument/linkedEditingRange",
        matches!(
            capabilities.linked_editing_range_provider,
            Some(lsp::LinkedEditingRangeServerCapabilities::Simple(true))
                | Some(lsp::LinkedEditingRangeServerCapabilities::Options(_))
                | Some(lsp::LinkedEditingRangeServerCapabilities::RegistrationOptions(_))
        ),
    );
    simple(
        "textDocument/moniker",
        matches!(
            capabilities.moniker_provider,
            Some(OneOf::Left(true)) | Some(OneOf::Right(_))
        ),
    );
    simple(
        "textDocument/inlineValue",
        matches!(
            capabilities.inline_value_provider,
            Some(OneOf::Left(true)) | Some(OneOf::Right(_))
        ),
    );
    simple(
        "textDocument/signatureHelp",
        capabilities.signature_help_provider.is_some(),
    );
    simple(
        "textDocument/formatting",
        one_of(&capabilities.document_formatting_provider),
    );
    simple(
        "textDocument/rangeFormatting",
        one_of(&capabilities.document_range_formatting_provider),
    );
    simple(
        "textDocument/onTypeFormatting",
        capabilities.document_on_type_formatting_provider.is_some(),
    );
    simple("textDocument/rename", one_of(&capabilities.rename_provider));

    if let Some(provider) = &capabilities.completion_provider {
        out.push(FeatureRegistration::new(
            "textDocument/completion",
            RegistrationOptions::Completion(provider.clone()),
        ));
    }

    match &capabilities.code_action_provider {
        Some(lsp::CodeActionProviderCapability::Simple(true)) => {
            out.push(FeatureRegistration::new(
                "textDocument/codeAction",
                RegistrationOptions::None,
            ));
        }
        Some(lsp::CodeActionProviderCapability::Options(options)) => {
            out.push(FeatureRegistration::new(
                "textDocument/codeAction",
                RegistrationOptions::CodeAction(options.clone()),
            ));
        }
        _ => {}
    }

    if let Some(provider) = &capabilities.code_lens_provider {
        out.push(FeatureRegistration::new(
            "textDocument/codeLens",
            RegistrationOptions::CodeLens(provider.clone()),
        ));
    }

    if let Some(provider) = &capabilities.document_link_provider {
        out.push(FeatureRegistration::new(
            "textDocument/documentLink",
            RegistrationOptions::DocumentLink(provider.clone()),
        ));
    }

    match &capabilities.semantic_tokens_provider {
        Some(lsp::SemanticTokensServerCapabilities::SemanticTokensOptions(options)) => {
            out.push(FeatureRegistration::new(
                "textDocument/semanticTokens",
                RegistrationOptions::SemanticTokens(options.clone()),
            ));
        }
        Some(lsp::SemanticTokensServerCapabilities::SemanticTokensRegistrationOptions(
            registration,
        )) => {
            out.push(FeatureRegistration {
                id: registration.static_registration_options.id.clone(),
                method: "textDocument/semanticTokens".to_owned(),
                document_selector: registration
                    .text_document_registration_options
                    .document_selector
                    .clone(),
                options: RegistrationOptions::SemanticTokens(
                    registration.semantic_tokens_options.clone(),
                ),
            });
        }
        None => {}
    }

    match &capabilities.inlay_hint_provider {
        Some(OneOf::Left(true)) => {
            out.push(FeatureRegistration::new(
                "textDocument/inlayHint",
                RegistrationOptions::None,
            ));
        }
        Some(OneOf::Right(lsp::InlayHintServerCapabilities::Options(options))) => {
            out.push(FeatureRegistration::new(
                "textDocument/inlayHint",
                RegistrationOptions::InlayHint(options.clone()),
            ));
        }
        Some(OneOf::Right(lsp::InlayHintServerCapabilities::RegistrationOptions(registration))) => {
            out.push(FeatureRegistration {
                id: registration.static_registration_options.id.clone(),
                method: "textDocument/inlayHint".to_owned(),
                document_selector: registration
                    .text_document_registration_options
                    .document_selector
                    .clone(),
                options: RegistrationOptions::InlayHint(registration.inlay_hint_options.clone()),
            });
        }
        _ => {}
    }

    match &capabilities.diagnostic_provider {
        Some(lsp::DiagnosticServerCapabilities::Options(options)) => {
            out.push(FeatureRegistration::new(
                "textDocument/diagnostic",
                RegistrationOptions::Diagnostic(options.clone()),
            ));
        }
        Some(lsp::DiagnosticServerCapabilities::RegistrationOptions(registration)) => {
            out.push(FeatureRegistration {
                id: registration.static_registration_options.id.clone(),
                method: "textDocument/diagnostic".to_owned(),
                document_selector: registration
                    .text_document_registration_options
                    .document_selector
                    .clone(),
                options: RegistrationOptions::Diagnostic(registration.diagnostic_options.clone()),
            });
        }
        None => {}
    }

    match &capabilities.workspace_symbol_provider {
        Some(OneOf::Left(true)) => {
            out.push(FeatureRegistration::new(
                "workspace/symbol",
                RegistrationOptions::None,
            ));
        }
        Some(OneOf::Right(options)) => {
            out.push(FeatureRegistration::new(
                "workspace/symbol",
                RegistrationOptions::WorkspaceSymbol(options.clone()),
            ));
        }
        _ => {}
    }

    if let Some(provider) = &capabilities.execute_command_provider {
        out.push(FeatureRegistration::new(
            "workspace/executeCommand",
            RegistrationOptions::ExecuteCommand(provider.clone()),
        ));
    }

    if let Some(workspace) = &capabilities.workspace {
        if let Some(folders) = &workspace.workspace_folders {
            if let Some(OneOf::Right(id)) = &folders.change_notifications {
                out.push(FeatureRegistration {
                    id: Some(id.clone()),
                    method: "workspace/didChangeWorkspaceFolders".to_owned(),
                    document_selector: None,
                    options: RegistrationOptions::None,
                });
            }
        }
        if let Some(file_operations) = &workspace.file_operations {
            let mut file_op = |method: &str, options: &Option<lsp::FileOperationRegistrationOptions>| {
                if let Some(options) = options {
                    out.push(FeatureRegistration::new(
                        method,
                        RegistrationOptions::FileOperations(options.clone()),
                    ));
                }
            };
            file_op("workspace/willCreateFiles", &file_operations.will_create);
            file_op("workspace/didCreateFiles", &file_operations.did_create);
            file_op("workspace/willRenameFiles", &file_operations.will_rename);
            file_op("workspace/didRenameFiles", &file_operations.did_rename);
            file_op("workspace/willDeleteFiles", &file_operations.will_delete);
            file_op("workspace/didDeleteFiles", &file_operations.did_delete);
        }
    }

    out
}

/// Turn a dynamic registration into a [`FeatureRegistration`] by decoding
/// its options per method. The options value is decoded piecewise, so
/// methods this registry has no specific model for still keep their
/// document selector and raw options.
fn registration_from_dynamic(registration: &lsp::Registration) -> FeatureRegistration {
    let value = registration
        .register_options
        .clone()
        .unwrap_or(Value::Null);

    let document_selector = value
        .get("documentSelector")
        .and_then(|selector| serde_json::from_value(selector.clone()).ok());
    // StaticRegistrationOptions may carry their own id; it wins over the
    // envelope id.
    let id = value
        .get("id")
        .and_then(Value::as_str)
        .map(str::to_owned)
        .or_else(|| Some(registration.id.clone()));

    fn decode<T: serde::de::DeserializeOwned>(value: &Value) -> Option<T> {
        serde_json::from_value(value.clone()).ok()
    }

    let options = match registration.method.as_str() {
        "textDocument/didChange" => decode::<lsp::TextDocumentChangeRegistrationOptions>(&value)
            .map(|options| {
                // the registration options carry the sync kind as a bare i32
                let change = match options.sync_kind {
                    0 => lsp::TextDocumentSyncKind::NONE,
                    2 => lsp::TextDocumentSyncKind::INCREMENTAL,
                    _ => lsp::TextDocumentSyncKind::FULL,
                };
                RegistrationOptions::TextDocumentSync(lsp::TextDocumentSyncOptions {
                    change: Some(change),
                    ..Default::default()
                })
            }),
        "textDocument/didSave" => decode::<lsp::TextDocumentSaveRegistrationOptions>(&value)
            .map(|options| {
                RegistrationOptions::Save(lsp::SaveOptions {
                    include_text: options.include_text,
                })
            }),
        "textDocument/semanticTokens" => {
            decode::<lsp::SemanticTokensOptions>(&value).map(RegistrationOptions::SemanticTokens)
        }
        "textDocument/codeAction" => {
            decode::<lsp::CodeActionOptions>(&value).map(RegistrationOptions::CodeAction)
        }
        "textDocument/completion" => {
            decode::<lsp::CompletionOptions>(&value).map(RegistrationOptions::Completion)
        }
        "textDocument/inlayHint" => {
            decode::<lsp::InlayHintOptions>(&value).map(RegistrationOptions::InlayHint)
        }
        "textDocument/diagnostic" => {
            decode::<lsp::DiagnosticOptions>(&value).map(RegistrationOptions::Diagnostic)
        }
        "textDocument/codeLens" => {
            decode::<lsp::CodeLensOptions>(&value).map(RegistrationOptions::CodeLens)
        }
        "textDocument/documentLink" => {
            decode::<lsp::DocumentLinkOptions>(&value).map(RegistrationOptions::DocumentLink)
        }
        "workspace/symbol" => {
            decode::<lsp::WorkspaceSymbolOptions>(&value).map(RegistrationOptions::WorkspaceSymbol)
        }
        "workspace/executeCommand" => {
            decode::<lsp::ExecuteCommandOptions>(&value).map(RegistrationOptions::ExecuteCommand)
        }
        "workspace/willCreateFiles"
        | "workspace/didCreateFiles"
        | "workspace/willRenameFiles"
        | "workspace/didRenameFiles"
        | "workspace/willDeleteFiles"
        | "workspace/didDeleteFiles" => decode::<lsp::FileOperationRegistrationOptions>(&value)
            .map(RegistrationOptions::FileOperations),
        _ => None,
    };
    let options = options.unwrap_or(match &value {
        Value::Null => RegistrationOptions::None,
        other => RegistrationOptions::Other(other.clone()),
    });

    FeatureRegistration {
        id,
        method: registration.method.clone(),
        document_selector,
        options,
    }
}

struct FeatureWaiter {
    method: String,
    query: FeatureQuery,
    tx: oneshot::Sender<()>,
}

/// The registry itself. Owned by a [`crate::Client`] behind a mutex; every
/// update re-evaluates suspended `require_feature` callers.
#[derive(Default)]
pub(crate) struct FeatureRegistry {
    registrations: HashMap<String, Vec<FeatureRegistration>>,
    waiters: Vec<FeatureWaiter>,
}

impl FeatureRegistry {
    pub fn set_server_capabilities(&mut self, capabilities: &lsp::ServerCapabilities) {
        self.registrations.clear();
        for registration in registrations_from_server_capabilities(capabilities) {
            self.registrations
                .entry(registration.method.clone())
                .or_default()
                .push(registration);
        }
        self.wake_waiters();
    }

    pub fn clear(&mut self) {
        self.registrations.clear();
    }

    pub fn register(&mut self, registration: &lsp::Registration) {
        let registration = registration_from_dynamic(registration);
        info!(
            "added dynamic registration for {} with id {:?}",
            registration.method, registration.id
        );
        self.registrations
            .entry(registration.method.clone())
            .or_default()
            .push(registration);
        self.wake_waiters();
    }

    pub fn unregister(&mut self, method: &str, id: &str) {
        let registrations = self.registrations.entry(method.to_owned()).or_default();
        let Some(index) = registrations
            .iter()
            .position(|registration| registration.id.as_deref() == Some(id))
        else {
            warn!("dynamic registration {id} for {method} not found, nothing unregistered");
            return;
        };
        registrations.remove(index);
        info!("removed dynamic registration {id} for {method}");
    }

    pub fn check(&self, method: &str, query: &FeatureQuery) -> bool {
        self.registrations
            .get(method)
            .is_some_and(|registrations| {
                registrations
                    .iter()
                    .any(|registration| query.matches(registration))
            })
    }

    /// Park a caller until a matching registration appears. The returned
    /// receiver resolves once `check` would succeed.
    pub fn add_waiter(&mut self, method: &str, query: FeatureQuery) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        self.waiters.push(FeatureWaiter {
            method: method.to_owned(),
            query,
            tx,
        });
        rx
    }

    fn wake_waiters(&mut self) {
        let mut remaining = Vec::new();
        for waiter in self.waiters.drain(..) {
            if waiter.tx.is_closed() {
                continue;
            }
            if self.registrations.get(&waiter.method).is_some_and(|regs| {
                regs.iter().any(|registration| waiter.query.matches(registration))
            }) {
                let _ = waiter.tx.send(());
            } else {
                remaining.push(waiter);
            }
        }
        self.waiters = remaining;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sync_capabilities() -> lsp::ServerCapabilities {
        lsp::ServerCapabilities {
            text_document_sync: Some(lsp::TextDocumentSyncCapability::Options(
                lsp::TextDocumentSyncOptions {
                    open_close: Some(true),
                    change: Some(lsp::TextDocumentSyncKind::INCREMENTAL),
                    will_save: Some(true),
                    will_save_wait_until: Some(true),
                    save: Some(lsp::TextDocumentSyncSaveOptions::SaveOptions(
                        lsp::SaveOptions {
                            include_text: Some(true),
                        },
                    )),
                },
            )),
            ..Default::default()
        }
    }

    #[test]
    fn sync_options_expand_into_the_whole_family() {
        let mut registry = FeatureRegistry::default();
        registry.set_server_capabilities(&sync_capabilities());

        for method in [
            "textDocument/didOpen",
            "textDocument/didClose",
            "textDocument/didChange",
            "textDocument/didSave",
            "textDocument/willSave",
            "textDocument/willSaveWaitUntil",
        ] {
            assert!(registry.check(method, &FeatureQuery::new()), "{method}");
        }

        assert!(registry.check(
            "textDocument/didChange",
            &FeatureQuery::new().sync_kind(lsp::TextDocumentSyncKind::INCREMENTAL)
        ));
        assert!(!registry.check(
            "textDocument/didChange",
            &FeatureQuery::new().sync_kind(lsp::TextDocumentSyncKind::FULL)
        ));
        assert!(registry.check(
            "textDocument/didSave",
            &FeatureQuery::new().include_text(true)
        ));
        assert!(!registry.check(
            "textDocument/didSave",
            &FeatureQuery::new().include_text(false)
        ));
    }

    #[test]
    fn bare_sync_kind_expands_like_the_reference_client() {
        let mut registry = FeatureRegistry::default();
        registry.set_server_capabilities(&lsp::ServerCapabilities {
            text_document_sync: Some(lsp::TextDocumentSyncCapability::Kind(
                lsp::TextDocumentSyncKind::FULL,
            )),
            ..Default::default()
        });

        assert!(registry.check("textDocument/didOpen", &FeatureQuery::new()));
        assert!(registry.check(
            "textDocument/didChange",
            &FeatureQuery::new().sync_kind(lsp::TextDocumentSyncKind::FULL)
        ));
        assert!(registry.check(
            "textDocument/didSave",
            &FeatureQuery::new().include_text(false)
        ));
        assert!(!registry.check("textDocument/willSave", &FeatureQuery::new()));
    }

    fn semantic_tokens_registration(id: &str, delta: bool) -> lsp::Registration {
        lsp::Registration {
            id: id.to_owned(),
            method: "textDocument/semanticTokens".to_owned(),
            register_options: Some(serde_json::json!({
                "documentSelector": [{ "language": "rust" }],
                "legend": { "tokenTypes": [], "tokenModifiers": [] },
                "full": { "delta": delta },
            })),
        }
    }

    #[test]
    fn dynamic_registration_round_trip() {
        let mut registry = FeatureRegistry::default();
        registry.set_server_capabilities(&lsp::ServerCapabilities::default());

        let query = FeatureQuery::new().semantic_tokens([SemanticTokensVariant::Full]);
        assert!(!registry.check("textDocument/semanticTokens", &query));

        registry.register(&semantic_tokens_registration("st-1", true));
        assert!(registry.check("textDocument/semanticTokens", &query));
        assert!(registry.check(
            "textDocument/semanticTokens",
            &FeatureQuery::new().semantic_tokens([SemanticTokensVariant::FullDelta])
        ));

        registry.unregister("textDocument/semanticTokens", "st-1");
        assert!(!registry.check("textDocument/semanticTokens", &query));
    }

    #[test]
    fn selector_scopes_the_registration() {
        let mut registry = FeatureRegistry::default();
        registry.register(&semantic_tokens_registration("st-1", false));

        let rust_doc = TextDocumentInfo {
            uri: lsp::Url::parse("file:///ws/main.rs").unwrap(),
            language_id: "rust".to_owned(),
        };
        let python_doc = TextDocumentInfo {
            uri: lsp::Url::parse("file:///ws/main.py").unwrap(),
            language_id: "python".to_owned(),
        };

        assert!(registry.check(
            "textDocument/semanticTokens",
            &FeatureQuery::new().text_document(rust_doc)
        ));
        assert!(!registry.check(
            "textDocument/semanticTokens",
            &FeatureQuery::new().text_document(python_doc)
        ));
    }

    #[test]
    fn registrations_without_id_are_not_removable() {
        let mut registry = FeatureRegistry::default();
        registry.set_server_capabilities(&sync_capabilities());

        registry.unregister("textDocument/didChange", "nope");
        assert!(registry.check("textDocument/didChange", &FeatureQuery::new()));
    }

    #[tokio::test]
    async fn waiters_resolve_on_registration() {
        let mut registry = FeatureRegistry::default();
        let query = FeatureQuery::new().semantic_tokens([SemanticTokensVariant::Full]);

        let rx = registry.add_waiter("textDocument/semanticTokens", query.clone());
        registry.register(&semantic_tokens_registration("st-1", true));
        rx.await.expect("waiter should have been woken");

        assert!(registry.check("textDocument/semanticTokens", &query));
    }

    #[test]
    fn workspace_commands_predicate() {
        let mut registry = FeatureRegistry::default();
        registry.set_server_capabilities(&lsp::ServerCapabilities {
            execute_command_provider: Some(lsp::ExecuteCommandOptions {
                commands: vec!["fix.all".to_owned(), "organize.imports".to_owned()],
                ..Default::default()
            }),
            ..Default::default()
        });

        assert!(registry.check(
            "workspace/executeCommand",
            &FeatureQuery::new().workspace_commands(["fix.all".to_owned()])
        ));
        assert!(!registry.check(
            "workspace/executeCommand",
            &FeatureQuery::new().workspace_commands(["does.not.exist".to_owned()])
        ));
    }
}
