//! The per-server client: lifecycle state machine, typed request and
//! notification surface, and dispatch of server-initiated traffic.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, error, info, warn};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite, BufReader};
use tokio::process::Child;
use tokio::sync::{mpsc::channel, watch};

use crate::capabilities::{FeatureQuery, FeatureRegistry};
use crate::connection::LaunchParams;
use crate::jsonrpc;
use crate::lsp;
use crate::transport::{Payload, ServerReader, ServerStderr, ServerWriter, Transport};
use crate::{Error, OffsetEncoding, Result};

const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const EXIT_TIMEOUT: Duration = Duration::from_secs(10);
const REQUEST_ID_PREFIX: &str = "scribe::";

/// The connection lifecycle.
///
/// ```text
/// disconnected ─launch→ uninitialized ─initialize→ initializing
///     ↑                                                 │initialized
///     └──── exit ←── shutdown ←──shutdown(req)─── running
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClientState {
    Disconnected,
    Uninitialized,
    Initializing,
    Running,
    ShutDown,
}

impl std::fmt::Display for ClientState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            ClientState::Disconnected => "disconnected",
            ClientState::Uninitialized => "uninitialized",
            ClientState::Initializing => "initializing",
            ClientState::Running => "running",
            ClientState::ShutDown => "shutdown",
        })
    }
}

/// Fulfills requests a server sends back at its client. A
/// [`crate::Workspace`] installs itself as the handler of every client
/// registered with it; hosts without a workspace may install their own.
pub trait WorkspaceRequestHandler: Send + Sync {
    fn on_workspace_folders(&self) -> Vec<lsp::WorkspaceFolder>;
    fn on_configuration(&self, params: lsp::ConfigurationParams) -> Vec<Value>;
    fn on_apply_edit(&self, params: lsp::ApplyWorkspaceEditParams) -> lsp::ApplyWorkspaceEditResponse;
    fn on_semantic_tokens_refresh(&self) {}
    fn on_inline_value_refresh(&self) {}
    fn on_inlay_hint_refresh(&self) {}
    fn on_diagnostic_refresh(&self) {}
    fn on_code_lens_refresh(&self) {}
    fn on_publish_diagnostics(&self, params: lsp::PublishDiagnosticsParams) {
        let _ = params;
    }
}

fn all_symbol_kinds() -> Vec<lsp::SymbolKind> {
    vec![
        lsp::SymbolKind::FILE,
        lsp::SymbolKind::MODULE,
        lsp::SymbolKind::NAMESPACE,
        lsp::SymbolKind::PACKAGE,
        lsp::SymbolKind::CLASS,
        lsp::SymbolKind::METHOD,
        lsp::SymbolKind::PROPERTY,
        lsp::SymbolKind::FIELD,
        lsp::SymbolKind::CONSTRUCTOR,
        lsp::SymbolKind::ENUM,
        lsp::SymbolKind::INTERFACE,
        lsp::SymbolKind::FUNCTION,
        lsp::SymbolKind::VARIABLE,
        lsp::SymbolKind::CONSTANT,
        lsp::SymbolKind::STRING,
        lsp::SymbolKind::NUMBER,
        lsp::SymbolKind::BOOLEAN,
        lsp::SymbolKind::ARRAY,
        lsp::SymbolKind::OBJECT,
        lsp::SymbolKind::KEY,
        lsp::SymbolKind::NULL,
        lsp::SymbolKind::ENUM_MEMBER,
        lsp::SymbolKind::STRUCT,
        lsp::SymbolKind::EVENT,
        lsp::SymbolKind::OPERATOR,
        lsp::SymbolKind::TYPE_PARAMETER,
    ]
}

fn goto_capability() -> lsp::GotoCapability {
    lsp::GotoCapability {
        dynamic_registration: Some(false),
        link_support: Some(true),
    }
}

/// The baseline capabilities advertised when the host does not supply its
/// own `InitializeParams`.
pub fn default_client_capabilities() -> lsp::ClientCapabilities {
    lsp::ClientCapabilities {
        general: Some(lsp::GeneralClientCapabilities {
            position_encodings: Some(vec![
                lsp::PositionEncodingKind::UTF32,
                lsp::PositionEncodingKind::UTF8,
                lsp::PositionEncodingKind::UTF16,
            ]),
            ..Default::default()
        }),
        workspace: Some(lsp::WorkspaceClientCapabilities {
            workspace_folders: Some(true),
            configuration: Some(true),
            apply_edit: Some(true),
            workspace_edit: Some(lsp::WorkspaceEditClientCapabilities {
                document_changes: Some(true),
                resource_operations: Some(vec![
                    lsp::ResourceOperationKind::Create,
                    lsp::ResourceOperationKind::Rename,
                    lsp::ResourceOperationKind::Delete,
                ]),
                failure_handling: Some(lsp::FailureHandlingKind::Abort),
                ..Default::default()
            }),
            file_operations: Some(lsp::WorkspaceFileOperationsClientCapabilities {
                will_create: Some(true),
                did_create: Some(true),
                will_rename: Some(true),
                did_rename: Some(true),
                will_delete: Some(true),
                did_delete: Some(true),
                ..Default::default()
            }),
            symbol: Some(lsp::WorkspaceSymbolClientCapabilities {
                symbol_kind: Some(lsp::SymbolKindCapability {
                    value_set: Some(all_symbol_kinds()),
                }),
                tag_support: Some(lsp::TagSupport {
                    value_set: vec![lsp::SymbolTag::DEPRECATED],
                }),
                resolve_support: Some(lsp::WorkspaceSymbolResolveSupportCapability {
                    properties: vec![
                        "location.range".to_owned(),
                        "containerName".to_owned(),
                        "tags".to_owned(),
                    ],
                }),
                ..Default::default()
            }),
            ..Default::default()
        }),
        text_document: Some(lsp::TextDocumentClientCapabilities {
            references: Some(lsp::ReferenceClientCapabilities {
                dynamic_registration: Some(false),
            }),
            declaration: Some(goto_capability()),
            definition: Some(goto_capability()),
            type_definition: Some(goto_capability()),
            implementation: Some(goto_capability()),
            document_symbol: Some(lsp::DocumentSymbolClientCapabilities {
                symbol_kind: Some(lsp::SymbolKindCapability {
                    value_set: Some(all_symbol_kinds()),
                }),
                tag_support: Some(lsp::TagSupport {
                    value_set: vec![lsp::SymbolTag::DEPRECATED],
                }),
                hierarchical_document_symbol_support: Some(true),
                ..Default::default()
            }),
            semantic_tokens: Some(lsp::SemanticTokensClientCapabilities {
                requests: lsp::SemanticTokensClientCapabilitiesRequests {
                    range: None,
                    full: Some(lsp::SemanticTokensFullOptions::Delta { delta: Some(true) }),
                },
                token_types: vec![
                    lsp::SemanticTokenType::NAMESPACE,
                    lsp::SemanticTokenType::TYPE,
                    lsp::SemanticTokenType::CLASS,
                    lsp::SemanticTokenType::ENUM,
                    lsp::SemanticTokenType::INTERFACE,
                    lsp::SemanticTokenType::STRUCT,
                    lsp::SemanticTokenType::TYPE_PARAMETER,
                    lsp::SemanticTokenType::PARAMETER,
                    lsp::SemanticTokenType::VARIABLE,
                    lsp::SemanticTokenType::PROPERTY,
                    lsp::SemanticTokenType::ENUM_MEMBER,
                    lsp::SemanticTokenType::EVENT,
                    lsp::SemanticTokenType::FUNCTION,
                    lsp::SemanticTokenType::METHOD,
                    lsp::SemanticTokenType::MACRO,
                    lsp::SemanticTokenType::KEYWORD,
                    lsp::SemanticTokenType::MODIFIER,
                    lsp::SemanticTokenType::COMMENT,
                    lsp::SemanticTokenType::STRING,
                    lsp::SemanticTokenType::NUMBER,
                    lsp::SemanticTokenType::REGEXP,
                    lsp::SemanticTokenType::OPERATOR,
                    lsp::SemanticTokenType::DECORATOR,
                ],
                token_modifiers: vec![
                    lsp::SemanticTokenModifier::DECLARATION,
                    lsp::SemanticTokenModifier::DEFINITION,
                    lsp::SemanticTokenModifier::READONLY,
                    lsp::SemanticTokenModifier::STATIC,
                    lsp::SemanticTokenModifier::DEPRECATED,
                    lsp::SemanticTokenModifier::ABSTRACT,
                    lsp::SemanticTokenModifier::ASYNC,
                    lsp::SemanticTokenModifier::MODIFICATION,
                    lsp::SemanticTokenModifier::DOCUMENTATION,
                    lsp::SemanticTokenModifier::DEFAULT_LIBRARY,
                ],
                formats: vec![lsp::TokenFormat::RELATIVE],
                ..Default::default()
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// `InitializeParams` used when the host does not supply its own: current
/// process id, this library as the client info, and the baseline
/// capabilities.
pub fn default_initialize_params() -> lsp::InitializeParams {
    #[allow(deprecated)]
    lsp::InitializeParams {
        process_id: Some(std::process::id()),
        client_info: Some(lsp::ClientInfo {
            name: String::from("scribe-lsp"),
            version: Some(String::from(env!("CARGO_PKG_VERSION"))),
        }),
        capabilities: default_client_capabilities(),
        ..Default::default()
    }
}

type StateCallback = Arc<dyn Fn() + Send + Sync>;

pub struct Client {
    name: String,
    launch_params: Option<LaunchParams>,
    initialize_params: Mutex<lsp::InitializeParams>,
    state: Mutex<ClientState>,
    state_callbacks: Mutex<Vec<(ClientState, StateCallback)>>,
    server_tx: Mutex<Option<tokio::sync::mpsc::UnboundedSender<Payload>>>,
    connected: Mutex<Option<watch::Receiver<bool>>>,
    request_counter: AtomicU64,
    registry: Mutex<FeatureRegistry>,
    server_capabilities: Mutex<Option<lsp::ServerCapabilities>>,
    server_info: Mutex<Option<lsp::ServerInfo>>,
    handler: Mutex<Option<Arc<dyn WorkspaceRequestHandler>>>,
    request_timeout: Mutex<Duration>,
    process: Mutex<Option<Child>>,
    exit_sent: AtomicBool,
}

impl Client {
    /// Create a client that will spawn and connect to a server per
    /// `launch_params` once [`Client::launch`] (or [`Client::start`]) is
    /// called.
    pub fn new(
        launch_params: LaunchParams,
        initialize_params: Option<lsp::InitializeParams>,
    ) -> Arc<Client> {
        let name = launch_params
            .command
            .as_deref()
            .or(launch_params.launch_command.as_deref())
            .unwrap_or("server")
            .to_owned();
        Arc::new(Self::construct(Some(launch_params), initialize_params, name))
    }

    /// Attach to an externally managed connection. The returned client is
    /// already `uninitialized`; it cannot be relaunched after it
    /// disconnects.
    pub fn attached(
        reader: impl AsyncRead + Send + Unpin + 'static,
        writer: impl AsyncWrite + Send + Unpin + 'static,
        initialize_params: Option<lsp::InitializeParams>,
    ) -> Arc<Client> {
        let client = Arc::new(Self::construct(
            None,
            initialize_params,
            "attached".to_owned(),
        ));
        client.wire(Box::new(BufReader::new(reader)), Box::new(writer), None);
        client.set_state(ClientState::Uninitialized);
        client
    }

    fn construct(
        launch_params: Option<LaunchParams>,
        initialize_params: Option<lsp::InitializeParams>,
        name: String,
    ) -> Client {
        Client {
            name,
            launch_params,
            initialize_params: Mutex::new(initialize_params.unwrap_or_else(default_initialize_params)),
            state: Mutex::new(ClientState::Disconnected),
            state_callbacks: Mutex::new(Vec::new()),
            server_tx: Mutex::new(None),
            connected: Mutex::new(None),
            request_counter: AtomicU64::new(0),
            registry: Mutex::new(FeatureRegistry::default()),
            server_capabilities: Mutex::new(None),
            server_info: Mutex::new(None),
            handler: Mutex::new(None),
            request_timeout: Mutex::new(DEFAULT_REQUEST_TIMEOUT),
            process: Mutex::new(None),
            exit_sent: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> ClientState {
        *self.state.lock()
    }

    pub fn server_info(&self) -> Option<lsp::ServerInfo> {
        self.server_info.lock().clone()
    }

    pub fn capabilities(&self) -> Option<lsp::ServerCapabilities> {
        self.server_capabilities.lock().clone()
    }

    pub fn is_initialized(&self) -> bool {
        self.server_capabilities.lock().is_some()
    }

    /// The default timeout applied by [`Client::request`].
    pub fn set_request_timeout(&self, timeout: Duration) {
        *self.request_timeout.lock() = timeout;
    }

    pub fn set_workspace_request_handler(
        &self,
        handler: Option<Arc<dyn WorkspaceRequestHandler>>,
    ) {
        *self.handler.lock() = handler;
    }

    /// Run `callback` every time the client enters `state`.
    pub fn register_state_callback(
        &self,
        state: ClientState,
        callback: impl Fn() + Send + Sync + 'static,
    ) {
        self.state_callbacks
            .lock()
            .push((state, Arc::new(callback)));
    }

    pub(crate) fn set_workspace_folders(&self, folders: Vec<lsp::WorkspaceFolder>) {
        self.initialize_params.lock().workspace_folders = Some(folders);
    }

    fn set_state(&self, state: ClientState) {
        {
            let mut current = self.state.lock();
            if *current == state {
                return;
            }
            *current = state;
        }
        info!("[{}] client is now in state {state}", self.name);
        let callbacks: Vec<StateCallback> = self
            .state_callbacks
            .lock()
            .iter()
            .filter(|(s, _)| *s == state)
            .map(|(_, callback)| Arc::clone(callback))
            .collect();
        for callback in callbacks {
            callback();
        }
    }

    // ---------------------------------------------------------------------
    // Capability queries
    // ---------------------------------------------------------------------

    /// Whether the server currently provides the feature registered under
    /// `method`, subject to the query's predicates.
    pub fn check_feature(&self, method: &str, query: &FeatureQuery) -> bool {
        self.registry.lock().check(method, query)
    }

    /// Wait until [`Client::check_feature`] would return `true` for the
    /// query. Resolves immediately when the feature is already available,
    /// otherwise suspends until a matching (dynamic) registration arrives
    /// or `timeout` expires.
    pub async fn require_feature(
        &self,
        method: &str,
        query: FeatureQuery,
        timeout: Option<Duration>,
    ) -> Result<()> {
        let receiver = {
            let mut registry = self.registry.lock();
            if registry.check(method, &query) {
                return Ok(());
            }
            registry.add_waiter(method, query)
        };
        let timeout = timeout.unwrap_or_else(|| *self.request_timeout.lock());
        match tokio::time::timeout(timeout, receiver).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(_)) => Err(Error::ServerStopped),
            Err(_) => Err(Error::FeatureUnsupported(format!(
                "{method} (no matching registration within {timeout:?})"
            ))),
        }
    }

    /// The position encoding negotiated with the server. Defaults to UTF-16
    /// when the server does not state one.
    pub fn offset_encoding(&self) -> OffsetEncoding {
        self.server_capabilities
            .lock()
            .as_ref()
            .and_then(|capabilities| capabilities.position_encoding.as_ref())
            .and_then(|encoding| match encoding.as_str() {
                "utf-8" => Some(OffsetEncoding::Utf8),
                "utf-16" => Some(OffsetEncoding::Utf16),
                "utf-32" => Some(OffsetEncoding::Utf32),
                other => {
                    error!(
                        "[{}] server provided invalid position encoding {other}, \
                         defaulting to utf-16",
                        self.name
                    );
                    None
                }
            })
            .unwrap_or_default()
    }

    // ---------------------------------------------------------------------
    // Lifecycle
    // ---------------------------------------------------------------------

    /// Launch the server process and connect to it. Valid only while
    /// `disconnected`; afterwards the client is `uninitialized`.
    pub async fn launch(self: &Arc<Self>) -> Result<()> {
        let state = self.state();
        if state != ClientState::Disconnected {
            return Err(Error::InvalidState {
                expected: "disconnected",
                actual: state,
            });
        }
        let params = self.launch_params.clone().ok_or_else(|| {
            Error::Other(anyhow::anyhow!(
                "this client is attached to an external connection and cannot be relaunched"
            ))
        })?;
        let streams = params.establish(&self.name).await?;
        *self.process.lock() = streams.process;
        self.wire(streams.reader, streams.writer, streams.stderr);
        self.set_state(ClientState::Uninitialized);
        Ok(())
    }

    fn wire(
        self: &Arc<Self>,
        reader: ServerReader,
        writer: ServerWriter,
        stderr: Option<ServerStderr>,
    ) {
        let (mut call_rx, payload_tx, connected_rx) =
            Transport::start(reader, writer, stderr, self.name.clone());
        *self.server_tx.lock() = Some(payload_tx);
        *self.connected.lock() = Some(connected_rx);
        self.exit_sent.store(false, Ordering::SeqCst);

        let client = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(call) = call_rx.recv().await {
                client.handle_call(call);
            }
            if !client.exit_sent.load(Ordering::SeqCst) {
                error!("[{}] connection to the server was lost", client.name);
            }
            client.set_state(ClientState::Disconnected);
        });
    }

    /// Send the `initialize` request using the stored `InitializeParams`.
    pub async fn initialize(&self) -> Result<lsp::InitializeResult> {
        let params = self.initialize_params.lock().clone();
        self.request::<lsp::request::Initialize>(params).await
    }

    /// Send the `initialized` notification, entering the `running` state.
    pub fn initialized(&self) -> Result<()> {
        self.notify::<lsp::notification::Initialized>(lsp::InitializedParams {})
    }

    /// Send the `shutdown` request.
    pub async fn shutdown(&self) -> Result<()> {
        self.request::<lsp::request::Shutdown>(()).await
    }

    /// Send the `exit` notification and wait (bounded) for the server to
    /// drop the connection.
    pub async fn exit(&self) -> Result<()> {
        let state = self.state();
        if state != ClientState::ShutDown {
            return Err(Error::InvalidState {
                expected: "shutdown",
                actual: state,
            });
        }
        self.exit_sent.store(true, Ordering::SeqCst);
        self.send_notification_raw::<lsp::notification::Exit>(())?;

        let connected = self.connected.lock().clone();
        if let Some(mut connected) = connected {
            match tokio::time::timeout(EXIT_TIMEOUT, connected.wait_for(|up| !*up)).await {
                Ok(_) => {}
                Err(_) => {
                    return Err(Error::Other(anyhow::anyhow!(
                        "server did not terminate after the exit notification"
                    )))
                }
            }
        }

        *self.server_capabilities.lock() = None;
        *self.server_info.lock() = None;
        self.registry.lock().clear();
        *self.server_tx.lock() = None;
        self.set_state(ClientState::Disconnected);
        Ok(())
    }

    /// Idempotently advance the client to `running`, walking through
    /// whatever launch and initialization steps are still missing.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        if self.state() == ClientState::ShutDown {
            self.exit().await?;
        }
        if self.state() == ClientState::Disconnected {
            self.launch().await?;
        }
        if self.state() == ClientState::Uninitialized {
            self.initialize().await?;
        }
        if self.state() == ClientState::Initializing {
            self.initialized()?;
        }
        debug_assert_eq!(self.state(), ClientState::Running);
        Ok(())
    }

    /// Idempotently advance the client to `disconnected`, regardless of the
    /// state it currently is in.
    pub async fn shutdown_and_exit(&self) -> Result<()> {
        if matches!(
            self.state(),
            ClientState::Uninitialized | ClientState::Initializing | ClientState::Running
        ) {
            self.shutdown().await?;
        }
        if self.state() == ClientState::ShutDown {
            self.exit().await?;
        }
        Ok(())
    }

    // ---------------------------------------------------------------------
    // Requests & notifications
    // ---------------------------------------------------------------------

    fn next_request_id(&self) -> jsonrpc::Id {
        let id = self.request_counter.fetch_add(1, Ordering::Relaxed);
        jsonrpc::Id::Str(format!("{REQUEST_ID_PREFIX}{id}"))
    }

    /// Send a request and await its result with the client's default
    /// timeout.
    ///
    /// Requests other than `initialize` and `shutdown` are valid only in
    /// the `running` state.
    pub async fn request<R: lsp::request::Request>(&self, params: R::Params) -> Result<R::Result> {
        let timeout = *self.request_timeout.lock();
        self.request_with_timeout::<R>(params, timeout).await
    }

    pub async fn request_with_timeout<R: lsp::request::Request>(
        &self,
        params: R::Params,
        timeout: Duration,
    ) -> Result<R::Result> {
        use lsp::request::Request as _;

        let state = self.state();
        let expected = match R::METHOD {
            lsp::request::Initialize::METHOD => {
                (state == ClientState::Uninitialized, "uninitialized")
            }
            lsp::request::Shutdown::METHOD => (
                matches!(
                    state,
                    ClientState::Uninitialized | ClientState::Initializing | ClientState::Running
                ),
                "running",
            ),
            _ => (state == ClientState::Running, "running"),
        };
        if !expected.0 {
            return Err(Error::InvalidState {
                expected: expected.1,
                actual: state,
            });
        }

        info!("[{}] sending request {}", self.name, R::METHOD);
        let params = serde_json::to_value(params)?;
        let value = self.call_raw(R::METHOD, params, timeout).await?;

        match R::METHOD {
            lsp::request::Initialize::METHOD => {
                let result: lsp::InitializeResult = serde_json::from_value(value.clone())?;
                self.apply_initialize_result(result);
            }
            lsp::request::Shutdown::METHOD => self.set_state(ClientState::ShutDown),
            _ => {}
        }

        serde_json::from_value(value).map_err(Into::into)
    }

    async fn call_raw(&self, method: &str, params: Value, timeout: Duration) -> Result<Value> {
        let id = self.next_request_id();
        let request = jsonrpc::Request {
            jsonrpc: Some(jsonrpc::Version::V2),
            method: method.to_owned(),
            params: jsonrpc::Params::from(params),
            id: id.clone(),
        };

        // Submitting outside the awaited future keeps requests FIFO in
        // submission order.
        let (tx, mut rx) = channel::<Result<Value>>(1);
        {
            let server_tx = self.server_tx.lock();
            let Some(server_tx) = server_tx.as_ref() else {
                return Err(Error::ServerStopped);
            };
            server_tx
                .send(Payload::Request {
                    chan: tx,
                    value: request,
                })
                .map_err(|_| Error::ServerStopped)?;
        }

        match tokio::time::timeout(timeout, rx.recv()).await {
            Err(_) => {
                info!("[{}] request {id} timed out", self.name);
                Err(Error::Timeout(id))
            }
            Ok(None) => Err(Error::ServerStopped),
            Ok(Some(result)) => result,
        }
    }

    /// Send a request for a method outside the typed protocol surface
    /// (vendor extensions, `$/…` methods). Valid only while `running`.
    pub async fn custom_request(
        &self,
        method: &str,
        params: impl serde::Serialize,
    ) -> Result<Value> {
        let state = self.state();
        if state != ClientState::Running {
            return Err(Error::InvalidState {
                expected: "running",
                actual: state,
            });
        }
        info!("[{}] sending request {method}", self.name);
        let timeout = *self.request_timeout.lock();
        self.call_raw(method, serde_json::to_value(params)?, timeout)
            .await
    }

    /// Send a notification for a method outside the typed protocol surface.
    pub fn custom_notification(
        &self,
        method: &str,
        params: impl serde::Serialize,
    ) -> Result<()> {
        let state = self.state();
        if state != ClientState::Running {
            return Err(Error::InvalidState {
                expected: "running",
                actual: state,
            });
        }
        let notification = jsonrpc::Notification {
            jsonrpc: Some(jsonrpc::Version::V2),
            method: method.to_owned(),
            params: jsonrpc::Params::from(serde_json::to_value(params)?),
        };
        let server_tx = self.server_tx.lock();
        let Some(server_tx) = server_tx.as_ref() else {
            return Err(Error::ServerStopped);
        };
        server_tx
            .send(Payload::Notification(notification))
            .map_err(|_| Error::ServerStopped)
    }

    /// Send a notification. `initialized` is valid while `initializing`,
    /// `exit` while `shutdown`; everything else requires `running`.
    pub fn notify<N: lsp::notification::Notification>(&self, params: N::Params) -> Result<()> {
        use lsp::notification::Notification as _;

        let state = self.state();
        let expected = match N::METHOD {
            lsp::notification::Initialized::METHOD => {
                (state == ClientState::Initializing, "initializing")
            }
            lsp::notification::Exit::METHOD => (state == ClientState::ShutDown, "shutdown"),
            _ => (state == ClientState::Running, "running"),
        };
        if !expected.0 {
            return Err(Error::InvalidState {
                expected: expected.1,
                actual: state,
            });
        }

        if N::METHOD == lsp::notification::Exit::METHOD {
            warn!(
                "[{}] exit sent via notify() does not wait for the server to \
                 terminate; prefer Client::exit",
                self.name
            );
            self.exit_sent.store(true, Ordering::SeqCst);
        }

        self.send_notification_raw::<N>(params)?;

        if N::METHOD == lsp::notification::Initialized::METHOD {
            self.set_state(ClientState::Running);
        }
        Ok(())
    }

    fn send_notification_raw<N: lsp::notification::Notification>(
        &self,
        params: N::Params,
    ) -> Result<()> {
        let params = serde_json::to_value(params)?;
        let notification = jsonrpc::Notification {
            jsonrpc: Some(jsonrpc::Version::V2),
            method: N::METHOD.to_owned(),
            params: jsonrpc::Params::from(params),
        };
        let server_tx = self.server_tx.lock();
        let Some(server_tx) = server_tx.as_ref() else {
            return Err(Error::ServerStopped);
        };
        server_tx
            .send(Payload::Notification(notification))
            .map_err(|_| Error::ServerStopped)
    }

    /// Reply to a server-initiated request.
    fn reply(&self, id: jsonrpc::Id, result: core::result::Result<Value, jsonrpc::Error>) {
        let output = match result {
            Ok(result) => jsonrpc::Output::success(id, result),
            Err(error) => jsonrpc::Output::failure(id, error),
        };
        let server_tx = self.server_tx.lock();
        if let Some(server_tx) = server_tx.as_ref() {
            let _ = server_tx.send(Payload::Response(output));
        }
    }

    fn apply_initialize_result(&self, result: lsp::InitializeResult) {
        if let Some(info) = &result.server_info {
            info!(
                "[{}] connected to {}{}",
                self.name,
                info.name,
                info.version
                    .as_deref()
                    .map(|version| format!(" version {version}"))
                    .unwrap_or_default()
            );
        }
        *self.server_info.lock() = result.server_info;
        self.registry
            .lock()
            .set_server_capabilities(&result.capabilities);
        *self.server_capabilities.lock() = Some(result.capabilities);
        self.set_state(ClientState::Initializing);
    }

    // ---------------------------------------------------------------------
    // Server-initiated traffic
    // ---------------------------------------------------------------------

    fn handle_call(&self, call: jsonrpc::Call) {
        match call {
            jsonrpc::Call::Request(request) => {
                let result = self.dispatch_request(&request.method, request.params);
                self.reply(request.id, result);
            }
            jsonrpc::Call::Notification(notification) => {
                self.dispatch_notification(&notification.method, notification.params);
            }
        }
    }

    fn dispatch_request(
        &self,
        method: &str,
        params: jsonrpc::Params,
    ) -> core::result::Result<Value, jsonrpc::Error> {
        let handler = self.handler.lock().clone();
        let internal =
            |err: serde_json::Error| jsonrpc::Error::new(jsonrpc::ErrorCode::InternalError, err.to_string());

        match method {
            "client/registerCapability" => {
                let params: lsp::RegistrationParams = params.parse()?;
                let mut registry = self.registry.lock();
                for registration in &params.registrations {
                    registry.register(registration);
                }
                Ok(Value::Null)
            }
            "client/unregisterCapability" => {
                let params: lsp::UnregistrationParams = params.parse()?;
                let mut registry = self.registry.lock();
                for unregistration in &params.unregisterations {
                    registry.unregister(&unregistration.method, &unregistration.id);
                }
                Ok(Value::Null)
            }
            "workspace/workspaceFolders" => {
                let folders = match handler {
                    Some(handler) => handler.on_workspace_folders(),
                    None => Vec::new(),
                };
                serde_json::to_value(folders).map_err(internal)
            }
            "workspace/configuration" => {
                let params: lsp::ConfigurationParams = params.parse()?;
                match handler {
                    Some(handler) => Ok(Value::Array(handler.on_configuration(params))),
                    None => Ok(Value::Array(Vec::new())),
                }
            }
            "workspace/applyEdit" => {
                let params: lsp::ApplyWorkspaceEditParams = params.parse()?;
                let response = match handler {
                    Some(handler) => handler.on_apply_edit(params),
                    None => lsp::ApplyWorkspaceEditResponse {
                        applied: false,
                        failure_reason: Some(
                            "client is not registered with a workspace".to_owned(),
                        ),
                        failed_change: None,
                    },
                };
                serde_json::to_value(response).map_err(internal)
            }
            "workspace/semanticTokens/refresh" => {
                if let Some(handler) = handler {
                    handler.on_semantic_tokens_refresh();
                }
                Ok(Value::Null)
            }
            "workspace/inlineValue/refresh" => {
                if let Some(handler) = handler {
                    handler.on_inline_value_refresh();
                }
                Ok(Value::Null)
            }
            "workspace/inlayHint/refresh" => {
                if let Some(handler) = handler {
                    handler.on_inlay_hint_refresh();
                }
                Ok(Value::Null)
            }
            "workspace/diagnostic/refresh" => {
                if let Some(handler) = handler {
                    handler.on_diagnostic_refresh();
                }
                Ok(Value::Null)
            }
            "workspace/codeLens/refresh" => {
                if let Some(handler) = handler {
                    handler.on_code_lens_refresh();
                }
                Ok(Value::Null)
            }
            "window/workDoneProgress/create" => Ok(Value::Null),
            "window/showDocument" => Ok(serde_json::json!({ "success": false })),
            "window/showMessageRequest" => Ok(Value::Null),
            // Optional server->client requests must not fail just because
            // this client has no use for them.
            _ => {
                debug!(
                    "[{}] unhandled server request {method}, answering with null",
                    self.name
                );
                Ok(Value::Null)
            }
        }
    }

    fn dispatch_notification(&self, method: &str, params: jsonrpc::Params) {
        match method {
            "window/showMessage" | "window/logMessage" => {
                let Ok(params) = params.parse::<lsp::LogMessageParams>() else {
                    warn!("[{}] malformed {method} notification", self.name);
                    return;
                };
                let message = format!("[{}] {method}: {}", self.name, params.message);
                if params.typ == lsp::MessageType::ERROR {
                    error!("{message}");
                } else if params.typ == lsp::MessageType::WARNING {
                    warn!("{message}");
                } else if params.typ == lsp::MessageType::INFO {
                    info!("{message}");
                } else {
                    debug!("{message}");
                }
            }
            "textDocument/publishDiagnostics" => {
                let Ok(params) = params.parse::<lsp::PublishDiagnosticsParams>() else {
                    warn!("[{}] malformed publishDiagnostics notification", self.name);
                    return;
                };
                if let Some(handler) = self.handler.lock().clone() {
                    handler.on_publish_diagnostics(params);
                }
            }
            "$/logTrace" => {
                if let Ok(params) = params.parse::<lsp::LogTraceParams>() {
                    debug!("[{}] $/logTrace: {}", self.name, params.message);
                }
            }
            "telemetry/event" | "$/cancelRequest" | "$/progress" => {}
            _ => {
                debug!("[{}] unhandled server notification {method}", self.name);
            }
        }
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("name", &self.name)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}
