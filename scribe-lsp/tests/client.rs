//! Scenario tests driving a real [`Client`] against an in-process mock
//! server speaking framed JSON-RPC over a duplex pipe.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader, DuplexStream};
use tokio::sync::mpsc;

use scribe_lsp::{
    lsp, Client, ClientState, Error, FeatureQuery, SemanticTokensVariant, Workspace,
};

const WAIT: Duration = Duration::from_secs(5);

async fn read_message(
    reader: &mut BufReader<tokio::io::ReadHalf<DuplexStream>>,
) -> Option<Value> {
    let mut content_length: Option<usize> = None;
    let mut line = String::new();
    loop {
        line.clear();
        if reader.read_line(&mut line).await.ok()? == 0 {
            return None;
        }
        let header = line.trim();
        if header.is_empty() {
            break;
        }
        if let Some(value) = header.strip_prefix("Content-Length:") {
            content_length = value.trim().parse().ok();
        }
    }
    let mut payload = vec![0; content_length?];
    reader.read_exact(&mut payload).await.ok()?;
    serde_json::from_slice(&payload).ok()
}

async fn write_message(writer: &mut tokio::io::WriteHalf<DuplexStream>, message: &Value) {
    let body = serde_json::to_string(message).unwrap();
    let frame = format!("Content-Length: {}\r\n\r\n{body}", body.len());
    writer.write_all(frame.as_bytes()).await.unwrap();
    writer.flush().await.unwrap();
}

/// A scripted language server: answers `initialize`/`shutdown`, serves
/// canned responses per method, records everything it receives, and can be
/// told to push arbitrary server-initiated messages.
#[derive(Clone)]
struct MockServer {
    outbound: mpsc::UnboundedSender<Value>,
    received: Arc<Mutex<Vec<Value>>>,
}

impl MockServer {
    fn spawn(
        io: DuplexStream,
        capabilities: Value,
        responses: HashMap<String, Value>,
        ignore: HashSet<String>,
    ) -> MockServer {
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<Value>();
        let received = Arc::new(Mutex::new(Vec::new()));
        let record = Arc::clone(&received);

        let (read_half, mut write_half) = tokio::io::split(io);
        let mut reader = BufReader::new(read_half);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    message = read_message(&mut reader) => {
                        let Some(message) = message else { break };
                        let method = message.get("method").and_then(Value::as_str);
                        let id = message.get("id").cloned();
                        let Some(method) = method else {
                            // a response to a server-initiated request
                            record.lock().unwrap().push(message);
                            continue;
                        };
                        let method = method.to_owned();
                        record.lock().unwrap().push(message);

                        match (id, method.as_str()) {
                            (Some(id), "initialize") => {
                                let result = json!({
                                    "capabilities": capabilities,
                                    "serverInfo": { "name": "mock-server", "version": "1.0" },
                                });
                                write_message(
                                    &mut write_half,
                                    &json!({ "jsonrpc": "2.0", "id": id, "result": result }),
                                )
                                .await;
                            }
                            (Some(id), method) => {
                                if ignore.contains(method) {
                                    continue;
                                }
                                let result =
                                    responses.get(method).cloned().unwrap_or(Value::Null);
                                write_message(
                                    &mut write_half,
                                    &json!({ "jsonrpc": "2.0", "id": id, "result": result }),
                                )
                                .await;
                            }
                            (None, "exit") => break,
                            (None, _) => {}
                        }
                    }
                    Some(push) = outbound_rx.recv() => {
                        write_message(&mut write_half, &push).await;
                    }
                }
            }
        });

        MockServer {
            outbound: outbound_tx,
            received,
        }
    }

    fn send(&self, message: Value) {
        self.outbound.send(message).unwrap();
    }

    fn messages(&self, method: &str) -> Vec<Value> {
        self.received
            .lock()
            .unwrap()
            .iter()
            .filter(|message| {
                message.get("method").and_then(Value::as_str) == Some(method)
            })
            .cloned()
            .collect()
    }

    /// Index of the first message with `method`, in arrival order.
    fn first_index_of(&self, method: &str) -> Option<usize> {
        self.received
            .lock()
            .unwrap()
            .iter()
            .position(|message| message.get("method").and_then(Value::as_str) == Some(method))
    }

    async fn wait_for_count(&self, method: &str, count: usize) -> Vec<Value> {
        tokio::time::timeout(WAIT, async {
            loop {
                let messages = self.messages(method);
                if messages.len() >= count {
                    return messages;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {count}x {method}"))
    }
}

struct Fixture {
    client: Arc<Client>,
    mock: MockServer,
}

fn connect(capabilities: Value) -> Fixture {
    connect_with(capabilities, HashMap::new(), HashSet::new())
}

fn connect_with(
    capabilities: Value,
    responses: HashMap<String, Value>,
    ignore: HashSet<String>,
) -> Fixture {
    let (client_io, server_io) = tokio::io::duplex(64 * 1024);
    let mock = MockServer::spawn(server_io, capabilities, responses, ignore);
    let (reader, writer) = tokio::io::split(client_io);
    let client = Client::attached(reader, writer, None);
    Fixture { client, mock }
}

fn incremental_sync_capabilities() -> Value {
    json!({
        "textDocumentSync": {
            "openClose": true,
            "change": 2,
            "save": { "includeText": false },
        }
    })
}

#[tokio::test]
async fn lifecycle_walks_every_state() {
    let Fixture { client, .. } = connect(json!({}));

    let observed = Arc::new(Mutex::new(Vec::new()));
    for state in [
        ClientState::Initializing,
        ClientState::Running,
        ClientState::ShutDown,
        ClientState::Disconnected,
    ] {
        let observed = Arc::clone(&observed);
        client.register_state_callback(state, move || observed.lock().unwrap().push(state));
    }

    assert_eq!(client.state(), ClientState::Uninitialized);

    // regular traffic is rejected before the handshake completes
    let premature = client
        .request::<lsp::request::WorkspaceSymbolRequest>(lsp::WorkspaceSymbolParams::default())
        .await;
    assert!(matches!(premature, Err(Error::InvalidState { .. })));

    let result = client.initialize().await.unwrap();
    assert_eq!(result.server_info.unwrap().name, "mock-server");
    assert_eq!(client.state(), ClientState::Initializing);

    // initialize is only valid once
    assert!(matches!(
        client.initialize().await,
        Err(Error::InvalidState { .. })
    ));

    client.initialized().unwrap();
    assert_eq!(client.state(), ClientState::Running);

    // start() from running is a no-op
    client.start().await.unwrap();
    assert_eq!(client.state(), ClientState::Running);

    client.shutdown().await.unwrap();
    assert_eq!(client.state(), ClientState::ShutDown);
    client.exit().await.unwrap();
    assert_eq!(client.state(), ClientState::Disconnected);

    // shutdown_and_exit on a disconnected client is a no-op as well
    client.shutdown_and_exit().await.unwrap();

    assert_eq!(
        observed.lock().unwrap().clone(),
        vec![
            ClientState::Initializing,
            ClientState::Running,
            ClientState::ShutDown,
            ClientState::Disconnected,
        ]
    );
}

#[tokio::test]
async fn require_feature_is_gated_on_dynamic_registration() {
    let Fixture { client, mock } = connect(json!({}));
    client.start().await.unwrap();

    let query = FeatureQuery::new().semantic_tokens([SemanticTokensVariant::Full]);
    assert!(!client.check_feature("textDocument/semanticTokens", &query));

    let waiter = {
        let client = Arc::clone(&client);
        let query = query.clone();
        tokio::spawn(async move {
            client
                .require_feature("textDocument/semanticTokens", query, Some(WAIT))
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!waiter.is_finished());

    mock.send(json!({
        "jsonrpc": "2.0",
        "id": "mock-reg-1",
        "method": "client/registerCapability",
        "params": {
            "registrations": [{
                "id": "st-1",
                "method": "textDocument/semanticTokens",
                "registerOptions": {
                    "documentSelector": [{ "language": "python" }],
                    "legend": { "tokenTypes": [], "tokenModifiers": [] },
                    "full": { "delta": true },
                },
            }],
        },
    }));

    waiter.await.unwrap().unwrap();
    assert!(client.check_feature("textDocument/semanticTokens", &query));

    mock.send(json!({
        "jsonrpc": "2.0",
        "id": "mock-reg-2",
        "method": "client/unregisterCapability",
        "params": {
            "unregisterations": [{
                "id": "st-1",
                "method": "textDocument/semanticTokens",
            }],
        },
    }));
    tokio::time::timeout(WAIT, async {
        while client.check_feature("textDocument/semanticTokens", &query) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("unregistration should disable the feature again");

    // a waiter that never gets its registration times out
    let denied = client
        .require_feature(
            "textDocument/semanticTokens",
            FeatureQuery::new().semantic_tokens([SemanticTokensVariant::Range]),
            Some(Duration::from_millis(50)),
        )
        .await;
    assert!(matches!(denied, Err(Error::FeatureUnsupported(_))));
}

#[tokio::test]
async fn commits_emit_incremental_changes_in_reverse_document_order() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("test.py"), "print(\"Hello, World!\")\n").unwrap();
    let ws = Workspace::new([dir.path().to_path_buf()]);

    let Fixture { client, mock } = connect(incremental_sync_capabilities());
    ws.register_client(&client).unwrap();
    client.start().await.unwrap();

    let doc = ws.open_text_document("test.py").unwrap();
    mock.wait_for_count("textDocument/didOpen", 1).await;

    doc.edit("Hi", 7, 12).unwrap();
    doc.edit("logging.info", 0, 5).unwrap();
    doc.commit_edits().unwrap();
    assert_eq!(doc.text().to_string(), "logging.info(\"Hi, World!\")\n");

    let did_change = mock.wait_for_count("textDocument/didChange", 1).await;
    let params = &did_change[0]["params"];
    assert_eq!(params["textDocument"]["version"], 1);

    let changes = params["contentChanges"].as_array().unwrap();
    assert_eq!(changes.len(), 2);
    // later-in-document edit first, so the earlier range stays valid
    assert_eq!(changes[0]["range"]["start"]["character"], 7);
    assert_eq!(changes[0]["text"], "Hi");
    assert_eq!(changes[1]["range"]["start"]["character"], 0);
    assert_eq!(changes[1]["text"], "logging.info");

    // didOpen was delivered before the change
    assert!(
        mock.first_index_of("textDocument/didOpen").unwrap()
            < mock.first_index_of("textDocument/didChange").unwrap()
    );
}

#[tokio::test]
async fn will_save_wait_until_edits_land_before_the_disk_write() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("test.py"), "print('Hi!')\n").unwrap();
    let ws = Workspace::new([dir.path().to_path_buf()]);

    let capabilities = json!({
        "textDocumentSync": {
            "openClose": true,
            "change": 1,
            "save": { "includeText": true },
            "willSave": true,
            "willSaveWaitUntil": true,
        }
    });
    let responses = HashMap::from([(
        "textDocument/willSaveWaitUntil".to_owned(),
        json!([
            {
                "range": {
                    "start": { "line": 0, "character": 7 },
                    "end": { "line": 0, "character": 9 },
                },
                "newText": "Bye",
            },
            {
                "range": {
                    "start": { "line": 0, "character": 0 },
                    "end": { "line": 0, "character": 0 },
                },
                "newText": "# banner\n",
            },
        ]),
    )]);
    let Fixture { client, mock } = connect_with(capabilities, responses, HashSet::new());
    ws.register_client(&client).unwrap();
    client.start().await.unwrap();

    let doc = ws.open_text_document("test.py").unwrap();
    doc.save().await.unwrap();

    mock.wait_for_count("textDocument/willSave", 1).await;
    mock.wait_for_count("textDocument/willSaveWaitUntil", 1).await;

    let on_disk = std::fs::read_to_string(dir.path().join("test.py")).unwrap();
    assert_eq!(on_disk, "# banner\nprint('Bye!')\n");
    assert_eq!(doc.version(), 1);

    // didSave carries the full text because the server asked for it
    let did_save = mock.wait_for_count("textDocument/didSave", 1).await;
    assert_eq!(did_save[0]["params"]["text"], "# banner\nprint('Bye!')\n");
}

#[tokio::test]
async fn timed_out_requests_fail_locally() {
    let ignore = HashSet::from(["workspace/symbol".to_owned()]);
    let Fixture { client, .. } = connect_with(json!({}), HashMap::new(), ignore);
    client.start().await.unwrap();

    let result = client
        .request_with_timeout::<lsp::request::WorkspaceSymbolRequest>(
            lsp::WorkspaceSymbolParams::default(),
            Duration::from_millis(100),
        )
        .await;
    assert!(matches!(result, Err(Error::Timeout(_))));

    // the client stays usable afterwards
    client.shutdown_and_exit().await.unwrap();
    assert_eq!(client.state(), ClientState::Disconnected);
}

#[tokio::test]
async fn renaming_an_open_document_switches_its_wire_identity() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("a.py"), "pass\n").unwrap();
    let ws = Workspace::new([dir.path().to_path_buf()]);

    let mut capabilities = incremental_sync_capabilities();
    capabilities["workspace"] = json!({
        "fileOperations": {
            "didRename": {
                "filters": [{ "pattern": { "glob": "**/*.py" } }],
            },
        },
    });
    let Fixture { client, mock } = connect(capabilities);
    ws.register_client(&client).unwrap();
    client.start().await.unwrap();

    let doc = ws.open_text_document("a.py").unwrap();
    ws.rename_text_document("a.py", "b.py", false, false)
        .await
        .unwrap();

    let did_rename = mock.wait_for_count("workspace/didRenameFiles", 1).await;
    let file = &did_rename[0]["params"]["files"][0];
    assert!(file["oldUri"].as_str().unwrap().ends_with("a.py"));
    assert!(file["newUri"].as_str().unwrap().ends_with("b.py"));

    doc.insert("# moved\n", 0).unwrap();
    doc.commit_edits().unwrap();

    let did_change = mock.wait_for_count("textDocument/didChange", 1).await;
    let uri = did_change[0]["params"]["textDocument"]["uri"]
        .as_str()
        .unwrap();
    assert!(uri.ends_with("b.py"));
}

#[tokio::test]
async fn custom_requests_round_trip() {
    let responses = HashMap::from([(
        "$/templateParams".to_owned(),
        json!({ "expanded": true }),
    )]);
    let Fixture { client, mock } = connect_with(json!({}), responses, HashSet::new());
    client.start().await.unwrap();

    let result = client
        .custom_request("$/templateParams", json!({ "expand": { "REPO": "file:///ws" } }))
        .await
        .unwrap();
    assert_eq!(result, json!({ "expanded": true }));

    client.custom_notification("$/ping", json!(null)).unwrap();
    mock.wait_for_count("$/ping", 1).await;
}

#[tokio::test]
async fn outlines_convert_positions_into_offsets() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("lib.py"), "class A:\n    def m(self):\n        pass\n")
        .unwrap();
    let ws = Workspace::new([dir.path().to_path_buf()]);

    let responses = HashMap::from([(
        "textDocument/documentSymbol".to_owned(),
        json!([{
            "name": "A",
            "kind": 5,
            "range": {
                "start": { "line": 0, "character": 0 },
                "end": { "line": 2, "character": 12 },
            },
            "selectionRange": {
                "start": { "line": 0, "character": 6 },
                "end": { "line": 0, "character": 7 },
            },
            "children": [{
                "name": "m",
                "kind": 6,
                "range": {
                    "start": { "line": 1, "character": 4 },
                    "end": { "line": 2, "character": 12 },
                },
                "selectionRange": {
                    "start": { "line": 1, "character": 8 },
                    "end": { "line": 1, "character": 9 },
                },
            }],
        }]),
    )]);
    let capabilities = json!({ "documentSymbolProvider": true });
    let Fixture { client, .. } = connect_with(capabilities, responses, HashSet::new());
    ws.register_client(&client).unwrap();
    client.start().await.unwrap();

    let doc = ws.open_text_document("lib.py").unwrap();
    let outline = doc.outline(&client).await.unwrap();

    assert_eq!(outline.len(), 1);
    assert_eq!(outline[0].name, "A");
    assert_eq!(outline[0].kind, lsp::SymbolKind::CLASS);
    assert_eq!(outline[0].selection_range, (6, 7));
    assert_eq!(outline[0].children.len(), 1);
    let method = &outline[0].children[0];
    assert_eq!(method.name, "m");
    // line 1 starts at char offset 9 ("class A:\n")
    assert_eq!(method.selection_range, (17, 18));
}

#[tokio::test]
async fn workspace_symbols_resolve_into_open_documents() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("lib.py"), "def shave():\n    pass\n").unwrap();
    let ws = Workspace::new([dir.path().to_path_buf()]);

    let uri = lsp::Url::from_file_path(
        scribe_stdx::path::canonicalize(dir.path().join("lib.py")),
    )
    .unwrap();
    let responses = HashMap::from([(
        "workspace/symbol".to_owned(),
        json!([{
            "name": "shave",
            "kind": 12,
            "location": {
                "uri": uri,
                "range": {
                    "start": { "line": 0, "character": 4 },
                    "end": { "line": 0, "character": 9 },
                },
            },
        }]),
    )]);
    let capabilities = json!({ "workspaceSymbolProvider": { "resolveProvider": false } });
    let Fixture { client, .. } = connect_with(capabilities, responses, HashSet::new());
    ws.register_client(&client).unwrap();
    client.start().await.unwrap();

    let symbols = ws.query_symbols_resolved("shave", None).await.unwrap();
    assert_eq!(symbols.len(), 1);
    let symbol = &symbols[0];
    assert_eq!(symbol.name(), "shave");
    assert_eq!(symbol.kind(), lsp::SymbolKind::FUNCTION);
    assert_eq!(symbol.range(), (4, 9));
    assert!(!symbol.document().is_closed());

    // the backing document closes when the symbol goes away
    let backing = ws.open_text_document("lib.py").unwrap();
    assert_eq!(backing.reference_count(), 2);
    drop(symbols);
    assert_eq!(backing.reference_count(), 1);
}
