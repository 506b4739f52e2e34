//! Framed JSON-RPC transport.
//!
//! One instance per server connection. Three tasks are spawned: a reader
//! that decodes frames and routes responses to pending requests (and
//! server-initiated calls to the client), a writer draining the outgoing
//! payload queue, and an optional stderr forwarder. The dispatcher runs on
//! the reader task, so handler invocations are serialized with respect to
//! the byte stream.

use crate::{jsonrpc, Error, Result};
use log::{debug, error, info, warn};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::{
    io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt},
    sync::{
        mpsc::{unbounded_channel, Sender, UnboundedReceiver, UnboundedSender},
        watch, Mutex,
    },
};

pub(crate) type ServerReader = Box<dyn AsyncBufRead + Send + Unpin>;
pub(crate) type ServerWriter = Box<dyn AsyncWrite + Send + Unpin>;
pub(crate) type ServerStderr = ServerReader;

pub(crate) const DEFAULT_CONTENT_TYPE: &str = "application/vscode-jsonrpc; charset=utf-8";

/// A parsed frame header: `Content-Length` is mandatory, `Content-Type`
/// defaults to the vscode-jsonrpc type with a UTF-8 charset.
#[derive(Debug, PartialEq, Eq)]
pub(crate) struct FrameHeader {
    pub content_length: usize,
    pub content_type: String,
}

impl FrameHeader {
    pub fn new(content_length: usize) -> FrameHeader {
        FrameHeader {
            content_length,
            content_type: DEFAULT_CONTENT_TYPE.to_owned(),
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        format!(
            "Content-Length: {}\r\nContent-Type: {}\r\n\r\n",
            self.content_length, self.content_type
        )
        .into_bytes()
    }

    /// The payload charset according to the `Content-Type` parameters.
    /// The non-standard `utf8` spelling is normalized to `utf-8`.
    pub fn charset(&self) -> &str {
        for param in self.content_type.split(';') {
            let Some((field, value)) = param.split_once('=') else {
                continue;
            };
            if field.trim() == "charset" {
                let value = value.trim();
                return if value == "utf8" { "utf-8" } else { value };
            }
        }
        "utf-8"
    }

    pub fn decode_payload(&self, payload: &[u8]) -> Result<String> {
        let encoding = encoding_rs::Encoding::for_label(self.charset().as_bytes())
            .ok_or_else(|| Error::Other(anyhow::anyhow!("unknown charset '{}'", self.charset())))?;
        let (text, _, _) = encoding.decode(payload);
        Ok(text.into_owned())
    }
}

/// Reads one frame and returns its decoded payload. `Ok(None)` means the
/// stream ended cleanly between frames.
async fn recv_frame(
    reader: &mut (impl AsyncBufRead + Unpin + Send + ?Sized),
    line_buffer: &mut String,
) -> Result<Option<String>> {
    let mut content_length = None;
    let mut content_type: Option<String> = None;
    let mut any_header = false;

    loop {
        line_buffer.clear();
        if reader.read_line(line_buffer).await? == 0 {
            if any_header {
                return Err(Error::ServerStopped);
            }
            return Ok(None);
        }
        let header = line_buffer.trim();

        if header.is_empty() {
            break;
        }
        any_header = true;

        let Some((field, value)) = header.split_once(':') else {
            return Err(Error::Other(anyhow::anyhow!(
                "malformed header line: {header:?}"
            )));
        };
        match field.trim() {
            "Content-Length" => {
                content_length = Some(value.trim().parse().map_err(|_| {
                    Error::Other(anyhow::anyhow!("invalid content length {value:?}"))
                })?);
            }
            "Content-Type" => content_type = Some(value.trim().to_owned()),
            _ => {}
        }
    }

    let header = FrameHeader {
        content_length: content_length
            .ok_or_else(|| Error::Other(anyhow::anyhow!("missing content length")))?,
        content_type: content_type.unwrap_or_else(|| DEFAULT_CONTENT_TYPE.to_owned()),
    };

    let mut payload = vec![0; header.content_length];
    reader.read_exact(&mut payload).await?;
    header.decode_payload(&payload).map(Some)
}

async fn send_frame(
    writer: &mut (impl AsyncWrite + Unpin + Send + ?Sized),
    payload: &str,
) -> Result<()> {
    let header = FrameHeader::new(payload.len());
    writer.write_all(&header.to_bytes()).await?;
    writer.write_all(payload.as_bytes()).await?;
    writer.flush().await?;
    Ok(())
}

#[derive(Debug)]
pub(crate) enum Payload {
    Request {
        chan: Sender<Result<Value>>,
        value: jsonrpc::Request,
    },
    Notification(jsonrpc::Notification),
    Response(jsonrpc::Output),
}

/// An interpreted incoming message.
enum Incoming {
    Call(jsonrpc::Call),
    Output(jsonrpc::Output),
    /// The message was broken in a way that warrants an error reply (or was
    /// silently dropped; then `reply` is `None`).
    Rejected { reply: Option<jsonrpc::Output> },
}

pub(crate) struct Transport {
    name: String,
    pending_requests: Mutex<HashMap<jsonrpc::Id, Sender<Result<Value>>>>,
}

impl Transport {
    pub fn start(
        server_reader: ServerReader,
        server_writer: ServerWriter,
        server_stderr: Option<ServerReader>,
        name: String,
    ) -> (
        UnboundedReceiver<jsonrpc::Call>,
        UnboundedSender<Payload>,
        watch::Receiver<bool>,
    ) {
        let (call_tx, call_rx) = unbounded_channel();
        let (payload_tx, payload_rx) = unbounded_channel();
        let (connected_tx, connected_rx) = watch::channel(true);

        let transport = Arc::new(Transport {
            name,
            pending_requests: Mutex::new(HashMap::default()),
        });

        tokio::spawn(Self::recv(
            transport.clone(),
            server_reader,
            call_tx,
            payload_tx.clone(),
            connected_tx,
        ));
        tokio::spawn(Self::send(transport.clone(), server_writer, payload_rx));
        if let Some(stderr) = server_stderr {
            tokio::spawn(Self::err(transport, stderr));
        }

        (call_rx, payload_tx, connected_rx)
    }

    /// Sort an incoming message into a call, a response, or a rejection.
    /// Implements the JSON-RPC validation rules: requests need a string
    /// `method`, responses carry exactly one of `result` and `error`, and
    /// notifications are never answered, not even malformed ones.
    fn interpret_message(&self, text: &str) -> Incoming {
        let value: Value = match serde_json::from_str(text) {
            Ok(value) => value,
            Err(err) => {
                return Incoming::Rejected {
                    reply: Some(jsonrpc::Output::failure(
                        jsonrpc::Id::Null,
                        jsonrpc::Error::parse_error(err.to_string()),
                    )),
                }
            }
        };

        let reject = |message: &str| Incoming::Rejected {
            reply: Some(jsonrpc::Output::failure(
                jsonrpc::Id::Null,
                jsonrpc::Error::invalid_request(message),
            )),
        };

        let Value::Object(mut object) = value else {
            return reject("expected a message object");
        };

        let id = match object.remove("id") {
            None | Some(Value::Null) => None,
            Some(Value::Number(num)) => match num.as_u64() {
                Some(num) => Some(jsonrpc::Id::Num(num)),
                None => return reject("'id' must be a non-negative integer or a string"),
            },
            Some(Value::String(s)) => Some(jsonrpc::Id::Str(s)),
            Some(_) => return reject("'id' must be of type number or string"),
        };

        if let Some(method) = object.remove("method") {
            let Value::String(method) = method else {
                // Broken notifications are dropped without a reply.
                return match id {
                    Some(id) => Incoming::Rejected {
                        reply: Some(jsonrpc::Output::failure(
                            id,
                            jsonrpc::Error::invalid_request("'method' must be of type string"),
                        )),
                    },
                    None => Incoming::Rejected { reply: None },
                };
            };
            let params = match object.remove("params") {
                None => jsonrpc::Params::None,
                Some(Value::Array(values)) => jsonrpc::Params::Array(values),
                Some(Value::Object(map)) => jsonrpc::Params::Map(map),
                Some(_) => {
                    return match id {
                        Some(id) => Incoming::Rejected {
                            reply: Some(jsonrpc::Output::failure(
                                id,
                                jsonrpc::Error::invalid_request(
                                    "'params' must be of type array or object",
                                ),
                            )),
                        },
                        None => Incoming::Rejected { reply: None },
                    };
                }
            };

            return match id {
                Some(id) => Incoming::Call(jsonrpc::Call::Request(jsonrpc::Request {
                    jsonrpc: Some(jsonrpc::Version::V2),
                    method,
                    params,
                    id,
                })),
                None => Incoming::Call(jsonrpc::Call::Notification(jsonrpc::Notification {
                    jsonrpc: Some(jsonrpc::Version::V2),
                    method,
                    params,
                })),
            };
        }

        let result = object.remove("result");
        let error = object.remove("error");
        match (result, error) {
            (Some(_), Some(_)) => reject("only one of 'result' or 'error' may be included"),
            (_, Some(error)) => {
                let Ok(error) = serde_json::from_value::<jsonrpc::Error>(error) else {
                    return reject("error object must contain members 'code' and 'message'");
                };
                match id {
                    Some(id) => Incoming::Output(jsonrpc::Output::failure(id, error)),
                    None => {
                        // An error response addressed to nobody: not much to
                        // do beyond surfacing it in the log.
                        warn!(
                            "[{}] received error without a request id: {error}",
                            self.name
                        );
                        Incoming::Rejected { reply: None }
                    }
                }
            }
            (Some(result), None) => match id {
                Some(id) => Incoming::Output(jsonrpc::Output::success(id, result)),
                None => reject("at least one of 'id' or 'method' must exist"),
            },
            (None, None) => reject("expected either 'method', 'result' or 'error'"),
        }
    }

    async fn process_response(&self, output: jsonrpc::Output) {
        let id = output.id().clone();
        let Some(tx) = self.pending_requests.lock().await.remove(&id) else {
            warn!(
                "[{}] received response for unknown request id {id}, dropping it",
                self.name
            );
            return;
        };
        let result = match output {
            jsonrpc::Output::Success(success) => Ok(success.result),
            jsonrpc::Output::Failure(failure) => Err(Error::Rpc(failure.error)),
        };
        if tx.send(result).await.is_err() {
            warn!(
                "[{}] response for request {id} arrived after the caller gave up \
                 (the request likely timed out)",
                self.name
            );
        }
    }

    async fn reject_pending(&self) {
        let mut pending = self.pending_requests.lock().await;
        if !pending.is_empty() {
            warn!(
                "[{}] dropping {} in-flight requests",
                self.name,
                pending.len()
            );
        }
        for (_, tx) in pending.drain() {
            let _ = tx.send(Err(Error::ServerStopped)).await;
        }
    }

    async fn recv(
        transport: Arc<Self>,
        mut reader: ServerReader,
        call_tx: UnboundedSender<jsonrpc::Call>,
        payload_tx: UnboundedSender<Payload>,
        connected_tx: watch::Sender<bool>,
    ) {
        let mut line_buffer = String::new();
        loop {
            match recv_frame(&mut reader, &mut line_buffer).await {
                Ok(Some(text)) => {
                    debug!("[{}] <- {}", transport.name, text);
                    match transport.interpret_message(&text) {
                        Incoming::Call(call) => {
                            if call_tx.send(call).is_err() {
                                break;
                            }
                        }
                        Incoming::Output(output) => transport.process_response(output).await,
                        Incoming::Rejected { reply } => {
                            warn!("[{}] rejected malformed message", transport.name);
                            if let Some(reply) = reply {
                                let _ = payload_tx.send(Payload::Response(reply));
                            }
                        }
                    }
                }
                Ok(None) => {
                    info!("[{}] server closed the connection", transport.name);
                    break;
                }
                Err(err) => {
                    error!("[{}] <- transport error: {err}", transport.name);
                    break;
                }
            }
        }
        let _ = connected_tx.send(false);
        transport.reject_pending().await;
    }

    async fn send(
        transport: Arc<Self>,
        mut writer: ServerWriter,
        mut payload_rx: UnboundedReceiver<Payload>,
    ) {
        while let Some(payload) = payload_rx.recv().await {
            let json = match &payload {
                Payload::Request { value, .. } => serde_json::to_string(value),
                Payload::Notification(value) => serde_json::to_string(value),
                Payload::Response(value) => serde_json::to_string(value),
            };
            let json = match json {
                Ok(json) => json,
                Err(err) => {
                    error!("[{}] failed to serialize message: {err}", transport.name);
                    continue;
                }
            };
            // Register the completion handle before the frame can hit the
            // wire, otherwise a fast response could miss it.
            if let Payload::Request { chan, value } = payload {
                transport
                    .pending_requests
                    .lock()
                    .await
                    .insert(value.id.clone(), chan);
            }
            debug!("[{}] -> {}", transport.name, json);
            if let Err(err) = send_frame(&mut writer, &json).await {
                error!("[{}] -> transport error: {err}", transport.name);
                break;
            }
        }
        transport.reject_pending().await;
    }

    async fn err(transport: Arc<Self>, mut stderr: ServerReader) {
        let mut buffer = String::new();
        loop {
            buffer.clear();
            match stderr.read_line(&mut buffer).await {
                Ok(0) | Err(_) => break,
                Ok(_) => warn!("[{}] stderr: {}", transport.name, buffer.trim_end()),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_charset_defaults_to_utf_8() {
        let header = FrameHeader::new(12);
        assert_eq!(header.charset(), "utf-8");

        let header = FrameHeader {
            content_length: 0,
            content_type: "application/vscode-jsonrpc".to_owned(),
        };
        assert_eq!(header.charset(), "utf-8");
    }

    #[test]
    fn header_charset_normalizes_utf8() {
        let header = FrameHeader {
            content_length: 0,
            content_type: "application/vscode-jsonrpc; charset=utf8".to_owned(),
        };
        assert_eq!(header.charset(), "utf-8");
    }

    #[tokio::test]
    async fn frame_round_trip() {
        let payloads = [r#"{"jsonrpc":"2.0","method":"exit"}"#, "", "héllo € wörld"];
        for payload in payloads {
            let (client, server) = tokio::io::duplex(1024);
            let (mut read_half, _keep) = tokio::io::split(client);
            let (_keep2, mut write_half) = tokio::io::split(server);

            send_frame(&mut write_half, payload).await.unwrap();
            let mut reader = tokio::io::BufReader::new(&mut read_half);
            let mut line_buffer = String::new();
            let decoded = recv_frame(&mut reader, &mut line_buffer)
                .await
                .unwrap()
                .unwrap();
            assert_eq!(decoded, payload);
        }
    }

    #[tokio::test]
    async fn frame_without_content_type_header() {
        let (client, server) = tokio::io::duplex(1024);
        let (mut read_half, _keep) = tokio::io::split(client);
        let (_keep2, mut write_half) = tokio::io::split(server);

        let body = br#"{"jsonrpc":"2.0","method":"exit"}"#;
        write_half
            .write_all(format!("Content-Length: {}\r\n\r\n", body.len()).as_bytes())
            .await
            .unwrap();
        write_half.write_all(body).await.unwrap();
        write_half.flush().await.unwrap();

        let mut reader = tokio::io::BufReader::new(&mut read_half);
        let mut line_buffer = String::new();
        let decoded = recv_frame(&mut reader, &mut line_buffer)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(decoded.as_bytes(), body);
    }

    fn transport() -> Transport {
        Transport {
            name: "test".to_owned(),
            pending_requests: Mutex::new(HashMap::default()),
        }
    }

    #[test]
    fn interpret_rejects_result_and_error() {
        let msg = r#"{"jsonrpc":"2.0","id":1,"result":3,"error":{"code":-32600,"message":"x"}}"#;
        match transport().interpret_message(msg) {
            Incoming::Rejected { reply: Some(jsonrpc::Output::Failure(failure)) } => {
                assert_eq!(failure.error.code, jsonrpc::ErrorCode::InvalidRequest);
            }
            _ => panic!("expected a rejection with an InvalidRequest reply"),
        }
    }

    #[test]
    fn interpret_malformed_json_is_a_parse_error() {
        match transport().interpret_message("{ not json") {
            Incoming::Rejected { reply: Some(jsonrpc::Output::Failure(failure)) } => {
                assert_eq!(failure.error.code, jsonrpc::ErrorCode::ParseError);
                assert_eq!(failure.id, jsonrpc::Id::Null);
            }
            _ => panic!("expected a rejection with a ParseError reply"),
        }
    }

    #[test]
    fn interpret_classifies_calls() {
        let req = r#"{"jsonrpc":"2.0","id":7,"method":"workspace/configuration","params":{}}"#;
        assert!(matches!(
            transport().interpret_message(req),
            Incoming::Call(jsonrpc::Call::Request(_))
        ));

        let notif = r#"{"jsonrpc":"2.0","method":"$/progress"}"#;
        assert!(matches!(
            transport().interpret_message(notif),
            Incoming::Call(jsonrpc::Call::Notification(_))
        ));

        let response = r#"{"jsonrpc":"2.0","id":7,"result":null}"#;
        assert!(matches!(
            transport().interpret_message(response),
            Incoming::Output(jsonrpc::Output::Success(_))
        ));
    }
}
