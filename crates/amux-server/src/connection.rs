use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::sync::{Mutex, broadcast};
use tracing::{debug, error, warn};

use amux_protocol::{ErrorCode, Request, Response, SessionEvent};
use libamux::backend::SpawnSpec;
use libamux::manager::SessionCreateOptions;
use libamux::{AmuxError, SessionManager, StateFile, TranscriptVerifier};

use crate::server::ServerHandle;

type SharedWriter = Arc<Mutex<tokio::net::unix::OwnedWriteHalf>>;

/// Handle one control client: JSON-lines requests in, responses and
/// subscribed events out. A malformed line yields an error response without
/// dropping the connection.
pub async fn handle_client(stream: UnixStream, handle: ServerHandle) {
    let (reader, writer) = stream.into_split();
    let reader = BufReader::new(reader);
    let writer: SharedWriter = Arc::new(Mutex::new(writer));

    let mut lines = reader.lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => {
                debug!("control client disconnected");
                break;
            }
            Err(e) => {
                error!(error = %e, "control read error");
                break;
            }
        };

        let request: Request = match serde_json::from_str(&line) {
            Ok(request) => request,
            Err(e) => {
                let resp = Response::Error {
                    message: format!("invalid request: {e}"),
                    code: ErrorCode::InvalidRequest,
                };
                let mut w = writer.lock().await;
                let _ = write_response(&mut w, &resp).await;
                continue;
            }
        };

        let response = handle_request(request, &handle, &writer).await;
        let mut w = writer.lock().await;
        if let Err(e) = write_response(&mut w, &response).await {
            error!(error = %e, "control write error");
            break;
        }
    }
}

async fn handle_request(
    request: Request,
    handle: &ServerHandle,
    writer: &SharedWriter,
) -> Response {
    let manager: &Arc<SessionManager> = &handle.manager;
    match request {
        Request::SessionCreate {
            backend,
            exec,
            args,
            cwd,
            expected_external_id,
            first_prompt,
            cols,
            rows,
        } => {
            let result = manager
                .create_session(SessionCreateOptions {
                    backend,
                    spec: SpawnSpec {
                        exec,
                        args,
                        cwd,
                        cols,
                        rows,
                    },
                    expected_external_id,
                    expected_first_prompt: first_prompt,
                    window_id: None,
                })
                .await;
            match result {
                Ok(summary) => ok_json(&summary),
                Err(e) => error_response(e),
            }
        }

        Request::SessionList => ok_json(&manager.list_sessions().await),

        Request::SessionInfo { session_id } => {
            result_json(manager.session_summary(&session_id).await)
        }

        Request::SessionRemove { session_id } => {
            manager.remove_session(&session_id).await;
            Response::ok(None)
        }

        Request::SessionKill { session_id } => {
            result_unit(manager.kill_session(&session_id).await)
        }

        Request::KillAll => {
            manager.kill_all().await;
            Response::ok(None)
        }

        Request::SendText { session_id, text } => {
            result_unit(manager.send_text(&session_id, &text).await)
        }

        Request::SendInput { session_id, data } => {
            result_unit(manager.write_bytes(&session_id, &data).await)
        }

        Request::Interrupt { session_id } => result_unit(manager.interrupt(&session_id).await),

        Request::Resize {
            session_id,
            cols,
            rows,
        } => result_unit(manager.resize(&session_id, cols, rows).await),

        Request::QueuePush { session_id, text } => {
            match manager.queue_push(&session_id, text).await {
                Ok(prompt_id) => Response::ok(Some(serde_json::json!({ "prompt_id": prompt_id }))),
                Err(e) => error_response(e),
            }
        }

        Request::QueueRemove {
            session_id,
            prompt_id,
        } => match manager.queue_remove(&session_id, &prompt_id).await {
            Ok(removed) => Response::ok(Some(serde_json::json!({ "removed": removed }))),
            Err(e) => error_response(e),
        },

        Request::QueueReorder {
            session_id,
            prompt_ids,
        } => result_unit(manager.queue_reorder(&session_id, &prompt_ids).await),

        Request::BufferDump { session_id } => match manager.buffer_dump(&session_id).await {
            Ok(data) => Response::ok(Some(serde_json::json!({
                "data_b64": base64_encode(&data),
            }))),
            Err(e) => error_response(e),
        },

        Request::BufferSince {
            session_id,
            position,
        } => match manager.buffer_since(&session_id, position).await {
            Ok(since) => Response::ok(Some(serde_json::json!({
                "data_b64": base64_encode(&since.data),
                "position": since.position,
            }))),
            Err(e) => error_response(e),
        },

        Request::RegisterExternalId {
            session_id,
            external_session_id,
        } => result_unit(
            manager
                .register_external_id(&session_id, &external_session_id)
                .await,
        ),

        Request::Verify { session_id } => {
            let verifier = TranscriptVerifier::new(handle.transcripts_root.clone());
            match verifier.verify(manager, &session_id).await {
                Ok(status) => Response::ok(Some(serde_json::json!({ "verification": status }))),
                Err(e) => error_response(e),
            }
        }

        Request::SetCustomName {
            session_id,
            name,
            color,
        } => result_unit(manager.set_custom_name(&session_id, name, color).await),

        Request::SetSortOrder {
            session_id,
            sort_order,
        } => result_unit(manager.set_sort_order(&session_id, sort_order).await),

        Request::SetPendingPrompt { session_id, text } => {
            result_unit(manager.set_pending_prompt(&session_id, text).await)
        }

        Request::Save => {
            let store = StateFile::new(handle.state_file.clone());
            match manager.save(&store).await {
                Ok(()) => Response::ok(None),
                Err(e) => Response::Error {
                    message: e.to_string(),
                    code: ErrorCode::ServerError,
                },
            }
        }

        Request::Subscribe { session_id } => match manager.subscribe(&session_id) {
            Some(rx) => {
                let writer = Arc::clone(writer);
                tokio::spawn(async move {
                    forward_events(rx, writer).await;
                });
                Response::ok(None)
            }
            None => Response::Error {
                message: format!("session not found: {session_id}"),
                code: ErrorCode::SessionNotFound,
            },
        },

        Request::ServerShutdown => {
            handle.request_shutdown();
            Response::ok(None)
        }
    }
}

/// Forward broadcast events to the client until it drops or the channel
/// closes. A lagged subscriber skips events and keeps going.
async fn forward_events(mut rx: broadcast::Receiver<SessionEvent>, writer: SharedWriter) {
    loop {
        match rx.recv().await {
            Ok(event) => {
                let resp = Response::Event(event);
                let mut w = writer.lock().await;
                if write_response(&mut w, &resp).await.is_err() {
                    break;
                }
            }
            Err(broadcast::error::RecvError::Lagged(n)) => {
                warn!(skipped = n, "subscriber lagged");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

fn ok_json<T: serde::Serialize>(value: &T) -> Response {
    match serde_json::to_value(value) {
        Ok(data) => Response::ok(Some(data)),
        Err(e) => Response::Error {
            message: e.to_string(),
            code: ErrorCode::ServerError,
        },
    }
}

fn result_json<T: serde::Serialize>(result: Result<T, AmuxError>) -> Response {
    match result {
        Ok(value) => ok_json(&value),
        Err(e) => error_response(e),
    }
}

fn result_unit(result: Result<(), AmuxError>) -> Response {
    match result {
        Ok(()) => Response::ok(None),
        Err(e) => error_response(e),
    }
}

fn error_response(error: AmuxError) -> Response {
    let (code, message) = error.to_error_code();
    Response::Error { message, code }
}

fn base64_encode(data: &[u8]) -> String {
    use base64::{Engine, engine::general_purpose::STANDARD};
    STANDARD.encode(data)
}

async fn write_response(
    writer: &mut tokio::net::unix::OwnedWriteHalf,
    response: &Response,
) -> Result<(), std::io::Error> {
    let json = serde_json::to_string(response)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    writer.write_all(json.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use libamux::manager::SessionManagerConfig;
    use tokio::io::{AsyncBufReadExt, BufReader};
    use tokio::net::{UnixListener, UnixStream};

    struct TestClient {
        reader: BufReader<tokio::net::unix::OwnedReadHalf>,
        writer: tokio::net::unix::OwnedWriteHalf,
    }

    impl TestClient {
        async fn send_line(&mut self, line: &str) {
            self.writer.write_all(line.as_bytes()).await.unwrap();
            self.writer.write_all(b"\n").await.unwrap();
        }

        async fn send(&mut self, request: &Request) {
            self.send_line(&serde_json::to_string(request).unwrap()).await;
        }

        async fn recv(&mut self) -> Response {
            let mut line = String::new();
            self.reader.read_line(&mut line).await.unwrap();
            serde_json::from_str(&line).unwrap()
        }
    }

    async fn start_server(dir: &std::path::Path) -> (TestClient, ServerHandle) {
        let socket = dir.join("control.sock");
        let listener = UnixListener::bind(&socket).unwrap();
        let manager = libamux::SessionManager::new(SessionManagerConfig::default());
        let handle = ServerHandle::new(
            manager,
            dir.join("state.json"),
            dir.join("transcripts"),
        );
        let server_handle = handle.clone();
        tokio::spawn(async move {
            let (stream, _addr) = listener.accept().await.unwrap();
            handle_client(stream, server_handle).await;
        });

        let stream = UnixStream::connect(&socket).await.unwrap();
        let (read_half, writer) = stream.into_split();
        let client = TestClient {
            reader: BufReader::new(read_half),
            writer,
        };
        (client, handle)
    }

    fn create_request(dir: &std::path::Path, external_id: Option<&str>) -> Request {
        Request::SessionCreate {
            backend: amux_protocol::BackendKind::ExternallyOwned,
            exec: String::new(),
            args: Vec::new(),
            cwd: dir.to_path_buf(),
            expected_external_id: external_id.map(String::from),
            first_prompt: None,
            cols: 80,
            rows: 24,
        }
    }

    fn data_of(response: Response) -> serde_json::Value {
        match response {
            Response::Ok { data } => data.expect("response carried no data"),
            other => panic!("expected ok response, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn create_list_and_info_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let (mut client, _handle) = start_server(dir.path()).await;

        client.send(&create_request(dir.path(), Some("ext-42"))).await;
        let created = data_of(client.recv().await);
        let session_id = created["id"].as_str().unwrap().to_string();

        client.send(&Request::SessionList).await;
        let listed = data_of(client.recv().await);
        assert_eq!(listed.as_array().unwrap().len(), 1);

        client.send(&Request::SessionInfo { session_id: session_id.clone() }).await;
        let info = data_of(client.recv().await);
        assert_eq!(info["external_session_id"], "ext-42");
    }

    #[tokio::test]
    async fn malformed_line_errors_without_dropping_connection() {
        let dir = tempfile::tempdir().unwrap();
        let (mut client, _handle) = start_server(dir.path()).await;

        client.send_line("{not json at all").await;
        match client.recv().await {
            Response::Error { code, .. } => assert_eq!(code, ErrorCode::InvalidRequest),
            other => panic!("expected error, got {other:?}"),
        }

        // Same connection keeps working.
        client.send(&Request::SessionList).await;
        let listed = data_of(client.recv().await);
        assert!(listed.as_array().unwrap().is_empty());
    }

    #[tokio::test]
    async fn unknown_session_maps_to_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let (mut client, _handle) = start_server(dir.path()).await;

        client
            .send(&Request::SessionKill { session_id: "missing".to_string() })
            .await;
        match client.recv().await {
            Response::Error { code, .. } => assert_eq!(code, ErrorCode::SessionNotFound),
            other => panic!("expected error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn subscriber_receives_exit_events() {
        let dir = tempfile::tempdir().unwrap();
        let (mut client, _handle) = start_server(dir.path()).await;

        client.send(&create_request(dir.path(), None)).await;
        let created = data_of(client.recv().await);
        let session_id = created["id"].as_str().unwrap().to_string();

        client.send(&Request::Subscribe { session_id: session_id.clone() }).await;
        assert!(matches!(client.recv().await, Response::Ok { .. }));

        client.send(&Request::SessionKill { session_id }).await;

        // Responses and events interleave on the same connection; scan until
        // the exit event shows up.
        let mut saw_exit = false;
        for _ in 0..10 {
            match client.recv().await {
                Response::Event(SessionEvent::ProcessExited { .. }) => {
                    saw_exit = true;
                    break;
                }
                _ => {}
            }
        }
        assert!(saw_exit, "exit event never delivered to subscriber");
    }

    #[tokio::test]
    async fn save_writes_the_state_file() {
        let dir = tempfile::tempdir().unwrap();
        let (mut client, handle) = start_server(dir.path()).await;

        client.send(&create_request(dir.path(), Some("ext-saved"))).await;
        let _ = client.recv().await;
        client.send(&Request::Save).await;
        assert!(matches!(client.recv().await, Response::Ok { .. }));

        let contents = std::fs::read_to_string(&handle.state_file).unwrap();
        assert!(contents.contains("ext-saved"));
    }
}
