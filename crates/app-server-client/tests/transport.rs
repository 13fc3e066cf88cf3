use std::time::Duration;

use app_server_client::{
    AppServerChannels, AppServerClient, ApprovalDecision, ApprovalResponse, ClientError,
    ClientInfo, InitializeCapabilities, InitializeParams, RequestId, TransportDiagnostic,
    TransportFailure, TurnStartParams, UserInput,
};
use serde_json::{Value, json};
use tokio::io::{
    AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream, Lines, ReadHalf, WriteHalf,
};

struct FakeServer {
    lines: Lines<BufReader<ReadHalf<DuplexStream>>>,
    writer: WriteHalf<DuplexStream>,
}

impl FakeServer {
    async fn read_frame(&mut self) -> anyhow::Result<Value> {
        let line = self
            .lines
            .next_line()
            .await?
            .ok_or_else(|| anyhow::anyhow!("client closed the stream"))?;
        Ok(serde_json::from_str(&line)?)
    }

    async fn send(&mut self, value: Value) -> anyhow::Result<()> {
        self.send_raw(&serde_json::to_string(&value)?).await
    }

    async fn send_raw(&mut self, line: &str) -> anyhow::Result<()> {
        self.send_bytes(line.as_bytes()).await
    }

    async fn send_bytes(&mut self, line: &[u8]) -> anyhow::Result<()> {
        self.writer.write_all(line).await?;
        self.writer.write_all(b"\n").await?;
        self.writer.flush().await?;
        Ok(())
    }
}

fn connect(max_consecutive_malformed: usize) -> (AppServerClient, AppServerChannels, FakeServer) {
    let (client_stream, server_stream) = tokio::io::duplex(64 * 1024);
    let (client_read, client_write) = tokio::io::split(client_stream);
    let (server_read, server_write) = tokio::io::split(server_stream);

    let (client, channels) = AppServerClient::connect_with_io(
        Box::new(client_write),
        Box::new(client_read),
        None,
        max_consecutive_malformed,
    );
    let server = FakeServer {
        lines: BufReader::new(server_read).lines(),
        writer: server_write,
    };
    (client, channels, server)
}

fn client_info() -> InitializeParams {
    InitializeParams {
        client_info: ClientInfo {
            name: "agent_monitor".to_string(),
            title: Some("Agent Monitor".to_string()),
            version: "0.1.0".to_string(),
        },
        capabilities: Some(InitializeCapabilities {
            experimental_api: true,
            opt_out_notification_methods: None,
        }),
    }
}

fn turn_params(text: &str) -> TurnStartParams {
    TurnStartParams {
        thread_id: "thread-1".to_string(),
        input: vec![UserInput::Text {
            text: text.to_string(),
        }],
        ..TurnStartParams::default()
    }
}

#[tokio::test]
async fn initialize_sends_initialized_notification_after_response() -> anyhow::Result<()> {
    let (client, _channels, mut server) = connect(8);

    let server_task = tokio::spawn(async move {
        let request = server.read_frame().await?;
        assert_eq!(request["method"], "initialize");
        assert_eq!(request["id"], 1);
        assert_eq!(request["params"]["capabilities"]["experimentalApi"], true);
        server
            .send(json!({"id": request["id"].clone(), "result": {"userAgent": "fake/1.0"}}))
            .await?;

        let notification = server.read_frame().await?;
        assert_eq!(notification["method"], "initialized");
        assert!(notification.get("id").is_none());
        Ok::<(), anyhow::Error>(())
    });

    let response = client.initialize(client_info()).await?;
    assert_eq!(response.user_agent.as_deref(), Some("fake/1.0"));
    server_task.await??;
    Ok(())
}

#[tokio::test]
async fn initialize_tolerates_already_initialized_servers() -> anyhow::Result<()> {
    let (client, _channels, mut server) = connect(8);

    let server_task = tokio::spawn(async move {
        let request = server.read_frame().await?;
        server
            .send(json!({
                "id": request["id"].clone(),
                "error": {"code": -32600, "message": "Already initialized"}
            }))
            .await?;
        let notification = server.read_frame().await?;
        assert_eq!(notification["method"], "initialized");
        Ok::<(), anyhow::Error>(())
    });

    let response = client.initialize(client_info()).await?;
    assert!(response.user_agent.is_none());
    server_task.await??;
    Ok(())
}

#[tokio::test]
async fn responses_are_matched_by_id_not_arrival_order() -> anyhow::Result<()> {
    let (client, _channels, mut server) = connect(8);

    let server_task = tokio::spawn(async move {
        let first = server.read_frame().await?;
        let second = server.read_frame().await?;
        assert!(second["id"].as_i64() > first["id"].as_i64());
        server
            .send(json!({"id": second["id"].clone(), "result": {"which": "second"}}))
            .await?;
        server
            .send(json!({"id": first["id"].clone(), "result": {"which": "first"}}))
            .await?;
        Ok::<(), anyhow::Error>(())
    });

    let (first, second) = tokio::join!(
        client.request::<Value, Value>("model/list", None),
        client.request::<Value, Value>("thread/list", None),
    );
    let (first, second) = (first?, second?);
    let mut answers = [first["which"].clone(), second["which"].clone()];
    answers.sort_by_key(ToString::to_string);
    assert_eq!(answers, [json!("first"), json!("second")]);
    server_task.await??;
    Ok(())
}

#[tokio::test]
async fn unknown_response_ids_are_discarded() -> anyhow::Result<()> {
    let (client, _channels, mut server) = connect(8);

    let server_task = tokio::spawn(async move {
        let request = server.read_frame().await?;
        server.send(json!({"id": 999, "result": "stray"})).await?;
        server
            .send(json!({"id": request["id"].clone(), "result": "expected"}))
            .await?;
        Ok::<(), anyhow::Error>(())
    });

    let result: Value = client.request::<Value, Value>("model/list", None).await?;
    assert_eq!(result, json!("expected"));
    server_task.await??;
    Ok(())
}

#[tokio::test]
async fn server_requests_and_notifications_are_routed_separately() -> anyhow::Result<()> {
    let (client, mut channels, mut server) = connect(8);

    server
        .send(json!({"method": "turn/started", "params": {"turn": {"id": "turn-1"}}}))
        .await?;
    server
        .send(json!({
            "id": "approval-1",
            "method": "item/commandExecution/requestApproval",
            "params": {"threadId": "thread-1", "turnId": "turn-1", "itemId": "item-1"}
        }))
        .await?;

    let notification = channels
        .notifications
        .recv()
        .await
        .ok_or_else(|| anyhow::anyhow!("missing notification"))?;
    assert_eq!(notification.method, "turn/started");

    let request = channels
        .requests
        .recv()
        .await
        .ok_or_else(|| anyhow::anyhow!("missing server request"))?;
    assert_eq!(request.id, RequestId::String("approval-1".to_string()));

    client
        .respond(
            &request.id,
            &ApprovalResponse {
                decision: ApprovalDecision::AcceptForSession,
            },
        )
        .await?;
    let reply = server.read_frame().await?;
    assert_eq!(
        reply,
        json!({"id": "approval-1", "result": {"decision": "acceptForSession"}})
    );
    Ok(())
}

#[tokio::test]
async fn malformed_lines_below_threshold_are_tolerated() -> anyhow::Result<()> {
    let (client, mut channels, mut server) = connect(3);

    let server_task = tokio::spawn(async move {
        let request = server.read_frame().await?;
        server.send_raw("warming up...").await?;
        server.send_raw("").await?;
        server.send_raw("{\"neither\":true}").await?;
        server
            .send(json!({"id": request["id"].clone(), "result": {"turn": {"id": "turn-9"}}}))
            .await?;
        Ok::<(), anyhow::Error>(())
    });

    let response: Value = client
        .request("turn/start", Some(&turn_params("hello")))
        .await?;
    assert_eq!(response["turn"]["id"], "turn-9");

    let first = channels.diagnostics.recv().await;
    assert!(matches!(
        first,
        Some(TransportDiagnostic::MalformedFrame { ref raw, .. }) if raw == "warming up..."
    ));
    server_task.await??;
    Ok(())
}

#[tokio::test]
async fn too_many_malformed_lines_close_the_transport() -> anyhow::Result<()> {
    let (client, channels, mut server) = connect(2);

    let server_task = tokio::spawn(async move {
        let _request = server.read_frame().await?;
        for _ in 0..3 {
            server.send_raw("garbage").await?;
        }
        // Hand the server back so its halves stay open until the end.
        Ok::<FakeServer, anyhow::Error>(server)
    });

    let result = client.request::<Value, Value>("model/list", None).await;
    assert!(matches!(result, Err(ClientError::ConnectionClosed)));
    assert_eq!(
        channels.closed.await?,
        TransportFailure::MalformedLimit { consecutive: 3 }
    );
    let _server = server_task.await??;
    Ok(())
}

#[tokio::test]
async fn pending_requests_fail_when_the_server_goes_away() -> anyhow::Result<()> {
    let (client, channels, mut server) = connect(8);

    let server_task = tokio::spawn(async move {
        let _request = server.read_frame().await?;
        drop(server);
        Ok::<(), anyhow::Error>(())
    });

    let result = client.request::<Value, Value>("model/list", None).await;
    assert!(matches!(result, Err(ClientError::ConnectionClosed)));
    assert_eq!(channels.closed.await?, TransportFailure::Closed);
    server_task.await??;
    Ok(())
}

#[tokio::test]
async fn turn_start_response_may_omit_the_turn() -> anyhow::Result<()> {
    let (client, _channels, mut server) = connect(8);

    let server_task = tokio::spawn(async move {
        let request = server.read_frame().await?;
        assert_eq!(request["params"]["input"], json!([{"type": "text", "text": "hi"}]));
        server
            .send(json!({"id": request["id"].clone(), "result": {}}))
            .await?;
        Ok::<(), anyhow::Error>(())
    });

    let response: Value = client
        .request("turn/start", Some(&turn_params("hi")))
        .await?;
    assert!(response.get("turn").is_none());
    server_task.await??;
    Ok(())
}

#[tokio::test]
async fn invalid_utf8_lines_do_not_close_the_transport() -> anyhow::Result<()> {
    let (client, mut channels, mut server) = connect(8);

    let server_task = tokio::spawn(async move {
        let request = server.read_frame().await?;
        server.send_bytes(b"debug \xff\xfe not utf8").await?;
        server
            .send(json!({"id": request["id"].clone(), "result": {"data": []}}))
            .await?;
        Ok::<FakeServer, anyhow::Error>(server)
    });

    let result: Value = client.request::<Value, Value>("model/list", None).await?;
    assert_eq!(result, json!({"data": []}));
    match channels.diagnostics.recv().await {
        Some(TransportDiagnostic::MalformedFrame { raw, .. }) => {
            assert_eq!(raw, "debug \u{fffd}\u{fffd} not utf8");
        }
        other => anyhow::bail!("expected a malformed frame diagnostic, got {other:?}"),
    }
    assert!(channels.closed.try_recv().is_err());
    let _server = server_task.await??;
    Ok(())
}

#[tokio::test]
async fn unanswered_requests_time_out_and_late_responses_are_dropped() -> anyhow::Result<()> {
    let (client, _channels, mut server) = connect(8);
    let client = client.with_request_timeout(Duration::from_millis(100));

    let stalled = server.read_frame();
    let (request, result) = tokio::join!(
        stalled,
        client.request::<Value, Value>("thread/list", None)
    );
    let request = request?;
    match result {
        Err(ClientError::Timeout { method, after }) => {
            assert_eq!(method, "thread/list");
            assert_eq!(after, Duration::from_millis(100));
        }
        other => anyhow::bail!("expected a timeout, got {other:?}"),
    }

    // The late answer has no pending request left and must not be taken
    // for the next one.
    server
        .send(json!({"id": request["id"].clone(), "result": "late"}))
        .await?;
    let server_task = tokio::spawn(async move {
        let next = server.read_frame().await?;
        server
            .send(json!({"id": next["id"].clone(), "result": "fresh"}))
            .await?;
        Ok::<FakeServer, anyhow::Error>(server)
    });
    let result: Value = client.request::<Value, Value>("model/list", None).await?;
    assert_eq!(result, json!("fresh"));
    let _server = server_task.await??;
    Ok(())
}

#[tokio::test]
async fn request_timeout_does_not_bound_the_handshake() -> anyhow::Result<()> {
    let (client, _channels, mut server) = connect(8);
    let client = client.with_request_timeout(Duration::from_millis(50));

    let server_task = tokio::spawn(async move {
        let request = server.read_frame().await?;
        tokio::time::sleep(Duration::from_millis(150)).await;
        server
            .send(json!({"id": request["id"].clone(), "result": {}}))
            .await?;
        let _initialized = server.read_frame().await?;
        Ok::<FakeServer, anyhow::Error>(server)
    });

    client.initialize(client_info()).await?;
    let _server = server_task.await??;
    Ok(())
}
