//! Integration tests for the per-call client and registry against real
//! subprocesses.

#![cfg(unix)]

mod common;

use std::time::{Duration, Instant};

use curio_mcp::{McpError, RpcClient, ServerConfig, ServerRegistry, ServersDocument, ToolClient};
use serde_json::json;

use common::{mirror_server, one_shot_server, read_pid, sh};

#[tokio::test]
async fn test_list_tools_skips_junk_lines() {
    let config = ServerConfig::new("echo").with_arg(
        "starting tool server...\n{\"version\":\"1.0\",\"id\":1,\"result\":{\"tools\":[]}}",
    );
    let client = RpcClient::new("echo", config);

    let tools = client.list_tools().await.unwrap();
    assert!(tools.is_empty());
}

#[tokio::test]
async fn test_call_resolves_with_result_amid_noise() {
    let client = RpcClient::new(
        "noisy",
        sh(r#"read -r line
echo 'INFO booting'
echo '{"level":"debug","msg":"not a response"}'
echo '{"jsonrpc":"2.0","id":1,"result":{"content":[{"type":"text","text":"hi"}]}}'
echo 'bye' >&2"#),
    );

    let output = client.call_tool("greet", json!({"who": "me"})).await.unwrap();
    assert_eq!(output.text().as_deref(), Some("hi"));
    assert!(!output.is_error());
}

#[tokio::test]
async fn test_request_envelope_on_the_wire() {
    let client = RpcClient::new("mirror", mirror_server());

    let output = client
        .call_tool("get_video", json!({"url": "https://example.com/v/1"}))
        .await
        .unwrap();

    let request = output.into_value();
    assert_eq!(request["jsonrpc"], "2.0");
    assert_eq!(request["id"], 1);
    assert_eq!(request["method"], "tools/call");
    assert_eq!(
        request["params"],
        json!({"name": "get_video", "arguments": {"url": "https://example.com/v/1"}})
    );
}

#[tokio::test]
async fn test_remote_error_is_rejected_with_message() {
    let client = RpcClient::new(
        "failing",
        sh(r#"read -r line; echo '{"jsonrpc":"2.0","id":1,"error":{"code":-32602,"message":"Unknown tool: x"}}'"#),
    );

    match client.call_tool("x", json!({})).await {
        Err(McpError::Remote { code, message, .. }) => {
            assert_eq!(code, Some(-32602));
            assert_eq!(message, "Unknown tool: x");
        }
        other => panic!("expected remote error, got {:?}", other),
    }
}

#[tokio::test]
async fn test_exit_code_one_with_empty_output() {
    let client = RpcClient::new("broken", sh("echo 'missing API key' >&2; exit 1"));

    match client.call_tool("x", json!({})).await {
        Err(McpError::ProcessExit { code, stderr }) => {
            assert_eq!(code, Some(1));
            assert_eq!(stderr, "missing API key");
        }
        other => panic!("expected process exit error, got {:?}", other),
    }
}

#[tokio::test]
async fn test_clean_exit_without_response() {
    let client = RpcClient::new("chatty", sh("echo 'usage: server --stdio'; echo 'bad flag' >&2"));

    match client.call_tool("x", json!({})).await {
        Err(err @ McpError::ProtocolParse { .. }) => {
            let diagnostics = err.diagnostics().unwrap();
            assert!(diagnostics.contains("bad flag"));
            assert!(diagnostics.contains("usage: server --stdio"));
        }
        other => panic!("expected protocol error, got {:?}", other),
    }
}

#[tokio::test]
async fn test_timeout_kills_process() {
    use nix::errno::Errno;
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    let dir = tempfile::tempdir().unwrap();
    let pid_file = dir.path().join("server.pid");
    let client = RpcClient::new(
        "sleepy",
        sh(&format!("echo $$ > '{}'; exec sleep 30", pid_file.display())),
    )
    .with_timeout(Duration::from_millis(500));

    let started = Instant::now();
    let result = client.call_tool("x", json!({})).await;

    assert!(matches!(result, Err(McpError::Timeout(d)) if d == Duration::from_millis(500)));
    assert!(started.elapsed() < Duration::from_secs(10));

    let pid = read_pid(&pid_file);
    assert_eq!(kill(Pid::from_raw(pid), None), Err(Errno::ESRCH));
}

#[cfg(target_os = "linux")]
#[tokio::test]
async fn test_resolves_when_server_exits_leaving_background_child() {
    let dir = tempfile::tempdir().unwrap();
    let pid_file = dir.path().join("background.pid");
    let client = RpcClient::new(
        "forking",
        sh(&format!(
            r#"read -r line; echo '{{"jsonrpc":"2.0","id":1,"result":{{"tools":[]}}}}'; sleep 5 & echo $! > '{}'"#,
            pid_file.display()
        )),
    )
    .with_timeout(Duration::from_secs(3));

    let started = Instant::now();
    let tools = client.list_tools().await.unwrap();

    assert!(tools.is_empty());
    assert!(started.elapsed() < Duration::from_secs(2));
    assert!(common::wait_gone(read_pid(&pid_file), Duration::from_secs(2)).await);
}

#[cfg(target_os = "linux")]
#[tokio::test]
async fn test_timeout_kills_background_children() {
    let dir = tempfile::tempdir().unwrap();
    let pid_file = dir.path().join("background.pid");
    let client = RpcClient::new(
        "forking",
        sh(&format!("sleep 30 & echo $! > '{}'; wait", pid_file.display())),
    )
    .with_timeout(Duration::from_millis(500));

    assert!(matches!(
        client.call_tool("x", json!({})).await,
        Err(McpError::Timeout(_))
    ));
    assert!(common::wait_gone(read_pid(&pid_file), Duration::from_secs(2)).await);
}

#[tokio::test]
async fn test_launch_error() {
    let client = RpcClient::new("ghost", ServerConfig::new("/nonexistent/tool-server"));
    assert!(matches!(
        client.list_tools().await,
        Err(McpError::Launch { .. })
    ));
}

#[tokio::test]
async fn test_concurrent_calls_do_not_cross_talk() {
    let client = RpcClient::new("one-shot", one_shot_server());

    let (slow, fast) = futures::future::join(
        client.call_tool("slow", json!({})),
        client.call_tool("fast", json!({})),
    )
    .await;

    assert_eq!(slow.unwrap().text().as_deref(), Some("slow"));
    assert_eq!(fast.unwrap().text().as_deref(), Some("fast"));
}

#[tokio::test]
async fn test_each_call_launches_a_new_process() {
    let client = RpcClient::new("one-shot", one_shot_server());

    for expected in ["first", "second", "third"] {
        let output = client.call_tool(expected, json!({})).await.unwrap();
        assert_eq!(output.text().as_deref(), Some(expected));
    }
    assert_eq!(client.next_request_id(), 4);
}

#[tokio::test]
async fn test_registry_end_to_end() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("servers.json");
    let document = json!({
        "servers": {
            "summarizer": {
                "command": "sh",
                "args": ["-c", "read -r line; printf '{\"jsonrpc\":\"2.0\",\"id\":1,\"result\":{\"content\":[{\"text\":\"%s\"}]}}\\n' \"$SUMMARY_STYLE\""],
                "env": {"SUMMARY_STYLE": "terse"}
            }
        }
    });
    std::fs::write(&path, document.to_string()).unwrap();

    let mut registry = ServerRegistry::new();
    registry.load_from_config(&ServersDocument::from_path(&path).unwrap());

    let client = registry.get_client("summarizer").unwrap();
    client.connect().await.unwrap();
    let output = client.call_tool("summarize", json!({"text": "..."})).await.unwrap();
    client.close().await.unwrap();

    assert_eq!(output.text().as_deref(), Some("terse"));
    assert!(matches!(
        registry.get_client("unregistered-name"),
        Err(McpError::NotRegistered(_))
    ));
}

#[tokio::test]
async fn test_reregistration_is_reflected() {
    let mut registry = ServerRegistry::new();
    registry.register("svc", sh("exit 1"));
    assert!(matches!(
        registry.get_client("svc").unwrap().call_tool("x", json!({})).await,
        Err(McpError::ProcessExit { .. })
    ));

    registry.register("svc", one_shot_server());
    let output = registry.get_client("svc").unwrap().call_tool("x", json!({})).await.unwrap();
    assert_eq!(output.text().as_deref(), Some("x"));
}
