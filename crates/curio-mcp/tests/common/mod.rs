//! Shell-script tool servers for integration tests.

#![allow(dead_code)]

use curio_mcp::ServerConfig;

/// Extracts the numeric request id from a request line on stdin.
const EXTRACT_ID: &str =
    r#"id=$(printf '%s' "$line" | sed -n 's/^{"jsonrpc":"2.0","id":\([0-9]*\),.*/\1/p')"#;

/// Server config running `script` under `sh -c`.
pub fn sh(script: &str) -> ServerConfig {
    ServerConfig::new("sh").with_args(["-c", script])
}

/// A server that speaks the protocol over a long-lived session.
///
/// - `initialize` answers with server info `mock`, after a noise line
/// - `tools/list` advertises one tool, `echo`
/// - tool `fail` answers with a remote error
/// - tool `hang` never answers
/// - tool `crash` exits with code 3
/// - any other tool answers with text `call <id>`
pub fn session_server() -> ServerConfig {
    sh(&format!(
        r#"
while IFS= read -r line; do
  {EXTRACT_ID}
  [ -z "$id" ] && continue
  case "$line" in
    *'"method":"initialize"'*)
      echo "mock server booting"
      printf '{{"jsonrpc":"2.0","id":%s,"result":{{"protocolVersion":"2024-11-05","capabilities":{{"tools":{{"listChanged":false}}}},"serverInfo":{{"name":"mock","version":"0.1.0"}}}}}}\n' "$id" ;;
    *'"method":"tools/list"'*)
      printf '{{"jsonrpc":"2.0","id":%s,"result":{{"tools":[{{"name":"echo","description":"Echo text","inputSchema":{{"type":"object"}}}}]}}}}\n' "$id" ;;
    *'"name":"fail"'*)
      printf '{{"jsonrpc":"2.0","id":%s,"error":{{"code":-32000,"message":"tool failed"}}}}\n' "$id" ;;
    *'"name":"hang"'*) ;;
    *'"name":"crash"'*) exit 3 ;;
    *'"method":"tools/call"'*)
      printf '{{"jsonrpc":"2.0","id":%s,"result":{{"content":[{{"type":"text","text":"call %s"}}]}}}}\n' "$id" "$id" ;;
  esac
done
"#
    ))
}

/// A one-shot server: reads a single request, answers with the tool name
/// as text, sleeping first when the tool is called `slow`.
pub fn one_shot_server() -> ServerConfig {
    sh(&format!(
        r#"
IFS= read -r line
{EXTRACT_ID}
case "$line" in
  *'"name":"slow"'*) sleep 1; text=slow ;;
  *'"name":"'*) text=$(printf '%s' "$line" | sed -n 's/.*"name":"\([^"]*\)".*/\1/p') ;;
  *) text=none ;;
esac
echo "processing request $id" >&2
printf '{{"jsonrpc":"2.0","id":%s,"result":{{"content":[{{"type":"text","text":"%s"}}]}}}}\n' "$id" "$text"
"#
    ))
}

/// A one-shot server that answers with the request it received as the
/// result payload.
pub fn mirror_server() -> ServerConfig {
    sh(r#"IFS= read -r line; printf '{"jsonrpc":"2.0","id":1,"result":%s}\n' "$line""#)
}

/// A server that records its pid in `pid_file`, completes the handshake,
/// then runs `tail` in place of the request loop.
pub fn handshake_then(pid_file: &std::path::Path, tail: &str) -> ServerConfig {
    sh(&format!(
        r#"
echo $$ > '{pid_file}'
IFS= read -r line
printf '{{"jsonrpc":"2.0","id":1,"result":{{"protocolVersion":"2024-11-05","capabilities":{{}},"serverInfo":{{"name":"mock"}}}}}}\n'
IFS= read -r line
{tail}
"#,
        pid_file = pid_file.display(),
    ))
}

/// Whether `pid` names a live (running or stopped, not zombie) process.
#[cfg(target_os = "linux")]
pub fn is_running(pid: i32) -> bool {
    match std::fs::read_to_string(format!("/proc/{pid}/stat")) {
        // The state letter follows the parenthesised command name.
        Ok(stat) => stat
            .rsplit_once(')')
            .map(|(_, rest)| !rest.trim_start().starts_with('Z'))
            .unwrap_or(false),
        Err(_) => false,
    }
}

/// Poll until `pid` is gone or `limit` passes.
#[cfg(target_os = "linux")]
pub async fn wait_gone(pid: i32, limit: std::time::Duration) -> bool {
    let deadline = std::time::Instant::now() + limit;
    while std::time::Instant::now() < deadline {
        if !is_running(pid) {
            return true;
        }
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }
    !is_running(pid)
}

/// Read a pid written by a server script.
pub fn read_pid(path: &std::path::Path) -> i32 {
    std::fs::read_to_string(path).unwrap().trim().parse().unwrap()
}
