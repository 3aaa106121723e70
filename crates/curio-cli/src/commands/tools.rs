//! Tool listing and invocation commands.

use std::sync::Arc;

use anyhow::Context;
use curio_mcp::ToolClient;
use serde_json::Value;

use crate::AppContext;

/// Resolve `server` to a client: a connected session when `session` is set,
/// otherwise a per-call client.
async fn open_client(
    ctx: &AppContext,
    server: &str,
    session: bool,
) -> anyhow::Result<Box<dyn ToolClient>> {
    let client: Box<dyn ToolClient> = if session {
        Box::new(ctx.registry.connect(server).await?)
    } else {
        let client = ctx.registry.get_client(server)?;
        client.connect().await?;
        Box::new(client)
    };
    Ok(client)
}

pub async fn list(ctx: &Arc<AppContext>, server: &str, session: bool) -> anyhow::Result<()> {
    let client = open_client(ctx, server, session).await?;
    let result = client.list_tools().await;

    if let Err(e) = client.close().await {
        tracing::warn!(server = server, error = %e, "Failed to close client");
    }

    let tools = result.with_context(|| format!("listing tools on '{}'", server))?;
    if tools.is_empty() {
        println!("{} exposes no tools.", server);
        return Ok(());
    }

    println!("Tools on {}:", server);
    for tool in tools {
        match tool.description {
            Some(ref description) => println!("  {:<24} {}", tool.name, description),
            None => println!("  {}", tool.name),
        }
    }

    Ok(())
}

pub async fn call(
    ctx: &Arc<AppContext>,
    server: &str,
    tool: &str,
    args: &str,
    session: bool,
) -> anyhow::Result<()> {
    let arguments = parse_arguments(args)?;

    let client = open_client(ctx, server, session).await?;
    let result = client.call_tool(tool, arguments).await;

    if let Err(e) = client.close().await {
        tracing::warn!(server = server, error = %e, "Failed to close client");
    }

    let output = result.with_context(|| format!("calling '{}' on '{}'", tool, server))?;
    println!("{}", serde_json::to_string_pretty(output.as_value())?);

    if output.is_error() {
        anyhow::bail!("tool '{}' reported an error", tool);
    }

    Ok(())
}

/// Parse `--args`, which must be a JSON object.
fn parse_arguments(args: &str) -> anyhow::Result<Value> {
    let value: Value = serde_json::from_str(args).context("--args is not valid JSON")?;
    if !value.is_object() {
        anyhow::bail!("--args must be a JSON object, got {}", args);
    }
    Ok(value)
}
