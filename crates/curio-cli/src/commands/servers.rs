//! Server listing command.

use std::sync::Arc;

use crate::AppContext;

pub fn list(ctx: &Arc<AppContext>) {
    if ctx.registry.is_empty() {
        println!("No tool servers configured.");
        println!("Add [tools.servers.<name>] to config.toml or pass --servers-file.");
        return;
    }

    println!("Configured tool servers:");
    for name in ctx.registry.names() {
        if let Some(server) = ctx.registry.get_config(&name) {
            println!("  {:<20} {}", name, describe(server));
        }
    }
}

/// Render a server's launch line, e.g. `docker run -i notes`.
fn describe(server: &curio_core::ServerConfig) -> String {
    std::iter::once(server.command.as_str())
        .chain(server.args.iter().map(String::as_str))
        .collect::<Vec<_>>()
        .join(" ")
}
