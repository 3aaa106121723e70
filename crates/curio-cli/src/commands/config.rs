//! Configuration management commands.

use std::sync::Arc;

use crate::{AppContext, ConfigAction};

pub fn handle(action: ConfigAction, ctx: &Arc<AppContext>) -> anyhow::Result<()> {
    match action {
        ConfigAction::Show => {
            println!("# Config directory: {}", curio_core::Config::config_dir().display());
            print!("{}", toml::to_string_pretty(&ctx.config)?);
        }
    }
    Ok(())
}
