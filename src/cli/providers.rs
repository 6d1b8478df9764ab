use anyhow::Result;
use console::style;

use crate::core::llm::ProviderRegistry;
use crate::core::llm::registry::{AuthType, PROVIDER_ENV};
use crate::core::terminal::GuideSection;

pub(crate) fn run_providers() -> Result<()> {
    let registry = ProviderRegistry::load()?;
    for def in &registry.providers {
        let mut title = format!("{} ({})", def.name, def.id);
        if !def.aliases.is_empty() {
            title.push_str(&format!(" aka {}", def.aliases.join(", ")));
        }
        let auth = match def.auth.auth_type {
            AuthType::Bearer => "bearer token",
            AuthType::QueryParam => "query parameter",
            AuthType::Header => "API key header",
        };
        GuideSection::new(&title)
            .status("Default model", &def.default_model)
            .status("API key", &def.api_key_env.join(" | "))
            .status("Auth", auth)
            .print();
    }
    println!(
        "\n Select one with {} or {}.\n",
        style("--provider <id>").green(),
        style(format!("{}=<id>", PROVIDER_ENV)).green()
    );
    Ok(())
}
