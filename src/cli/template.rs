use anyhow::{Context, Result};

const CLIENT_TEMPLATE: &str = include_str!("../../templates/client.toml");
const GATEWAY_TEMPLATE: &str = include_str!("../../templates/gateway.toml");

/// Generate configuration template
pub fn generate_config_template(template_type: &str, output: Option<&str>) -> Result<()> {
    let content = match template_type {
        "client" => CLIENT_TEMPLATE,
        "gateway" => GATEWAY_TEMPLATE,
        other => anyhow::bail!("Unknown template type: {}", other),
    };

    if let Some(path) = output {
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config template to {}", path))?;
        println!(
            "Generated {} configuration template: {}",
            template_type, path
        );
    } else {
        println!("{}", content);
    }

    Ok(())
}
