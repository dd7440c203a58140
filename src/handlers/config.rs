use crate::cli::{ConfigAction, ConfigFormat};
use anyhow::{Context, Result};
use console::{Term, style};
use dialoguer::Confirm;
use dlqueue::config::ConfigManager;
use std::process;

pub async fn handle_config(config_manager: &mut ConfigManager, action: ConfigAction) -> Result<()> {
    let term = Term::stdout();

    match action {
        ConfigAction::Show { format } => {
            let rendered = match format {
                ConfigFormat::Toml => toml::to_string_pretty(config_manager.config())
                    .context("Failed to serialize config")?,
                ConfigFormat::Json => serde_json::to_string_pretty(config_manager.config())
                    .context("Failed to serialize config")?,
            };

            term.write_line(&format!("{} Current configuration:", style("⚙️").cyan()))?;
            term.write_line("")?;
            term.write_line(&rendered)?;
        }

        ConfigAction::Path => {
            term.write_line(&config_manager.config_file().display().to_string())?;
        }

        ConfigAction::Validate => {
            term.write_line(&format!(
                "{} Validating configuration...",
                style("🔍").cyan()
            ))?;

            match config_manager.validate() {
                Ok(()) => {
                    term.write_line(&format!("{} Configuration is valid", style("✅").green()))?;
                }
                Err(e) => {
                    term.write_line(&format!(
                        "{} Configuration validation failed:",
                        style("❌").red()
                    ))?;
                    term.write_line(&format!("   {:#}", e))?;
                    term.write_line(&format!(
                        "{} Run 'dlqueue config reset' to restore defaults",
                        style("💡").yellow()
                    ))?;
                    process::exit(1);
                }
            }
        }

        ConfigAction::Sample => {
            let sample_file = config_manager.create_sample_config()?;
            term.write_line(&format!(
                "{} Sample configuration created at: {:?}",
                style("✅").green(),
                sample_file
            ))?;
        }

        ConfigAction::Reset { yes } => {
            if !yes {
                let confirmed = Confirm::new()
                    .with_prompt(format!(
                        "Are you sure you want to reset {}?",
                        style(config_manager.config_file().display()).cyan()
                    ))
                    .default(false)
                    .interact()?;

                if !confirmed {
                    term.write_line(&format!("{} Operation cancelled", style("❌").red()))?;
                    return Ok(());
                }
            }

            config_manager.reset()?;
            term.write_line(&format!(
                "{} Configuration reset to defaults",
                style("🔄").cyan()
            ))?;
        }
    }
    Ok(())
}
