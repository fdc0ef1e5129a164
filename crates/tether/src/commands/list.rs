//! List command - show the built-in scenarios

use anyhow::Result;
use clap::Args;
use console::style;

use crate::scenarios::SCENARIOS;
use crate::OutputFormat;

#[derive(Args, Debug)]
pub struct ListArgs {}

pub fn run(_args: ListArgs, format: OutputFormat, use_color: bool) -> Result<()> {
    match format {
        OutputFormat::Text => {
            for scenario in SCENARIOS {
                let name = format!("{:<10}", scenario.name);
                if use_color {
                    println!("  {} {}", style(name).bold(), scenario.summary);
                } else {
                    println!("  {} {}", name, scenario.summary);
                }
            }
        }
        OutputFormat::Json => {
            let scenarios: Vec<_> = SCENARIOS
                .iter()
                .map(|s| {
                    serde_json::json!({
                        "name": s.name,
                        "summary": s.summary,
                    })
                })
                .collect();
            println!("{}", serde_json::to_string_pretty(&scenarios)?);
        }
    }
    Ok(())
}
