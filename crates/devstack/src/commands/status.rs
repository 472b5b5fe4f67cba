use super::Project;
use crate::output::{StatusFormat, render_entries};
use anyhow::Result;
use clap::Args;

#[derive(Debug, Args)]
pub struct StatusArgs {
    /// Output format
    #[arg(short, long, value_enum, default_value_t = StatusFormat::Table)]
    format: StatusFormat,
}

pub async fn run(project: &Project, args: StatusArgs) -> Result<u8> {
    let registry = project.registry().await?;
    let entries = registry.list().await;

    if entries.is_empty() && args.format == StatusFormat::Table {
        println!("No services registered in {}", project.dir().display());
        return Ok(0);
    }
    println!("{}", render_entries(&entries, args.format)?);
    Ok(0)
}
