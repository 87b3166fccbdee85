//! Build automation tasks for stratum
//!
//! Currently only regenerates the CLI reference from the clap definitions.

use clap::Parser;
use std::fs;
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "xtask")]
#[command(about = "Build automation tasks for stratum", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Parser)]
enum Command {
    /// Generate the CLI reference in markdown
    GenerateCliDocs {
        /// Output directory for generated documentation
        #[arg(short, long, default_value = "docs")]
        output_dir: String,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Command::GenerateCliDocs { output_dir } => generate_cli_docs(&output_dir)?,
    }

    Ok(())
}

fn generate_cli_docs(output_dir: &str) -> anyhow::Result<()> {
    println!("Generating CLI documentation...");

    let markdown = clap_markdown::help_markdown::<stratum_ingest::Cli>();

    let content = format!(
        r#"# stratum-ingest CLI Reference

Auto-generated from the CLI source code. Last updated: {}.

`stratum-ingest` runs one polling cycle of the automated tarball ingestion
pipeline: it discovers tarball/metadata pairs in the staging buckets, books
them through the review ledger, and publishes approved tarballs into their
target repositories. Run it from cron; overlapping invocations skip via the
configured lock file.

{}

## Environment Variables

- `STRATUM_GITHUB_TOKEN` / `GITHUB_TOKEN` - review host API token
- `STRATUM_SLACK_WEBHOOK` - notification webhook (optional)
- `STRATUM_API_TIMEOUT_SECS` - review host request timeout
- `STRATUM_LOG_LEVEL` / `STRATUM_LOG_OUTPUT` / `STRATUM_LOG_DIR` - logging
- `AWS_ACCESS_KEY_ID` / `AWS_SECRET_ACCESS_KEY` - object storage credentials
"#,
        chrono::Utc::now().format("%Y-%m-%d"),
        markdown,
    );

    let output_path = PathBuf::from(output_dir);
    fs::create_dir_all(&output_path)?;
    let file_path = output_path.join("cli-reference.md");
    fs::write(&file_path, content)?;

    println!("CLI documentation written to {}", file_path.display());
    Ok(())
}
