//! CLI binary for running one completion or token estimate.

use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::{Parser, Subcommand};
use switchboard_llm::tokens::EstimateMethod;
use switchboard_llm::{ClientConfig, CompletionRequest, LlmClient, LoggingMiddleware, Message, Role};
use switchboard_types::Provider;

#[derive(Parser)]
#[command(name = "switchboard", version, about = "One client for OpenAI, Gemini and Anthropic")]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Send one prompt and print the reply followed by its usage record
    Complete {
        /// Model identifier; its prefix selects the provider
        #[arg(short, long)]
        model: String,

        /// The user prompt
        prompt: String,

        /// System message placed before the prompt
        #[arg(short, long)]
        system: Option<String>,

        /// Sampling temperature
        #[arg(short, long)]
        temperature: Option<f32>,

        /// File holding a JSON schema; enables JSON mode
        #[arg(long)]
        json_schema: Option<PathBuf>,

        /// JSON configuration file (defaults apply to anything omitted)
        #[arg(short, long)]
        config: Option<PathBuf>,
    },

    /// Print a token count for some text
    Estimate {
        /// Model identifier; its prefix selects the estimator
        #[arg(short, long)]
        model: String,

        /// Text to count
        text: String,

        /// How GPT word and character estimates combine: avg, words, chars, max, min
        #[arg(long, default_value = "avg")]
        method: String,

        /// JSON configuration file (defaults apply to anything omitted)
        #[arg(short, long)]
        config: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Setup tracing
    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Commands::Complete {
            model,
            prompt,
            system,
            temperature,
            json_schema,
            config,
        } => {
            cmd_complete(
                model,
                prompt,
                system,
                temperature,
                json_schema.as_deref(),
                config.as_deref(),
            )
            .await?;
        }
        Commands::Estimate {
            model,
            text,
            method,
            config,
        } => {
            cmd_estimate(&model, &text, &method, config.as_deref()).await?;
        }
    }

    Ok(())
}

fn load_config(path: Option<&Path>) -> anyhow::Result<ClientConfig> {
    match path {
        Some(path) => ClientConfig::from_json_file(path)
            .with_context(|| format!("loading config from {}", path.display())),
        None => Ok(ClientConfig::default()),
    }
}

async fn cmd_complete(
    model: String,
    prompt: String,
    system: Option<String>,
    temperature: Option<f32>,
    json_schema: Option<&Path>,
    config: Option<&Path>,
) -> anyhow::Result<()> {
    let client = LlmClient::new(load_config(config)?)?.with_middleware(LoggingMiddleware);

    let mut conversation = Vec::new();
    if let Some(system) = system {
        conversation.push(Message::system(system));
    }
    conversation.push(Message::user(prompt));

    let mut request = CompletionRequest::new(model, conversation);
    if let Some(temperature) = temperature {
        request = request.with_temperature(temperature);
    }
    if let Some(path) = json_schema {
        let schema = std::fs::read_to_string(path)
            .with_context(|| format!("reading schema from {}", path.display()))?;
        request = request.with_json_schema(schema);
    }

    let response = client.complete(&request).await?;
    match response.message.role {
        Role::ToolCall => println!("{}", serde_json::to_string_pretty(&response.message)?),
        _ => println!("{}", response.message.text),
    }
    println!();
    println!("{}", serde_json::to_string_pretty(&response.usage_record)?);

    Ok(())
}

async fn cmd_estimate(
    model: &str,
    text: &str,
    method: &str,
    config: Option<&Path>,
) -> anyhow::Result<()> {
    let method: EstimateMethod = method.parse()?;
    let client = LlmClient::new(load_config(config)?)?;
    let count = client.estimate_tokens_with(model, text, method).await?;

    let exact = matches!(Provider::from_model(model), Some(Provider::Gemini));
    let label = if exact { "exact" } else { "approximate" };
    println!("{count} tokens ({label})");

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_complete() {
        let cli = Cli::parse_from([
            "switchboard",
            "-v",
            "complete",
            "--model",
            "gpt-4o",
            "--system",
            "be terse",
            "2+2?",
        ]);
        assert!(cli.verbose);
        match cli.command {
            Commands::Complete {
                model,
                prompt,
                system,
                ..
            } => {
                assert_eq!(model, "gpt-4o");
                assert_eq!(prompt, "2+2?");
                assert_eq!(system.as_deref(), Some("be terse"));
            }
            _ => panic!("expected complete"),
        }
    }

    #[test]
    fn missing_config_file_is_an_error() {
        assert!(load_config(Some(Path::new("/nonexistent/switchboard.json"))).is_err());
        assert!(load_config(None).is_ok());
    }
}
