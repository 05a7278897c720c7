mod flow_runner;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use reqwest::Client;
use serde_json::json;

use flow_runner::FlowPattern;

#[derive(Parser)]
#[command(name = "taskerctl")]
#[command(version, about = "Statement Tasker command line tool", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Tasker API base URL
    #[arg(long, env = "TASKER_SERVER_URL", default_value = "http://localhost:8090")]
    server_url: String,

    /// Print raw JSON responses
    #[arg(long, global = true)]
    json: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Issue a statement
    Exec {
        /// SQL text
        sql: String,

        /// Execution the invocation belongs to (ad-hoc when omitted)
        #[arg(short, long)]
        execution_id: Option<String>,

        /// Refuse to start while the same statement is running
        #[arg(long)]
        singleton: bool,

        /// Singleton key (defaults to the SQL text)
        #[arg(long, requires = "singleton")]
        singleton_key: Option<String>,
    },

    /// Describe a statement
    Describe {
        /// Statement id, or LATEST
        statement_id: String,

        /// Execution used to resolve LATEST
        #[arg(short, long)]
        execution_id: Option<String>,
    },

    /// Fetch a page of a statement's result
    Result {
        /// Statement id, or LATEST
        statement_id: String,

        /// Execution used to resolve LATEST
        #[arg(short, long)]
        execution_id: Option<String>,

        /// Pagination token from a previous page
        #[arg(long)]
        next_token: Option<String>,
    },

    /// Cancel a statement
    Cancel {
        /// Statement id, or LATEST
        statement_id: String,

        /// Execution used to resolve LATEST
        #[arg(short, long)]
        execution_id: Option<String>,
    },

    /// Show the latest invocation record of an execution
    Latest {
        execution_id: String,
    },

    /// Run an orchestration flow in-process against NATS and the statement service
    #[command(verbatim_doc_comment)]
    Flow {
        #[arg(value_enum)]
        pattern: FlowPattern,

        /// Execution id for the run (generated when omitted)
        #[arg(short, long)]
        execution_id: Option<String>,

        /// Override the flow's SQL
        #[arg(long)]
        sql: Option<String>,

        /// NATS server URL
        #[arg(long, env = "TASKER_NATS_URL", default_value = "nats://localhost:4222")]
        nats_url: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    let base_url = cli.server_url.trim_end_matches('/').to_string();
    let client = Client::new();

    match cli.command {
        Commands::Exec {
            sql,
            execution_id,
            singleton,
            singleton_key,
        } => {
            let action = if singleton {
                "executeSingletonStatement"
            } else {
                "executeStatement"
            };
            let body = json!({
                "action": action,
                "sqlStatement": sql,
                "executionArn": execution_id,
                "singletonKey": singleton_key,
            });
            let result = invoke(&client, &base_url, body).await?;
            print_result(&result, cli.json, "Statement started")?;
        }
        Commands::Describe {
            statement_id,
            execution_id,
        } => {
            let body = json!({
                "action": "describeStatement",
                "statementId": statement_id,
                "executionArn": execution_id,
            });
            let result = invoke(&client, &base_url, body).await?;
            print_result(&result, cli.json, "Statement")?;
        }
        Commands::Result {
            statement_id,
            execution_id,
            next_token,
        } => {
            let body = json!({
                "action": "getStatementResult",
                "statementId": statement_id,
                "executionArn": execution_id,
                "nextToken": next_token,
            });
            let result = invoke(&client, &base_url, body).await?;
            print_result(&result, cli.json, "Result")?;
        }
        Commands::Cancel {
            statement_id,
            execution_id,
        } => {
            let body = json!({
                "action": "cancelStatement",
                "statementId": statement_id,
                "executionArn": execution_id,
            });
            let result = invoke(&client, &base_url, body).await?;
            let cancelled = result.get("Status").and_then(|v| v.as_bool()).unwrap_or(false);
            if cli.json {
                println!("{}", serde_json::to_string(&result)?);
            } else if cancelled {
                println!("Cancel requested");
            } else {
                println!("Statement could not be cancelled");
            }
        }
        Commands::Latest { execution_id } => {
            let url = format!("{}/api/executions/{}/latest", base_url, execution_id);
            let response = client.get(&url).send().await.context("Failed to send latest request")?;
            let result = read_response(response).await?;
            print_result(&result, cli.json, "Latest invocation")?;
        }
        Commands::Flow {
            pattern,
            execution_id,
            sql,
            nats_url,
        } => {
            init_tracing();
            let outcome = flow_runner::run(pattern, &nats_url, execution_id, sql).await?;
            if cli.json {
                println!("{}", serde_json::to_string(&outcome)?);
            } else {
                println!("Flow:     {}", outcome.flow);
                println!("Terminal: {}", outcome.terminal);
                println!("Trace:    {}", outcome.trace.join(" -> "));
                println!("{}", serde_json::to_string_pretty(&outcome.output)?);
            }
            if !outcome.succeeded {
                std::process::exit(1);
            }
        }
    }

    Ok(())
}

fn init_tracing() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn,statement_tasker=info".into()),
        )
        .init();
}

/// Post an invocation request to the tasker API.
async fn invoke(client: &Client, base_url: &str, body: serde_json::Value) -> Result<serde_json::Value> {
    let url = format!("{}/api/invocations", base_url);
    let response = client
        .post(&url)
        .json(&body)
        .send()
        .await
        .context("Failed to send invocation request")?;
    read_response(response).await
}

async fn read_response(response: reqwest::Response) -> Result<serde_json::Value> {
    let status = response.status();
    if status.is_success() {
        return Ok(response.json().await?);
    }

    let text = response.text().await?;
    match serde_json::from_str::<serde_json::Value>(&text) {
        Ok(body) => anyhow::bail!(
            "{} ({}): {}",
            body.get("error").and_then(|v| v.as_str()).unwrap_or("Error"),
            status,
            body.get("cause").and_then(|v| v.as_str()).unwrap_or(&text)
        ),
        Err(_) => anyhow::bail!("Request failed ({}): {}", status, text),
    }
}

fn print_result(result: &serde_json::Value, json_only: bool, title: &str) -> Result<()> {
    if json_only {
        println!("{}", serde_json::to_string(result)?);
    } else {
        println!("{}:", title);
        println!("{}", serde_json::to_string_pretty(result)?);
    }
    Ok(())
}
